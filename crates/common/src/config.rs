use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level engine configuration.
///
/// Note: this struct cannot derive Serialize/Deserialize because
/// `BrowserConfig` carries middleware trait objects. Build it programmatically
/// or from environment variables (see the engine binary).
#[derive(Clone)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub navigation: NavigationConfig,
    pub breaker: BreakerConfig,
    pub browser: BrowserConfig,
    pub session: SessionConfig,
    pub screenshot: ScreenshotConfig,
    /// Port for the Prometheus /metrics HTTP server.
    pub metrics_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            navigation: NavigationConfig::default(),
            breaker: BreakerConfig::default(),
            browser: BrowserConfig::default(),
            session: SessionConfig::default(),
            screenshot: ScreenshotConfig::default(),
            metrics_port: 9090,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("pool", &self.pool)
            .field("navigation", &self.navigation)
            .field("breaker", &self.breaker)
            .field("browser", &self.browser)
            .field("session", &self.session)
            .field("screenshot", &self.screenshot)
            .field("metrics_port", &self.metrics_port)
            .finish()
    }
}

/// Pool sizing, admission control and instance lifecycle ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard upper bound on concurrently-running browser instances.
    pub max_concurrent_browsers: usize,
    /// Maximum number of acquisition requests allowed to wait in the
    /// admission queue. Requests arriving beyond this are rejected outright.
    pub max_queue_size: usize,
    /// How long a queued acquisition request may wait before failing.
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// Reference page-load budget. An instance idle for longer than twice
    /// this value is evicted by the maintenance sweep.
    #[serde(with = "humantime_serde")]
    pub max_page_load_time: Duration,
    /// Per-instance memory ceiling. Instances reporting more are evicted.
    pub max_memory_mb: u64,
    /// Failures an instance may accumulate before it is evicted.
    pub failure_ceiling: u32,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl PoolConfig {
    /// Idle window after which the sweep evicts an instance.
    pub fn idle_eviction_window(&self) -> Duration {
        self.max_page_load_time * 2
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_browsers: 3,
            max_queue_size: 10,
            queue_timeout: Duration::from_secs(30),
            max_page_load_time: Duration::from_secs(30),
            max_memory_mb: 512,
            failure_ceiling: 3,
            health_check_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Navigation protocol knobs: retry budget, backoff shape, wait windows and
/// URL validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    /// Per-attempt ceiling for the navigate call itself.
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    /// How long to wait for the network to settle after the navigate call
    /// returns, before giving up and validating whatever loaded.
    #[serde(with = "humantime_serde")]
    pub network_idle_timeout: Duration,
    /// Minimum visible word count for a page to count as real content.
    pub min_content_words: usize,
    /// URL schemes accepted by `safe_navigate`. Lowercase, no trailing colon.
    pub allowed_protocols: Vec<String>,
    pub max_url_length: usize,
    pub consent_mode: ConsentMode,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
            navigation_timeout: Duration::from_secs(30),
            network_idle_timeout: Duration::from_secs(5),
            min_content_words: 50,
            allowed_protocols: vec!["http".to_string(), "https".to_string()],
            max_url_length: 2048,
            consent_mode: ConsentMode::default(),
        }
    }
}

/// How aggressively the navigator handles consent walls.
///
/// - `Full`: pre-seed consent cookies before navigation and click accept
///   controls on matching pages afterwards (default).
/// - `Seed`: cookie pre-seeding only, no post-navigation clicking.
/// - `Off`: consent handling disabled entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentMode {
    #[default]
    Full,
    Seed,
    Off,
}

impl ConsentMode {
    pub fn seeds_cookies(&self) -> bool {
        !matches!(self, Self::Off)
    }

    pub fn dismisses_banners(&self) -> bool {
        matches!(self, Self::Full)
    }
}

impl FromStr for ConsentMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "seed" => Ok(Self::Seed),
            "off" => Ok(Self::Off),
            _ => Err(()),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive acquisition failures that trip the breaker OPEN.
    pub failure_threshold: u32,
    /// Cooldown after the last failure before the breaker goes HALF_OPEN.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Cadence of the background monitor that drives OPEN -> HALF_OPEN.
    #[serde(with = "humantime_serde")]
    pub monitoring_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_interval: Duration::from_secs(5),
        }
    }
}

/// Browser launch and page hardening configuration.
///
/// Not serializable: middleware entries are trait objects. The middleware
/// vectors are applied in order; each can add or adjust what the previous
/// ones produced.
#[derive(Clone)]
pub struct BrowserConfig {
    /// Path to the browser binary. None means driver auto-detection.
    pub binary_path: Option<PathBuf>,
    pub headless: bool,
    pub window_size: (u32, u32),
    /// BCP 47 locale applied to each page (accept-language + JS locale).
    pub locale: String,
    /// IANA timezone identifier applied to each page.
    pub timezone: String,
    /// Keep the driver WebSocket alive while instances sit idle between
    /// requests. The driver default (30s) drops the connection mid-pool.
    pub idle_browser_timeout: Duration,
    /// Middlewares contributing browser process arguments (run before launch).
    pub launch_params_middlewares:
        Vec<Box<dyn crate::browser_middleware::LaunchParamsMiddleware>>,
    /// Middlewares applied to each fresh page before any navigation.
    pub page_init_middlewares: Vec<Box<dyn crate::browser_middleware::PageInitMiddleware>>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            headless: true,
            window_size: (1920, 1080),
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            idle_browser_timeout: Duration::from_secs(3600),
            launch_params_middlewares: vec![Box::new(
                crate::browser_middleware::DefaultLaunchParamsMiddleware,
            )],
            page_init_middlewares: vec![Box::new(
                crate::browser_middleware::DefaultPageInitMiddleware::new(),
            )],
        }
    }
}

impl std::fmt::Debug for BrowserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let launch_names: Vec<&str> = self
            .launch_params_middlewares
            .iter()
            .map(|m| m.name())
            .collect();
        let page_names: Vec<&str> = self
            .page_init_middlewares
            .iter()
            .map(|m| m.name())
            .collect();

        f.debug_struct("BrowserConfig")
            .field("binary_path", &self.binary_path)
            .field("headless", &self.headless)
            .field("window_size", &self.window_size)
            .field("locale", &self.locale)
            .field("timezone", &self.timezone)
            .field("idle_browser_timeout", &self.idle_browser_timeout)
            .field("launch_params_middlewares", &launch_names)
            .field("page_init_middlewares", &page_names)
            .finish()
    }
}

/// Session store retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions with no activity for this long are dropped by the cleanup
    /// task.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Cap on stored results per session; oldest are dropped beyond it.
    pub max_results_per_session: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_results_per_session: 100,
        }
    }
}

/// Screenshot persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    pub dir: PathBuf,
    /// Captures larger than this are rejected rather than written.
    pub max_bytes: u64,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("screenshots"),
            max_bytes: 10 * 1024 * 1024,
        }
    }
}
