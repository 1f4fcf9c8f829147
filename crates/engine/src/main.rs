// Engine binary for docker-compose and local runs.
//
// Configuration comes from WEBSCOUT_* environment variables; anything unset
// falls back to the library defaults.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use webscout_engine::run_engine;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config_from_env();
    run_engine(config).await
}

fn load_config_from_env() -> webscout_common::config::EngineConfig {
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;
    use webscout_common::config::{ConsentMode, EngineConfig};

    fn env_u64(name: &str) -> Option<u64> {
        env::var(name).ok().and_then(|v| v.parse().ok())
    }

    fn env_secs(name: &str) -> Option<Duration> {
        env_u64(name).map(Duration::from_secs)
    }

    let mut config = EngineConfig::default();

    // Pool
    if let Some(v) = env_u64("WEBSCOUT_MAX_BROWSERS") {
        config.pool.max_concurrent_browsers = v as usize;
    }
    if let Some(v) = env_u64("WEBSCOUT_MAX_QUEUE_SIZE") {
        config.pool.max_queue_size = v as usize;
    }
    if let Some(v) = env_secs("WEBSCOUT_QUEUE_TIMEOUT_SECS") {
        config.pool.queue_timeout = v;
    }
    if let Some(v) = env_secs("WEBSCOUT_MAX_PAGE_LOAD_SECS") {
        config.pool.max_page_load_time = v;
    }
    if let Some(v) = env_u64("WEBSCOUT_MAX_MEMORY_MB") {
        config.pool.max_memory_mb = v;
    }
    if let Some(v) = env_u64("WEBSCOUT_FAILURE_CEILING") {
        config.pool.failure_ceiling = v as u32;
    }

    // Navigation
    if let Some(v) = env_u64("WEBSCOUT_MAX_RETRIES") {
        config.navigation.max_retries = v as u32;
    }
    if let Some(v) = env_secs("WEBSCOUT_NAVIGATION_TIMEOUT_SECS") {
        config.navigation.navigation_timeout = v;
    }
    if let Some(v) = env_secs("WEBSCOUT_NETWORK_IDLE_SECS") {
        config.navigation.network_idle_timeout = v;
    }
    if let Some(v) = env_u64("WEBSCOUT_MIN_CONTENT_WORDS") {
        config.navigation.min_content_words = v as usize;
    }
    if let Some(mode) = env::var("WEBSCOUT_CONSENT_MODE")
        .ok()
        .and_then(|s| s.parse::<ConsentMode>().ok())
    {
        config.navigation.consent_mode = mode;
    }

    // Breaker
    if let Some(v) = env_u64("WEBSCOUT_BREAKER_THRESHOLD") {
        config.breaker.failure_threshold = v as u32;
    }
    if let Some(v) = env_secs("WEBSCOUT_BREAKER_RESET_SECS") {
        config.breaker.reset_timeout = v;
    }

    // Browser
    if let Some(v) = env::var("WEBSCOUT_HEADLESS")
        .ok()
        .and_then(|s| s.parse().ok())
    {
        config.browser.headless = v;
    }
    config.browser.binary_path = env::var("WEBSCOUT_BROWSER_PATH").ok().map(PathBuf::from);
    if let Ok(v) = env::var("WEBSCOUT_LOCALE") {
        config.browser.locale = v;
    }
    if let Ok(v) = env::var("WEBSCOUT_TIMEZONE") {
        config.browser.timezone = v;
    }

    // Sessions and screenshots
    if let Some(v) = env_secs("WEBSCOUT_SESSION_TTL_SECS") {
        config.session.ttl = v;
    }
    if let Ok(v) = env::var("WEBSCOUT_SCREENSHOT_DIR") {
        config.screenshot.dir = PathBuf::from(v);
    }

    if let Some(v) = env_u64("WEBSCOUT_METRICS_PORT") {
        config.metrics_port = v as u16;
    }

    config
}
