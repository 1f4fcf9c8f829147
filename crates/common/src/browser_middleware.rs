use anyhow::Result;
use std::ffi::OsStr;
use std::fmt::Debug;

/// Everything a page-init middleware may need to know about the page it is
/// hardening. Built by the instance lifecycle from `BrowserConfig`.
#[derive(Debug, Clone)]
pub struct PageEnvironment {
    pub headless: bool,
    /// BCP 47 locale, e.g. "en-US".
    pub locale: String,
    /// IANA timezone identifier, e.g. "UTC".
    pub timezone: String,
}

/// Middleware contributing browser process arguments before launch.
///
/// Implement this to customize the command line of every browser instance the
/// pool creates: stealth flags, container compatibility flags, cache sizing.
/// Middlewares run in configuration order; each sees what the previous ones
/// pushed.
pub trait LaunchParamsMiddleware: Debug + Send + Sync {
    /// Append or adjust launch arguments.
    fn apply_args(&self, args: &mut Vec<&'static OsStr>, headless: bool);

    /// Unique identifier used in logging.
    fn name(&self) -> &str;

    /// Clone this middleware into a Box. Standard implementation:
    /// `Box::new(self.clone())`.
    fn clone_box(&self) -> Box<dyn LaunchParamsMiddleware>;
}

impl Clone for Box<dyn LaunchParamsMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Middleware applied to each freshly opened page before any navigation.
///
/// Runs on instance creation and again after every recycle, so keep the work
/// lightweight. Failures are logged by the caller and never abort page setup.
pub trait PageInitMiddleware: Debug + Send + Sync {
    fn apply(&self, tab: &headless_chrome::browser::tab::Tab, env: &PageEnvironment)
        -> Result<()>;

    /// Unique identifier used in logging.
    fn name(&self) -> &str;

    fn clone_box(&self) -> Box<dyn PageInitMiddleware>;
}

impl Clone for Box<dyn PageInitMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Default hardened launch flag set.
///
/// Covers container compatibility (the namespace sandbox needs SYS_ADMIN,
/// which containers don't grant; /dev/shm is tiny in default containers),
/// anti-automation markers, and render/throttling behavior that matters for
/// short-lived navigation work.
#[derive(Debug, Clone)]
pub struct DefaultLaunchParamsMiddleware;

impl LaunchParamsMiddleware for DefaultLaunchParamsMiddleware {
    fn apply_args(&self, args: &mut Vec<&'static OsStr>, headless: bool) {
        // Container compatibility
        args.push(OsStr::new("--no-sandbox"));
        args.push(OsStr::new("--disable-dev-shm-usage"));
        args.push(OsStr::new("--disable-gpu"));

        // Anti-bot stealth
        args.push(OsStr::new("--disable-blink-features=AutomationControlled"));
        args.push(OsStr::new("--exclude-switches=enable-automation"));

        // Realistic desktop resolution
        args.push(OsStr::new("--window-size=1920,1080"));

        // Startup
        args.push(OsStr::new("--no-first-run"));
        args.push(OsStr::new("--no-default-browser-check"));
        args.push(OsStr::new("--mute-audio"));

        // Keep JS running at full speed while pages sit in the pool
        args.push(OsStr::new("--disable-background-timer-throttling"));
        args.push(OsStr::new("--disable-backgrounding-occluded-windows"));
        args.push(OsStr::new("--disable-renderer-backgrounding"));

        if !headless {
            args.push(OsStr::new("--disable-infobars"));
        }
    }

    fn name(&self) -> &str {
        "default_launch_params"
    }

    fn clone_box(&self) -> Box<dyn LaunchParamsMiddleware> {
        Box::new(self.clone())
    }
}

/// Default page hardening.
///
/// - Replaces "HeadlessChrome" with "Chrome" in the user agent (headless only)
///   and applies it via CDP together with an accept-language derived from the
///   configured locale. The corrected UA is detected once and cached.
/// - Overrides the page timezone and JS locale.
/// - Installs page-level error/console capture so script failures end up in
///   our logs instead of vanishing. The capture never throws into the page.
#[derive(Debug)]
pub struct DefaultPageInitMiddleware {
    corrected_user_agent: std::sync::Mutex<Option<String>>,
}

impl DefaultPageInitMiddleware {
    pub fn new() -> Self {
        Self {
            corrected_user_agent: std::sync::Mutex::new(None),
        }
    }
}

impl Default for DefaultPageInitMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DefaultPageInitMiddleware {
    fn clone(&self) -> Self {
        let cached = self.corrected_user_agent.lock().unwrap().clone();
        Self {
            corrected_user_agent: std::sync::Mutex::new(cached),
        }
    }
}

const PAGE_ERROR_CAPTURE: &str = r#"
(function() {
    if (window.__webscoutPageLog) return;
    window.__webscoutPageLog = { errors: [], consoleErrors: [] };

    window.addEventListener('error', function(e) {
        try {
            window.__webscoutPageLog.errors.push(String(e.message || e));
        } catch (_) {}
    });

    const originalError = console.error;
    console.error = function(...args) {
        try {
            window.__webscoutPageLog.consoleErrors.push(args.map(a => String(a)).join(' '));
        } catch (_) {}
        originalError.apply(console, args);
    };
})()
"#;

impl PageInitMiddleware for DefaultPageInitMiddleware {
    fn apply(
        &self,
        tab: &headless_chrome::browser::tab::Tab,
        env: &PageEnvironment,
    ) -> Result<()> {
        use headless_chrome::protocol::cdp::{Emulation, Network};

        if env.headless {
            let mut ua_guard = self.corrected_user_agent.lock().unwrap();

            let corrected_ua = if let Some(ref ua) = *ua_guard {
                ua.clone()
            } else {
                let result = tab
                    .evaluate("navigator.userAgent", false)
                    .map_err(|e| anyhow::anyhow!("failed to read navigator.userAgent: {}", e))?;

                let corrected = match result.value.as_ref().and_then(|v| v.as_str()) {
                    Some(original) => original.replace("HeadlessChrome", "Chrome"),
                    None => anyhow::bail!("navigator.userAgent did not return a string"),
                };

                tracing::debug!("normalized headless user agent: {}", corrected);
                *ua_guard = Some(corrected.clone());
                corrected
            };
            drop(ua_guard);

            tab.call_method(Network::SetUserAgentOverride {
                user_agent: corrected_ua,
                accept_language: Some(format!("{},en;q=0.9", env.locale)),
                platform: None,
                user_agent_metadata: None,
            })?;
        }

        tab.call_method(Emulation::SetTimezoneOverride {
            timezone_id: env.timezone.clone(),
        })?;
        tab.call_method(Emulation::SetLocaleOverride {
            locale: Some(env.locale.clone()),
        })?;

        tab.evaluate(PAGE_ERROR_CAPTURE, false)?;

        Ok(())
    }

    fn name(&self) -> &str {
        "default_page_init"
    }

    fn clone_box(&self) -> Box<dyn PageInitMiddleware> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_launch_params_include_hardening_flags() {
        let mut args: Vec<&'static OsStr> = Vec::new();
        DefaultLaunchParamsMiddleware.apply_args(&mut args, true);

        let rendered: Vec<&str> = args.iter().filter_map(|a| a.to_str()).collect();
        assert!(rendered.contains(&"--no-sandbox"));
        assert!(rendered.contains(&"--disable-gpu"));
        assert!(rendered.contains(&"--disable-dev-shm-usage"));
        assert!(rendered.contains(&"--disable-blink-features=AutomationControlled"));
        // headful-only flag must not leak into headless launches
        assert!(!rendered.contains(&"--disable-infobars"));
    }

    #[test]
    fn test_headful_adds_infobar_flag() {
        let mut args: Vec<&'static OsStr> = Vec::new();
        DefaultLaunchParamsMiddleware.apply_args(&mut args, false);

        let rendered: Vec<&str> = args.iter().filter_map(|a| a.to_str()).collect();
        assert!(rendered.contains(&"--disable-infobars"));
    }

    #[test]
    fn test_boxed_middlewares_are_cloneable() {
        let launch: Box<dyn LaunchParamsMiddleware> = Box::new(DefaultLaunchParamsMiddleware);
        assert_eq!(launch.clone().name(), "default_launch_params");

        let page: Box<dyn PageInitMiddleware> = Box::new(DefaultPageInitMiddleware::new());
        assert_eq!(page.clone().name(), "default_page_init");
    }

    #[test]
    fn test_clone_preserves_cached_user_agent() {
        let mw = DefaultPageInitMiddleware::new();
        *mw.corrected_user_agent.lock().unwrap() = Some("Mozilla/5.0 Chrome".to_string());

        let cloned = mw.clone();
        assert_eq!(
            cloned.corrected_user_agent.lock().unwrap().as_deref(),
            Some("Mozilla/5.0 Chrome")
        );
    }
}
