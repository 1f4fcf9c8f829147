//! A single pooled browser instance: one Chrome process, one isolated CDP
//! context, one reusable tab.
//!
//! Creation and recycling talk to the driver synchronously; the pool runs
//! them inside `spawn_blocking`.

use anyhow::Result;
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use webscout_common::browser_middleware::PageEnvironment;
use webscout_common::config::BrowserConfig;
use webscout_common::types::InstanceMetadata;

pub struct BrowserInstance {
    browser: Browser,
    /// Current isolated CDP context id. Replaced on recycle.
    context_id: Mutex<String>,
    /// The instance's reusable tab. None after a hard-timeout abort closed
    /// it; recycling restores it.
    tab: Mutex<Option<Arc<Tab>>>,
    pub meta: InstanceMetadata,
}

impl BrowserInstance {
    /// Launch a browser process and prepare its isolated context and tab.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn create(config: &BrowserConfig, default_timeout: Duration) -> Result<Self> {
        if let Some(ref binary_path) = config.binary_path {
            verify_browser_binary(binary_path);
        }

        let mut chrome_args: Vec<&'static OsStr> = Vec::new();
        for middleware in &config.launch_params_middlewares {
            middleware.apply_args(&mut chrome_args, config.headless);
        }

        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(config.headless)
            .window_size(Some(config.window_size))
            // The driver default (30s) drops the WebSocket while an instance
            // sits idle in the pool, surfacing as "connection is closed".
            .idle_browser_timeout(config.idle_browser_timeout)
            .args(chrome_args);

        if let Some(ref binary_path) = config.binary_path {
            launch_builder.path(Some(binary_path.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build launch options: {}", e))?;

        let browser = Browser::new(launch_options).map_err(|e| {
            tracing::error!(
                "browser failed to launch: {}. Common causes: --no-sandbox missing \
                 in a container, binary not found, missing shared libraries",
                e
            );
            e
        })?;

        let meta = InstanceMetadata::new();
        let (context_id, tab) = new_context_tab(&browser, config, default_timeout)?;

        info!(
            instance_id = %meta.id,
            context_id = %context_id,
            "launched browser instance"
        );

        Ok(Self {
            browser,
            context_id: Mutex::new(context_id),
            tab: Mutex::new(Some(tab)),
            meta,
        })
    }

    /// Clone of the instance's tab, if the page is currently open.
    pub fn tab(&self) -> Option<Arc<Tab>> {
        self.tab.lock().unwrap().clone()
    }

    /// Reset the instance for reuse: close the old tab and stand up a fresh
    /// isolated CDP context. The old context object lingers empty in the
    /// browser process (the driver exposes no disposal call), but its
    /// cookies and storage are unreachable from the new context, and it dies
    /// with the process when the instance is destroyed.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn recycle(&self, config: &BrowserConfig, default_timeout: Duration) -> Result<()> {
        let old_tab = self.tab.lock().unwrap().take();
        if let Some(tab) = old_tab {
            if let Err(e) = tab.close(false) {
                debug!(
                    instance_id = %self.meta.id,
                    "closing old tab during recycle failed (may already be gone): {}",
                    e
                );
            }
        }

        let (context_id, tab) = new_context_tab(&self.browser, config, default_timeout)?;

        info!(
            instance_id = %self.meta.id,
            context_id = %context_id,
            total_requests = self.meta.total_requests.load(std::sync::atomic::Ordering::SeqCst),
            "recycled browser instance"
        );

        *self.context_id.lock().unwrap() = context_id;
        *self.tab.lock().unwrap() = Some(tab);
        self.meta.reset_for_recycle();
        Ok(())
    }

    /// Tear the instance down. Close failures are logged and swallowed; the
    /// process dies with the `Browser` drop regardless.
    pub fn destroy(&self) {
        if let Some(tab) = self.tab.lock().unwrap().take() {
            if let Err(e) = tab.close(false) {
                debug!(
                    instance_id = %self.meta.id,
                    "closing tab during destroy failed: {}",
                    e
                );
            }
        }
        debug!(instance_id = %self.meta.id, "destroyed browser instance");
    }
}

fn new_context_tab(
    browser: &Browser,
    config: &BrowserConfig,
    default_timeout: Duration,
) -> Result<(String, Arc<Tab>)> {
    let context = browser
        .new_context()
        .map_err(|e| anyhow::anyhow!("failed to create isolated CDP context: {}", e))?;
    let context_id = context.get_id().to_string();

    let tab = context
        .new_tab()
        .map_err(|e| anyhow::anyhow!("failed to create tab in context {}: {}", context_id, e))?;
    tab.set_default_timeout(default_timeout);

    let env = PageEnvironment {
        headless: config.headless,
        locale: config.locale.clone(),
        timezone: config.timezone.clone(),
    };
    for middleware in &config.page_init_middlewares {
        if let Err(e) = middleware.apply(&tab, &env) {
            warn!(
                "failed to apply page init middleware '{}': {}",
                middleware.name(),
                e
            );
        }
    }

    Ok((context_id, tab))
}

/// Pre-flight check: verify the browser binary exists and log diagnostics.
#[cfg(unix)]
fn verify_browser_binary(binary_path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if !binary_path.exists() {
        warn!(
            "browser binary not found at '{}'; the driver will attempt auto-detection",
            binary_path.display()
        );
        return;
    }

    match std::fs::metadata(binary_path) {
        Ok(metadata) => {
            let mode = metadata.permissions().mode();
            if mode & 0o111 == 0 {
                warn!(
                    "browser binary '{}' exists but is not executable (mode: {:o})",
                    binary_path.display(),
                    mode
                );
            } else {
                info!(
                    "browser binary verified: '{}' (mode: {:o})",
                    binary_path.display(),
                    mode
                );
            }
        }
        Err(e) => {
            warn!(
                "cannot read metadata for browser binary '{}': {}",
                binary_path.display(),
                e
            );
        }
    }

    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        info!(
            "running as non-root user (uid: {}); if the browser fails to start, \
             check container security context and capabilities",
            uid
        );
    }
}

#[cfg(not(unix))]
fn verify_browser_binary(binary_path: &std::path::Path) {
    if !binary_path.exists() {
        warn!(
            "browser binary not found at '{}'; the driver will attempt auto-detection",
            binary_path.display()
        );
    }
}

// ==================== Driver Error Sniffing ====================

/// The browser process or its WebSocket is gone; the whole instance must be
/// destroyed, not recycled.
pub fn is_dead_browser_error(message: &str) -> bool {
    message.contains("connection is closed") || message.contains("No such process")
}

/// The tab's CDP session is gone but the browser may still be healthy; the
/// instance can be recycled in place.
pub fn is_dead_tab_error(message: &str) -> bool {
    message.contains("No session with given id")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Error Sniffing Tests ====================

    #[test]
    fn test_dead_browser_detection() {
        assert!(is_dead_browser_error(
            "Unable to make method calls because underlying connection is closed"
        ));
        assert!(is_dead_browser_error("No such process (os error 3)"));
        assert!(!is_dead_browser_error("Navigation timed out"));
    }

    #[test]
    fn test_dead_tab_detection() {
        assert!(is_dead_tab_error("No session with given id"));
        assert!(!is_dead_tab_error("connection is closed"));
    }
}
