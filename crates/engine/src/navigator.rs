//! Guarded navigation: URL validation, consent handling, retry with
//! backoff, quiescence waiting and page validation, in that order.
//!
//! Every driver call is blocking, so each step runs in `spawn_blocking`
//! raced against the shutdown token and a hard timeout. On hard timeout the
//! tab is closed to abort whatever CDP call is stuck; the instance's page is
//! then gone and the pool recycles it before the next hand-out.

use std::sync::Arc;
use std::time::Duration;

use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Network::CookieParam;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use webscout_common::config::NavigationConfig;
use webscout_common::consent;
use webscout_common::error::NavigationError;
use webscout_common::types::NavigationOutcome;
use webscout_common::validator::{self, ValidationFailure};
use webscout_common::wait::{self, QuiescenceOutcome};

/// Delay before re-checking a page that validated as not-yet-usable for a
/// reason other than bot protection (late-rendering SPA content).
const RECHECK_DELAY: Duration = Duration::from_millis(1500);
const MAX_RECHECKS: u32 = 2;

/// Extra headroom on top of a step's internal timeout before the hard abort
/// closes the tab.
const HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// How one blocking navigation step ended.
enum AttemptError {
    Cancelled,
    Failed(String),
}

pub struct Navigator {
    config: NavigationConfig,
    shutdown: CancellationToken,
}

impl Navigator {
    pub fn new(config: NavigationConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Check a raw URL against the allowed schemes and length limit. No
    /// navigation happens for URLs that fail here.
    pub fn validate_url(&self, raw: &str) -> Result<Url, NavigationError> {
        if raw.len() > self.config.max_url_length {
            return Err(NavigationError::UrlTooLong {
                len: raw.len(),
                max: self.config.max_url_length,
            });
        }

        let url = Url::parse(raw).map_err(|e| NavigationError::InvalidUrl(e.to_string()))?;

        let scheme = url.scheme().to_lowercase();
        if !self.config.allowed_protocols.iter().any(|p| p == &scheme) {
            return Err(NavigationError::DisallowedProtocol { scheme });
        }

        Ok(url)
    }

    /// Navigate the tab to `raw_url` with the full protocol: validation,
    /// consent cookie seeding, retries with backoff, quiescence wait,
    /// consent dismissal and page validation.
    pub async fn safe_navigate(
        &self,
        tab: &Arc<Tab>,
        raw_url: &str,
        ray_id: &str,
    ) -> Result<NavigationOutcome, NavigationError> {
        let url = self.validate_url(raw_url)?;

        if self.config.consent_mode.seeds_cookies() {
            self.seed_consent_cookies(tab, &url, ray_id).await;
        }

        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.max_retries {
            if attempt > 1 {
                let delay = backoff_delay(
                    attempt,
                    self.config.initial_retry_delay,
                    self.config.max_retry_delay,
                    rand::random::<f64>(),
                );
                debug!(
                    ray_id = %ray_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(NavigationError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(tab, &url, attempt, ray_id).await {
                Ok(outcome) => {
                    info!(
                        ray_id = %ray_id,
                        attempt,
                        final_url = %outcome.final_url,
                        "navigation succeeded"
                    );
                    return Ok(outcome);
                }
                Err(NavigationError::Cancelled) => return Err(NavigationError::Cancelled),
                // Terminal regardless of remaining budget: the same redirect
                // would fire again.
                Err(e @ NavigationError::RedirectBlocked { .. }) => return Err(e),
                Err(NavigationError::Exhausted { last_error: m, .. }) => {
                    warn!(ray_id = %ray_id, attempt, "navigation attempt failed: {}", m);
                    last_error = m;
                }
                Err(e) => return Err(e),
            }
        }

        Err(NavigationError::Exhausted {
            attempts: self.config.max_retries,
            last_error,
        })
    }

    /// One attempt: navigate, wait for quiescence, probe the HTTP status,
    /// dismiss consent and validate. Per-attempt failures come back as
    /// single-attempt `Exhausted` values for the retry loop to absorb.
    async fn attempt(
        &self,
        tab: &Arc<Tab>,
        url: &Url,
        attempt: u32,
        ray_id: &str,
    ) -> Result<NavigationOutcome, NavigationError> {
        let fail = |message: String| NavigationError::Exhausted {
            attempts: 1,
            last_error: message,
        };

        // Navigate.
        {
            let tab = tab.clone();
            let target = url.to_string();
            let hard_timeout = self.config.navigation_timeout + HARD_TIMEOUT_MARGIN;
            self.drive(tab.clone(), hard_timeout, ray_id, move || {
                tab.navigate_to(&target).map_err(|e| e.to_string())?;
                tab.wait_until_navigated().map_err(|e| e.to_string())?;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                AttemptError::Cancelled => NavigationError::Cancelled,
                AttemptError::Failed(m) => fail(format!("navigate failed: {}", m)),
            })?;
        }

        // Let the network settle.
        let quiescence = {
            let tab = tab.clone();
            let token = self.shutdown.clone();
            let ray = ray_id.to_string();
            let idle_window = self.config.network_idle_timeout;
            let hard_timeout = wait::effective_wait(idle_window) + HARD_TIMEOUT_MARGIN;
            self.drive(tab.clone(), hard_timeout, ray_id, move || {
                wait::wait_for_quiescence(&tab, idle_window, &token, &ray)
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| match e {
                AttemptError::Cancelled => NavigationError::Cancelled,
                AttemptError::Failed(m) => fail(format!("quiescence wait failed: {}", m)),
            })?
        };

        if let QuiescenceOutcome::ErrorStatus(status) = quiescence {
            return Err(fail(format!("http status {}", status)));
        }

        // Status probe: a served error page fails the attempt even when the
        // network went quiet.
        let status = {
            let tab = tab.clone();
            self.drive(tab.clone(), Duration::from_secs(15), ray_id, move || {
                Ok(wait::probe_http_status(&tab))
            })
            .await
            .unwrap_or_else(|_| None)
        };
        if let Some(code) = status {
            if wait::is_failure_status(code) {
                return Err(fail(format!("http status {}", code)));
            }
        }

        if self.config.consent_mode.dismisses_banners() {
            self.dismiss_consent(tab, ray_id).await;
        }

        // Validate, with re-checks for late-rendering content.
        let mut rechecks = 0;
        loop {
            let signals = {
                let tab = tab.clone();
                self.drive(tab.clone(), Duration::from_secs(15), ray_id, move || {
                    validator::collect_signals(&tab).map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| match e {
                    AttemptError::Cancelled => NavigationError::Cancelled,
                    AttemptError::Failed(m) => fail(format!("signal collection failed: {}", m)),
                })?
            };

            match validator::evaluate(&signals, self.config.min_content_words) {
                Ok(()) => {
                    let redirected = signals.final_url != url.as_str();
                    if redirected {
                        self.check_final_scheme(&signals.final_url)?;
                    }
                    return Ok(NavigationOutcome {
                        requested_url: url.to_string(),
                        final_url: signals.final_url,
                        title: signals.title,
                        status: status.map(|s| s as i64),
                        attempts: attempt,
                        redirected,
                    });
                }
                Err(ValidationFailure::MaliciousScheme { scheme }) => {
                    return Err(NavigationError::RedirectBlocked { scheme });
                }
                Err(failure) if failure.is_bot_protection() => {
                    // No amount of waiting clears a challenge page.
                    return Err(fail(failure.to_string()));
                }
                Err(failure) => {
                    if rechecks >= MAX_RECHECKS {
                        return Err(fail(failure.to_string()));
                    }
                    rechecks += 1;
                    debug!(
                        ray_id = %ray_id,
                        rechecks,
                        "page not yet usable ({}), re-checking",
                        failure
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(NavigationError::Cancelled),
                        _ = tokio::time::sleep(RECHECK_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Re-validate the scheme of a post-redirect final URL against the
    /// allowed set. The pre-navigation check only ever saw the requested
    /// URL; a redirect can land anywhere.
    fn check_final_scheme(&self, final_url: &str) -> Result<(), NavigationError> {
        let scheme = match Url::parse(final_url) {
            Ok(parsed) => parsed.scheme().to_lowercase(),
            Err(_) => {
                return Err(NavigationError::RedirectBlocked {
                    scheme: "unparsable".to_string(),
                })
            }
        };
        if self.config.allowed_protocols.iter().any(|p| p == &scheme) {
            Ok(())
        } else {
            Err(NavigationError::RedirectBlocked { scheme })
        }
    }

    /// Seed consent cookies for the target host before navigating. Failures
    /// are logged and swallowed; the dismissal pass is the fallback.
    async fn seed_consent_cookies(&self, tab: &Arc<Tab>, url: &Url, ray_id: &str) {
        let Some(host) = url.host_str().map(str::to_string) else {
            return;
        };

        let cookies: Vec<CookieParam> = consent::consent_cookies_for(&host)
            .into_iter()
            .map(|c| CookieParam {
                name: c.name.to_string(),
                value: c.value.to_string(),
                url: None,
                domain: Some(c.domain),
                path: Some("/".to_string()),
                secure: None,
                http_only: None,
                same_site: None,
                expires: None,
                priority: None,
                same_party: None,
                source_scheme: None,
                source_port: None,
                partition_key: None,
            })
            .collect();

        let seeded = {
            let tab = tab.clone();
            self.drive(tab.clone(), Duration::from_secs(15), ray_id, move || {
                tab.set_cookies(cookies).map_err(|e| e.to_string())
            })
            .await
        };

        match seeded {
            Ok(()) => debug!(ray_id = %ray_id, host = %host, "seeded consent cookies"),
            Err(AttemptError::Cancelled) => {}
            Err(AttemptError::Failed(m)) => {
                debug!(ray_id = %ray_id, host = %host, "consent cookie seeding failed: {}", m);
            }
        }
    }

    /// Best-effort consent banner dismissal: pull candidate button texts out
    /// of likely consent containers, match them against the accept-phrase
    /// table in Rust, then click the matching one by index.
    ///
    /// Only hosts behind a known regional consent wall are touched at all;
    /// everywhere else an accept-looking button (a terms checkbox, a signup
    /// form) must be left alone.
    async fn dismiss_consent(&self, tab: &Arc<Tab>, ray_id: &str) {
        let current_url = tab.get_url();
        let Some(host) = consent_dismissal_host(&current_url) else {
            debug!(
                ray_id = %ray_id,
                url = %current_url,
                "host not behind a known consent wall, leaving page untouched"
            );
            return;
        };

        let texts = {
            let tab = tab.clone();
            self.drive(tab.clone(), Duration::from_secs(15), ray_id, move || {
                collect_consent_candidates(&tab).map_err(|e| e.to_string())
            })
            .await
        };

        let texts = match texts {
            Ok(texts) => texts,
            Err(AttemptError::Cancelled) => return,
            Err(AttemptError::Failed(m)) => {
                debug!(ray_id = %ray_id, "consent candidate collection failed: {}", m);
                return;
            }
        };

        let Some((index, phrase)) = texts
            .iter()
            .enumerate()
            .find_map(|(i, t)| consent::matches_accept_phrase(t).map(|p| (i, p)))
        else {
            return;
        };

        debug!(
            ray_id = %ray_id,
            host = %host,
            phrase = phrase.phrase,
            locale = phrase.locale,
            "clicking consent accept control"
        );

        let clicked = {
            let tab = tab.clone();
            self.drive(tab.clone(), Duration::from_secs(15), ray_id, move || {
                click_consent_candidate(&tab, index).map_err(|e| e.to_string())
            })
            .await
        };

        match clicked {
            Ok(()) => {
                // Give the banner a moment to leave the DOM.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(AttemptError::Cancelled) => {}
            Err(AttemptError::Failed(m)) => {
                debug!(ray_id = %ray_id, "consent click failed: {}", m);
            }
        }
    }

    /// Run a blocking driver call off the async runtime, raced against
    /// shutdown and a hard timeout. On hard timeout the tab is closed to
    /// abort the stuck call.
    async fn drive<T, F>(
        &self,
        tab_for_abort: Arc<Tab>,
        hard_timeout: Duration,
        ray_id: &str,
        op: F,
    ) -> Result<T, AttemptError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(op);

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                let _ = tab_for_abort.close(false);
                Err(AttemptError::Cancelled)
            }
            _ = tokio::time::sleep(hard_timeout) => {
                warn!(
                    ray_id = %ray_id,
                    "hard timeout after {:?}, closing tab to abort stuck call",
                    hard_timeout
                );
                let _ = tab_for_abort.close(false);
                Err(AttemptError::Failed(format!(
                    "hard timeout after {:?}; tab closed to abort",
                    hard_timeout
                )))
            }
            joined = handle => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(AttemptError::Failed(message)),
                Err(join_err) => Err(AttemptError::Failed(format!(
                    "driver task panicked: {}",
                    join_err
                ))),
            }
        }
    }
}

/// Exponential backoff with full-range jitter kept pure for testing:
/// `base = min(initial * 2^(attempt-2), max)`, scaled by `0.5 + 0.5*jitter`
/// with `jitter` in `[0, 1)`. `attempt` is the attempt about to run (2 for
/// the first retry).
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(2).min(16);
    let base = initial
        .saturating_mul(1u32 << exponent)
        .min(max);
    base.mul_f64(0.5 + 0.5 * jitter.clamp(0.0, 1.0))
}

/// The host to run consent dismissal against, if the current URL sits in a
/// known consent region. `None` means dismissal must not touch the page.
fn consent_dismissal_host(current_url: &str) -> Option<String> {
    let url = Url::parse(current_url).ok()?;
    let host = url.host_str()?;
    if consent::is_consent_region(host) {
        Some(host.to_string())
    } else {
        None
    }
}

fn collect_consent_candidates(tab: &Arc<Tab>) -> anyhow::Result<Vec<String>> {
    let selector_json = serde_json::to_string(consent::container_selector())?;
    let js = format!(
        r#"
        (() => {{
            const containers = document.querySelectorAll({selector_json});
            const texts = [];
            outer: for (const container of containers) {{
                const controls = container.querySelectorAll('button, [role=button], a');
                for (const control of controls) {{
                    const text = (control.innerText || control.textContent || '').trim();
                    if (text && text.length <= 100) texts.push(text);
                    if (texts.length >= 50) break outer;
                }}
            }}
            return JSON.stringify(texts);
        }})()
        "#
    );

    let result = tab.evaluate(&js, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "[]".to_string());
    Ok(serde_json::from_str(&raw)?)
}

/// Click the candidate at `index`, enumerating in the same order as
/// collection so indices line up.
fn click_consent_candidate(tab: &Arc<Tab>, index: usize) -> anyhow::Result<()> {
    let selector_json = serde_json::to_string(consent::container_selector())?;
    let js = format!(
        r#"
        (() => {{
            const containers = document.querySelectorAll({selector_json});
            const candidates = [];
            outer: for (const container of containers) {{
                const controls = container.querySelectorAll('button, [role=button], a');
                for (const control of controls) {{
                    const text = (control.innerText || control.textContent || '').trim();
                    if (text && text.length <= 100) candidates.push(control);
                    if (candidates.length >= 50) break outer;
                }}
            }}
            const target = candidates[{index}];
            if (!target) return false;
            target.click();
            return true;
        }})()
        "#
    );

    let result = tab.evaluate(&js, false)?;
    let clicked = result.value.and_then(|v| v.as_bool()).unwrap_or(false);
    if !clicked {
        anyhow::bail!("consent candidate {} no longer present", index);
    }
    Ok(())
}
