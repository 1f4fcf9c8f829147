//! Page quiescence detection after navigation.
//!
//! Navigation returning does not mean a page is ready: scripts keep
//! fetching, consent overlays render late, and challenge pages may never
//! go network-idle at all. This module watches a freshly navigated tab
//! until network activity settles, a hard ceiling elapses, or the response
//! status makes further waiting pointless.

use anyhow::Result;
use headless_chrome::Tab;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Ceiling applied to any requested quiescence wait.
pub const MAX_QUIESCENCE_WAIT: Duration = Duration::from_secs(40);

/// Fallback when a zero wait is requested.
pub const DEFAULT_QUIESCENCE_WAIT: Duration = Duration::from_secs(10);

/// HTTP statuses that end the wait immediately. Challenge and rate-limit
/// pages keep polling in the background and may never go idle.
const EARLY_EXIT_STATUSES: &[u32] = &[403, 429];

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a quiescence wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiescenceOutcome {
    /// Network activity settled before the ceiling.
    Quiet,
    /// The ceiling elapsed with network activity still in flight;
    /// the caller proceeds with whatever loaded.
    CeilingReached,
    /// An error status was detected mid-wait.
    ErrorStatus(u32),
}

/// Clamp a configured quiescence wait into the supported range.
pub fn effective_wait(requested: Duration) -> Duration {
    if requested.is_zero() {
        DEFAULT_QUIESCENCE_WAIT
    } else if requested > MAX_QUIESCENCE_WAIT {
        MAX_QUIESCENCE_WAIT
    } else {
        requested
    }
}

/// Whether an HTTP status fails a navigation attempt.
pub fn is_failure_status(status: u32) -> bool {
    status >= 400
}

/// Read the HTTP status of the last navigation from the performance API.
///
/// Returns `None` when the browser does not expose `responseStatus`
/// (pre-109 Chrome) or the page has no navigation entry yet.
pub fn probe_http_status(tab: &Arc<Tab>) -> Option<u32> {
    let result = tab
        .evaluate(
            "performance.getEntriesByType('navigation')[0]?.responseStatus || 0",
            false,
        )
        .ok()?;

    let status = result.value.and_then(|v| v.as_u64())? as u32;
    if status == 0 {
        None
    } else {
        Some(status)
    }
}

/// Block until the tab goes network-idle, the ceiling elapses, or an
/// early-exit status is detected.
///
/// Idle detection runs `wait_until_navigated` on a background thread
/// (it blocks with no timeout hook of its own) while this thread polls
/// for completion, cancellation and error statuses. Must be called from
/// a blocking context, never from an async task.
pub fn wait_for_quiescence(
    tab: &Arc<Tab>,
    requested_wait: Duration,
    cancellation_token: &CancellationToken,
    ray_id: &str,
) -> Result<QuiescenceOutcome> {
    let start = Instant::now();
    let ceiling = effective_wait(requested_wait);
    tab.set_default_timeout(ceiling);

    // Shared state for idle detection: (is_finished, result)
    let idle_finished = Arc::new(Mutex::new((false, None::<Result<()>>)));

    let tab_clone = tab.clone();
    let idle_finished_clone = idle_finished.clone();
    std::thread::spawn(move || {
        let result = tab_clone
            .wait_until_navigated()
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("navigation wait failed: {}", e));

        let mut guard = idle_finished_clone.lock().unwrap();
        guard.0 = true;
        guard.1 = Some(result);
    });

    let outcome = loop {
        if cancellation_token.is_cancelled() {
            anyhow::bail!("cancelled while waiting for page quiescence");
        }

        {
            let guard = idle_finished.lock().unwrap();
            if guard.0 {
                match guard.1.as_ref().unwrap() {
                    Ok(_) => {
                        tracing::debug!(
                            ray_id = %ray_id,
                            "network settled after {:?}",
                            start.elapsed()
                        );
                        break QuiescenceOutcome::Quiet;
                    }
                    Err(e) => return Err(anyhow::anyhow!("{}", e)),
                }
            }
        }

        if let Some(status) = probe_http_status(tab) {
            if EARLY_EXIT_STATUSES.contains(&status) {
                tracing::info!(
                    ray_id = %ray_id,
                    "early exit: HTTP {} detected after {:?}",
                    status,
                    start.elapsed()
                );
                return Ok(QuiescenceOutcome::ErrorStatus(status));
            }
        }

        if start.elapsed() >= ceiling {
            tracing::warn!(
                ray_id = %ray_id,
                "quiescence ceiling {:?} reached with network still active",
                ceiling
            );
            break QuiescenceOutcome::CeilingReached;
        }

        let remaining = ceiling.saturating_sub(start.elapsed());
        if remaining < POLL_INTERVAL {
            sleep(remaining);
            continue;
        }
        sleep(POLL_INTERVAL);
    };

    // Network idle does not guarantee async scripts have executed; give
    // the document a bounded chance to reach readyState complete.
    if outcome == QuiescenceOutcome::Quiet {
        let budget = std::cmp::min(
            Duration::from_secs(10),
            ceiling.saturating_sub(start.elapsed()),
        );
        settle_document(tab, budget, ray_id);
    }

    Ok(outcome)
}

/// Wait for the document `load` event after network idle, bounded by
/// `budget`. Failures are logged and swallowed; a page stuck in
/// `interactive` is still worth validating.
fn settle_document(tab: &Arc<Tab>, budget: Duration, ray_id: &str) {
    if budget < Duration::from_millis(100) {
        tracing::warn!(
            ray_id = %ray_id,
            "skipping document settle, only {:?} left before ceiling",
            budget
        );
        return;
    }

    let script = format!(
        r#"
        (async function() {{
            const result = await new Promise((resolve) => {{
                if (document.readyState === 'complete') {{
                    resolve({{ state: 'already-complete', timeMs: 0 }});
                }} else {{
                    const startTime = Date.now();
                    const timeout = setTimeout(() => {{
                        resolve({{
                            state: 'timeout-interactive',
                            timeMs: Date.now() - startTime
                        }});
                    }}, {});

                    window.addEventListener('load', () => {{
                        clearTimeout(timeout);
                        resolve({{
                            state: 'load-complete',
                            timeMs: Date.now() - startTime
                        }});
                    }}, {{ once: true }});
                }}
            }});

            return JSON.stringify(result);
        }})()
        "#,
        budget.as_millis()
    );

    #[derive(serde::Deserialize)]
    struct LoadResult {
        state: String,
        #[serde(rename = "timeMs")]
        time_ms: u64,
    }

    // await=true so the evaluate call rides the Promise to resolution
    match tab.evaluate(&script, true) {
        Ok(result) => {
            let parsed = result
                .value
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .and_then(|json| serde_json::from_str::<LoadResult>(&json).ok());

            match parsed {
                Some(load) => match load.state.as_str() {
                    "already-complete" => {
                        tracing::debug!(ray_id = %ray_id, "document was already complete");
                    }
                    "load-complete" => {
                        tracing::debug!(
                            ray_id = %ray_id,
                            "load event fired after {}ms",
                            load.time_ms
                        );
                    }
                    _ => {
                        tracing::warn!(
                            ray_id = %ray_id,
                            "load event never fired within {}ms, proceeding with partial page",
                            load.time_ms
                        );
                    }
                },
                None => {
                    tracing::warn!(ray_id = %ray_id, "unreadable load result, proceeding");
                }
            }
        }
        Err(e) => {
            tracing::warn!(
                ray_id = %ray_id,
                "load event listener failed: {}, proceeding",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_wait_clamps() {
        assert_eq!(effective_wait(Duration::ZERO), DEFAULT_QUIESCENCE_WAIT);
        assert_eq!(
            effective_wait(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(effective_wait(MAX_QUIESCENCE_WAIT), MAX_QUIESCENCE_WAIT);
        assert_eq!(
            effective_wait(Duration::from_secs(120)),
            MAX_QUIESCENCE_WAIT
        );
    }

    #[test]
    fn test_early_exit_statuses() {
        assert!(EARLY_EXIT_STATUSES.contains(&403));
        assert!(EARLY_EXIT_STATUSES.contains(&429));
        assert!(!EARLY_EXIT_STATUSES.contains(&200));
        assert!(!EARLY_EXIT_STATUSES.contains(&404));
    }

    #[test]
    fn test_failure_status_boundary() {
        assert!(!is_failure_status(200));
        assert!(!is_failure_status(301));
        assert!(!is_failure_status(399));
        assert!(is_failure_status(400));
        assert!(is_failure_status(403));
        assert!(is_failure_status(500));
    }
}
