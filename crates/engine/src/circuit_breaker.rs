//! Failure isolation for the acquisition path.
//!
//! One process-wide breaker wraps every pool acquisition. It is independent
//! of the navigation retry loop: the retry loop owns per-attempt failures,
//! the breaker only ever sees the final outcome of a whole acquisition.
//!
//! States:
//! - CLOSED: requests flow; consecutive failures are counted.
//! - OPEN: requests fail fast with no browser work. The monitor loop moves
//!   the breaker to HALF_OPEN once the cooldown since the last failure has
//!   elapsed.
//! - HALF_OPEN: exactly one trial request is admitted at a time. Its success
//!   closes the breaker; its failure re-opens it immediately.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webscout_common::config::BreakerConfig;
use webscout_common::error::AcquireError;
use webscout_common::types::BreakerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for the metrics gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// True while a HALF_OPEN trial is in flight.
    probe_in_flight: bool,
    probe_started_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                probe_in_flight: false,
                probe_started_at: None,
            }),
        }
    }

    /// Admission check, called at the top of every acquisition.
    ///
    /// HALF_OPEN admits exactly one trial; concurrent requests during the
    /// trial are rejected as if the breaker were open.
    pub fn try_admit(&self) -> Result<(), AcquireError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(AcquireError::CircuitOpen),
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(AcquireError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    inner.probe_started_at = Some(Instant::now());
                    Ok(())
                }
            }
        }
    }

    /// Withdraw an admission whose acquisition never ran (a queue-full
    /// rejection straight after `try_admit`, or a drained waiter). Frees the
    /// HALF_OPEN probe slot without recording an outcome either way.
    pub fn cancel_admission(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            inner.probe_started_at = None;
        }
    }

    /// Report a successful acquisition outcome.
    pub fn report_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            info!(ray_id = "breaker", "trial acquisition succeeded, closing circuit");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.probe_started_at = None;
    }

    /// Report a definitively failed acquisition outcome.
    pub fn report_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_at = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.probe_started_at = None;

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(ray_id = "breaker", "trial acquisition failed, re-opening circuit");
                inner.state = BreakerState::Open;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        ray_id = "breaker",
                        "{} consecutive acquisition failures, opening circuit",
                        inner.consecutive_failures
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state.as_str().to_string(),
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// One monitor tick: OPEN -> HALF_OPEN after the cooldown, and reclaim a
    /// stale HALF_OPEN probe whose holder never reported back.
    fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .map(|at| at.elapsed() > self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    info!(
                        ray_id = "breaker",
                        "cooldown elapsed, circuit is half-open and will admit one trial"
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_failures = 0;
                    inner.probe_in_flight = false;
                    inner.probe_started_at = None;
                }
            }
            BreakerState::HalfOpen => {
                let stale = inner
                    .probe_started_at
                    .map(|at| at.elapsed() > self.config.reset_timeout)
                    .unwrap_or(false);
                if inner.probe_in_flight && stale {
                    warn!(ray_id = "breaker", "trial never reported back, reclaiming probe slot");
                    inner.probe_in_flight = false;
                    inner.probe_started_at = None;
                }
            }
            BreakerState::Closed => {}
        }
    }

    /// Background monitor driving OPEN -> HALF_OPEN transitions. Runs until
    /// shutdown.
    pub fn start_monitor(self: &Arc<Self>, shutdown: CancellationToken) {
        let breaker = self.clone();
        let interval = breaker.config.monitoring_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(ray_id = "breaker", "monitor stopping");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                breaker.tick();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
            monitoring_interval: Duration::from_millis(10),
        })
    }

    // ==================== Transition Tests ====================

    #[test]
    fn test_starts_closed_and_admits() {
        let breaker = test_breaker(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_admit().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = test_breaker(3, Duration::from_secs(30));

        breaker.report_failure();
        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.try_admit(),
            Err(AcquireError::CircuitOpen)
        ));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = test_breaker(3, Duration::from_secs(30));

        breaker.report_failure();
        breaker.report_failure();
        breaker.report_success();
        breaker.report_failure();
        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breaker = test_breaker(1, Duration::from_millis(0));

        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let breaker = test_breaker(1, Duration::from_millis(0));
        breaker.report_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();

        assert!(breaker.try_admit().is_ok());
        // Second request during the trial is rejected as if open.
        assert!(matches!(
            breaker.try_admit(),
            Err(AcquireError::CircuitOpen)
        ));
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = test_breaker(1, Duration::from_millis(0));
        breaker.report_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();

        assert!(breaker.try_admit().is_ok());
        breaker.report_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_admit().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        // Threshold is high; a HALF_OPEN failure must not wait for it.
        let breaker = test_breaker(10, Duration::from_millis(0));
        for _ in 0..10 {
            breaker.report_failure();
        }
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(breaker.try_admit().is_ok());
        breaker.report_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_cancelled_admission_frees_probe_slot() {
        let breaker = test_breaker(1, Duration::from_millis(0));
        breaker.report_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();

        assert!(breaker.try_admit().is_ok());
        // The admitted request was rejected before any browser work; the
        // next trial must not have to wait for the stale-probe reclaim.
        breaker.cancel_admission();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_admit().is_ok());
    }

    #[test]
    fn test_stale_probe_is_reclaimed() {
        let breaker = test_breaker(1, Duration::from_millis(0));
        breaker.report_failure();
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();

        assert!(breaker.try_admit().is_ok());
        // Trial holder vanishes without reporting; next tick past the
        // cooldown frees the slot.
        std::thread::sleep(Duration::from_millis(5));
        breaker.tick();
        assert!(breaker.try_admit().is_ok());
    }

    // ==================== Snapshot Tests ====================

    #[test]
    fn test_snapshot_and_gauge_encoding() {
        let breaker = test_breaker(1, Duration::from_secs(30));
        assert_eq!(breaker.snapshot().state, "closed");
        assert_eq!(BreakerState::Closed.as_gauge(), 0);
        assert_eq!(BreakerState::HalfOpen.as_gauge(), 1);
        assert_eq!(BreakerState::Open.as_gauge(), 2);

        breaker.report_failure();
        assert_eq!(breaker.snapshot().state, "open");
    }
}
