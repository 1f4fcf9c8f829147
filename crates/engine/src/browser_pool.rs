//! Browser instance pool with FIFO admission queue.
//!
//! Acquisition is indirect: `acquire` enqueues a waiter and a single
//! background dispatcher task assigns instances in arrival order. The
//! dispatcher is woken by a `Notify` on every enqueue and every lease
//! release, and also ticks on `health_check_interval` so maintenance runs
//! even when the pool is quiet. Each processing pass sweeps unhealthy idle
//! instances first, then works the queue: hand out an idle instance, create
//! one if under the ceiling, or recycle the least-recently-used idle one.
//!
//! Leases are scoped: dropping a `PageLease` returns the instance to the
//! pool and wakes the dispatcher, so a panicking caller cannot leak an
//! instance.

use headless_chrome::browser::tab::Tab;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webscout_common::config::{BrowserConfig, PoolConfig};
use webscout_common::error::AcquireError;
use webscout_common::types::PoolStats;

use crate::circuit_breaker::CircuitBreaker;
use crate::instance::BrowserInstance;

/// A live claim on one pooled browser instance.
///
/// Returning the instance is the drop handler's job; callers just let the
/// lease go out of scope.
pub struct PageLease {
    tab: Arc<Tab>,
    instance: Arc<BrowserInstance>,
    pool_work: Arc<Notify>,
}

impl PageLease {
    pub fn page(&self) -> &Arc<Tab> {
        &self.tab
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance.meta.id
    }

    /// Count a failure against the leased instance. The maintenance sweep
    /// evicts instances past the failure ceiling.
    pub fn record_failure(&self) -> u32 {
        self.instance.meta.record_failure()
    }

    pub fn set_memory_usage(&self, bytes: u64) {
        self.instance
            .meta
            .memory_usage_bytes
            .store(bytes, Ordering::SeqCst);
    }

    /// Flag the instance's page as closed (hard-timeout abort, dead tab).
    /// The instance is recycled before it is handed out again.
    pub fn mark_page_closed(&self) {
        self.instance.meta.page_open.store(false, Ordering::SeqCst);
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        // try_lock: the drop path must not block, and a missed recency
        // update is harmless.
        if let Ok(mut last_used) = self.instance.meta.last_used_at.try_lock() {
            *last_used = Instant::now();
        }
        self.instance.meta.end_lease();
        self.pool_work.notify_one();
    }
}

struct Waiter {
    id: Uuid,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<PageLease, AcquireError>>,
}

pub struct BrowserPool {
    config: PoolConfig,
    browser_config: BrowserConfig,
    /// Default per-operation timeout set on each instance's tab.
    default_page_timeout: std::time::Duration,
    instances: RwLock<Vec<Arc<BrowserInstance>>>,
    queue: Mutex<VecDeque<Waiter>>,
    breaker: Arc<CircuitBreaker>,
    work: Arc<Notify>,
    shutting_down: AtomicBool,

    total_created: AtomicU64,
    total_recycled: AtomicU64,
    total_destroyed: AtomicU64,
    total_requests: AtomicU64,
}

impl BrowserPool {
    pub fn new(
        config: PoolConfig,
        browser_config: BrowserConfig,
        default_page_timeout: std::time::Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            browser_config,
            default_page_timeout,
            instances: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            breaker,
            work: Arc::new(Notify::new()),
            shutting_down: AtomicBool::new(false),
            total_created: AtomicU64::new(0),
            total_recycled: AtomicU64::new(0),
            total_destroyed: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    /// Acquire a page lease, waiting in the admission queue if necessary.
    ///
    /// Outcome reporting: queue-full is an admission rejection and reaches
    /// the breaker as neither success nor failure; everything after
    /// admission (assignment, provisioning failure, queue timeout) reports.
    pub async fn acquire(&self) -> Result<PageLease, AcquireError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AcquireError::ShuttingDown);
        }

        self.breaker.try_admit()?;

        let waiter_id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().unwrap();
            let pending = queue.len();
            if pending >= self.config.max_queue_size {
                warn!(
                    "admission queue full ({} pending), rejecting acquisition",
                    pending
                );
                // A HALF_OPEN trial slot claimed by try_admit must not stay
                // held by a request that never ran.
                self.breaker.cancel_admission();
                return Err(AcquireError::QueueFull { pending });
            }
            queue.push_back(Waiter {
                id: waiter_id,
                enqueued_at: Instant::now(),
                tx,
            });
        }
        self.work.notify_one();

        match timeout(self.config.queue_timeout, &mut rx).await {
            Ok(Ok(Ok(lease))) => {
                self.breaker.report_success();
                Ok(lease)
            }
            Ok(Ok(Err(e))) => {
                self.breaker.report_failure();
                Err(e)
            }
            // Dispatcher dropped the sender without answering: drain path.
            Ok(Err(_)) => {
                self.breaker.cancel_admission();
                Err(AcquireError::ShuttingDown)
            }
            Err(_) => {
                let removed = {
                    let mut queue = self.queue.lock().unwrap();
                    match queue.iter().position(|w| w.id == waiter_id) {
                        Some(idx) => {
                            let _ = queue.remove(idx);
                            true
                        }
                        None => false,
                    }
                };
                if removed {
                    self.breaker.report_failure();
                    return Err(AcquireError::Timeout {
                        waited: self.config.queue_timeout,
                    });
                }
                // The dispatcher claimed this waiter just as the deadline
                // hit; its answer is already in flight on the channel.
                match rx.await {
                    Ok(Ok(lease)) => {
                        self.breaker.report_success();
                        Ok(lease)
                    }
                    Ok(Err(e)) => {
                        self.breaker.report_failure();
                        Err(e)
                    }
                    Err(_) => {
                        self.breaker.cancel_admission();
                        Err(AcquireError::ShuttingDown)
                    }
                }
            }
        }
    }

    /// Start the background dispatcher. Tests that only exercise the
    /// admission path skip this, so no browser ever launches.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) {
        let pool = self.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            info!("browser pool dispatcher started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("browser pool dispatcher stopping");
                        return;
                    }
                    _ = pool.work.notified() => {}
                    _ = tokio::time::sleep(pool.config.health_check_interval) => {}
                }
                pool.process_pass().await;
            }
        });
    }

    /// One dispatcher pass: maintenance sweep, then FIFO queue assignment.
    async fn process_pass(&self) {
        self.sweep().await;

        loop {
            if self.queue.lock().unwrap().is_empty() {
                return;
            }

            let instance = match self.claim_instance().await {
                Ok(Some(instance)) => instance,
                // At capacity with every instance leased: wait for a release.
                Ok(None) => return,
                Err(e) => {
                    self.fail_oldest_waiter(AcquireError::Provision(e.to_string()));
                    continue;
                }
            };

            let Some(tab) = instance.tab() else {
                // Page closed between claim and hand-out; count it and let
                // the recycle path pick the instance up next pass.
                instance.meta.record_failure();
                instance.meta.end_lease();
                continue;
            };

            let Some(waiter) = self.queue.lock().unwrap().pop_front() else {
                instance.meta.end_lease();
                return;
            };

            instance.meta.touch().await;
            instance.meta.total_requests.fetch_add(1, Ordering::SeqCst);
            self.total_requests.fetch_add(1, Ordering::SeqCst);

            let lease = PageLease {
                tab,
                instance: instance.clone(),
                pool_work: self.work.clone(),
            };

            debug!(
                instance_id = %instance.meta.id,
                waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                "assigned browser instance to queued request"
            );

            // A failed send means the waiter timed out and dropped its
            // receiver; the lease drop returns the instance immediately.
            let _ = waiter.tx.send(Ok(lease));
        }
    }

    /// Find or make an assignable instance and mark it leased.
    ///
    /// Ok(None) means the pool is saturated; Err means provisioning failed
    /// and the oldest waiter should be told so.
    async fn claim_instance(&self) -> anyhow::Result<Option<Arc<BrowserInstance>>> {
        // Idle instance already in shape.
        {
            let instances = self.instances.read().await;
            for instance in instances.iter() {
                if instance.meta.is_assignable(self.config.failure_ceiling)
                    && instance.meta.try_begin_lease()
                {
                    return Ok(Some(instance.clone()));
                }
            }
        }

        // Room to grow: launch a fresh instance.
        let live = self.instances.read().await.len();
        if live < self.config.max_concurrent_browsers {
            let instance = self.create_instance().await?;
            // Fresh and unshared: the claim cannot fail.
            instance.meta.try_begin_lease();
            self.instances.write().await.push(instance.clone());
            return Ok(Some(instance));
        }

        // At capacity: recycle the least-recently-used idle instance.
        let Some(instance) = self.claim_lru_idle().await else {
            return Ok(None);
        };

        let browser_config = self.browser_config.clone();
        let default_timeout = self.default_page_timeout;
        let for_recycle = instance.clone();
        let recycled = tokio::task::spawn_blocking(move || {
            for_recycle.recycle(&browser_config, default_timeout)
        })
        .await;

        match recycled {
            Ok(Ok(())) => {
                self.total_recycled.fetch_add(1, Ordering::SeqCst);
                Ok(Some(instance))
            }
            Ok(Err(e)) => {
                // The instance is beyond recycling; replace it outright.
                warn!(
                    instance_id = %instance.meta.id,
                    "recycle failed, destroying and replacing instance: {}",
                    e
                );
                self.remove_and_destroy(&instance).await;
                let replacement = self.create_instance().await?;
                replacement.meta.try_begin_lease();
                self.instances.write().await.push(replacement.clone());
                Ok(Some(replacement))
            }
            Err(join_err) => {
                instance.meta.end_lease();
                Err(anyhow::anyhow!("recycle task panicked: {}", join_err))
            }
        }
    }

    async fn create_instance(&self) -> anyhow::Result<Arc<BrowserInstance>> {
        let browser_config = self.browser_config.clone();
        let default_timeout = self.default_page_timeout;
        let created = tokio::task::spawn_blocking(move || {
            BrowserInstance::create(&browser_config, default_timeout)
        })
        .await
        .map_err(|join_err| anyhow::anyhow!("create task panicked: {}", join_err))??;

        self.total_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(created))
    }

    /// Claim the idle instance that has gone longest without use.
    async fn claim_lru_idle(&self) -> Option<Arc<BrowserInstance>> {
        let instances = self.instances.read().await;
        let mut best: Option<(std::time::Duration, Arc<BrowserInstance>)> = None;
        for instance in instances.iter() {
            if instance.meta.is_leased.load(Ordering::SeqCst) {
                continue;
            }
            let idle = instance.meta.idle_for().await;
            match &best {
                Some((best_idle, _)) if idle <= *best_idle => {}
                _ => best = Some((idle, instance.clone())),
            }
        }
        let (_, instance) = best?;
        if instance.meta.try_begin_lease() {
            Some(instance)
        } else {
            None
        }
    }

    /// Evict unleased instances that meet an eviction criterion.
    async fn sweep(&self) {
        let mut evicted = Vec::new();
        {
            let mut instances = self.instances.write().await;
            let mut idx = 0;
            while idx < instances.len() {
                let instance = &instances[idx];
                if instance.meta.is_leased.load(Ordering::SeqCst) {
                    idx += 1;
                    continue;
                }
                match instance.meta.eviction_reason(&self.config).await {
                    Some(reason) => {
                        info!(
                            instance_id = %instance.meta.id,
                            reason = reason.as_str(),
                            "evicting browser instance"
                        );
                        evicted.push(instances.remove(idx));
                    }
                    None => idx += 1,
                }
            }
        }

        for instance in evicted {
            self.destroy_detached(instance);
        }
    }

    async fn remove_and_destroy(&self, target: &Arc<BrowserInstance>) {
        let mut instances = self.instances.write().await;
        if let Some(idx) = instances.iter().position(|i| Arc::ptr_eq(i, target)) {
            let instance = instances.remove(idx);
            drop(instances);
            self.destroy_detached(instance);
        }
    }

    fn destroy_detached(&self, instance: Arc<BrowserInstance>) {
        self.total_destroyed.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn_blocking(move || instance.destroy());
    }

    fn fail_oldest_waiter(&self, error: AcquireError) {
        let waiter = self.queue.lock().unwrap().pop_front();
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(Err(error));
        }
    }

    /// Drain the pool: fail queued waiters and destroy idle instances.
    /// Leased instances are left to their holders; their processes die with
    /// the pool's `Browser` handles.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let waiters: Vec<Waiter> = self.queue.lock().unwrap().drain(..).collect();
        if !waiters.is_empty() {
            info!("failing {} queued acquisitions for shutdown", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.tx.send(Err(AcquireError::ShuttingDown));
        }

        let instances: Vec<Arc<BrowserInstance>> = {
            let mut guard = self.instances.write().await;
            let mut keep = Vec::new();
            let mut drop_now = Vec::new();
            for instance in guard.drain(..) {
                if instance.meta.is_leased.load(Ordering::SeqCst) {
                    keep.push(instance);
                } else {
                    drop_now.push(instance);
                }
            }
            *guard = keep;
            drop_now
        };

        for instance in instances {
            self.destroy_detached(instance);
        }
        info!("browser pool drained");
    }

    pub async fn stats(&self) -> PoolStats {
        let instances = self.instances.read().await;
        let leased = instances
            .iter()
            .filter(|i| i.meta.is_leased.load(Ordering::SeqCst))
            .count();
        PoolStats {
            live_instances: instances.len(),
            max_concurrent_browsers: self.config.max_concurrent_browsers,
            leased_instances: leased,
            queue_depth: self.queue.lock().unwrap().len(),
            total_instances_created: self.total_created.load(Ordering::SeqCst),
            total_instances_recycled: self.total_recycled.load(Ordering::SeqCst),
            total_instances_destroyed: self.total_destroyed.load(Ordering::SeqCst),
            total_requests: self.total_requests.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerState;
    use std::time::Duration;
    use webscout_common::config::BreakerConfig;

    fn test_pool(pool_config: PoolConfig) -> Arc<BrowserPool> {
        // No dispatcher is started, so no browser ever launches.
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        Arc::new(BrowserPool::new(
            pool_config,
            BrowserConfig::default(),
            Duration::from_secs(30),
            breaker,
        ))
    }

    // ==================== Admission Tests ====================

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let pool = test_pool(PoolConfig {
            max_queue_size: 0,
            ..PoolConfig::default()
        });

        let start = Instant::now();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(AcquireError::QueueFull { pending: 0 })));
        // Rejection is immediate, not a timeout.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_queue_timeout_removes_waiter() {
        let pool = test_pool(PoolConfig {
            max_queue_size: 5,
            queue_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        });

        let result = pool.acquire().await;
        assert!(matches!(result, Err(AcquireError::Timeout { .. })));
        // The timed-out waiter must not linger in the queue.
        assert_eq!(pool.stats().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        }));
        breaker.report_failure();

        let pool = Arc::new(BrowserPool::new(
            PoolConfig::default(),
            BrowserConfig::default(),
            Duration::from_secs(30),
            breaker,
        ));

        let start = Instant::now();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(AcquireError::CircuitOpen)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.stats().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_queue_timeouts_trip_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        }));
        let pool = Arc::new(BrowserPool::new(
            PoolConfig {
                max_queue_size: 5,
                queue_timeout: Duration::from_millis(20),
                ..PoolConfig::default()
            },
            BrowserConfig::default(),
            Duration::from_secs(30),
            breaker.clone(),
        ));

        let _ = pool.acquire().await;
        let _ = pool.acquire().await;
        assert!(matches!(
            pool.acquire().await,
            Err(AcquireError::CircuitOpen)
        ));
    }

    #[tokio::test]
    async fn test_queue_full_rejection_frees_half_open_trial() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(0),
            monitoring_interval: Duration::from_millis(10),
        }));
        breaker.report_failure();

        let shutdown = CancellationToken::new();
        breaker.start_monitor(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let pool = Arc::new(BrowserPool::new(
            PoolConfig {
                max_queue_size: 0,
                ..PoolConfig::default()
            },
            BrowserConfig::default(),
            Duration::from_secs(30),
            breaker.clone(),
        ));

        assert!(matches!(
            pool.acquire().await,
            Err(AcquireError::QueueFull { .. })
        ));
        // The rejected request withdrew its trial slot; the next caller can
        // still be admitted without waiting for the stale-probe reclaim.
        assert!(breaker.try_admit().is_ok());
        shutdown.cancel();
    }

    // ==================== Shutdown Tests ====================

    #[tokio::test]
    async fn test_shutdown_rejects_new_acquisitions() {
        let pool = test_pool(PoolConfig::default());
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire().await,
            Err(AcquireError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_waiters() {
        let pool = test_pool(PoolConfig {
            max_queue_size: 5,
            queue_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        });

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        // Let the waiter enqueue before draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown().await;

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AcquireError::ShuttingDown)));
    }

    // ==================== Stats Tests ====================

    #[tokio::test]
    async fn test_initial_stats_are_empty() {
        let pool = test_pool(PoolConfig::default());
        let stats = pool.stats().await;
        assert_eq!(stats.live_instances, 0);
        assert_eq!(stats.leased_instances, 0);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.total_instances_created, 0);
        assert_eq!(stats.max_concurrent_browsers, 3);
    }
}
