use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::PoolConfig;

/// Signal snapshot collected from a loaded page, fed to the validator.
///
/// Collected in one in-page evaluation so the validator itself stays pure and
/// testable without a browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSignals {
    /// URL the page actually landed on (after redirects).
    pub final_url: String,
    pub title: String,
    /// Lowercased excerpt of the visible body text, bounded in length.
    pub body_excerpt: String,
    /// Word count over the full visible body text.
    pub word_count: usize,
    /// First bot-challenge selector that matched in the DOM, if any.
    pub challenge_marker: Option<String>,
}

/// One entry extracted from a search result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Completed research tuple handed to the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub url: String,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ResearchResult {
    pub fn new(url: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of a completed `safe_navigate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationOutcome {
    pub requested_url: String,
    pub final_url: String,
    pub title: String,
    pub status: Option<i64>,
    /// 1-based attempt on which navigation succeeded.
    pub attempts: u32,
    pub redirected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub session_id: String,
    pub query: String,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitResponse {
    pub session_id: String,
    pub url: String,
    pub final_url: String,
    pub title: String,
    /// Page content converted to markdown.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    pub session_id: String,
    pub final_url: String,
    pub title: String,
    pub path: String,
    pub byte_len: u64,
}

/// Why the maintenance sweep removed an instance from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Idle,
    Failures,
    Memory,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Failures => "failures",
            Self::Memory => "memory",
        }
    }
}

/// Lifecycle bookkeeping for one pooled browser instance.
///
/// Shared between the pool, the lease handle and the maintenance sweep, so
/// every mutable field is an atomic or sits behind its own lock.
#[derive(Debug)]
pub struct InstanceMetadata {
    pub id: Uuid,
    pub created_at: Instant,
    pub last_used_at: Arc<Mutex<Instant>>,
    pub failure_count: Arc<AtomicU32>,
    pub memory_usage_bytes: Arc<AtomicU64>,
    pub total_requests: Arc<AtomicU64>,
    /// True while a lease is outstanding on this instance.
    pub is_leased: Arc<AtomicBool>,
    /// False once the instance's page has been closed (hard-timeout abort,
    /// crash); restored by recycling.
    pub page_open: Arc<AtomicBool>,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            last_used_at: Arc::new(Mutex::new(Instant::now())),
            failure_count: Arc::new(AtomicU32::new(0)),
            memory_usage_bytes: Arc::new(AtomicU64::new(0)),
            total_requests: Arc::new(AtomicU64::new(0)),
            is_leased: Arc::new(AtomicBool::new(false)),
            page_open: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InstanceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the recency timestamp.
    pub async fn touch(&self) {
        *self.last_used_at.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_used_at.lock().await.elapsed()
    }

    pub fn record_failure(&self) -> u32 {
        self.failure_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the counters that recycling clears.
    pub fn reset_for_recycle(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.memory_usage_bytes.store(0, Ordering::SeqCst);
        self.page_open.store(true, Ordering::SeqCst);
    }

    /// Attempt to mark this instance leased. Returns false if a lease is
    /// already outstanding.
    pub fn try_begin_lease(&self) -> bool {
        self.is_leased
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_lease(&self) {
        self.is_leased.store(false, Ordering::SeqCst);
    }

    /// Whether this instance can be handed out to a queued request right now.
    pub fn is_assignable(&self, failure_ceiling: u32) -> bool {
        !self.is_leased.load(Ordering::SeqCst)
            && self.page_open.load(Ordering::SeqCst)
            && self.failure_count.load(Ordering::SeqCst) < failure_ceiling
    }

    /// Check the maintenance eviction criteria. Leased instances are never
    /// eviction candidates; the sweep skips them before calling this.
    pub async fn eviction_reason(&self, config: &PoolConfig) -> Option<EvictionReason> {
        if self.failure_count.load(Ordering::SeqCst) >= config.failure_ceiling {
            return Some(EvictionReason::Failures);
        }
        let memory_limit_bytes = config.max_memory_mb * 1024 * 1024;
        if self.memory_usage_bytes.load(Ordering::SeqCst) > memory_limit_bytes {
            return Some(EvictionReason::Memory);
        }
        if self.idle_for().await > config.idle_eviction_window() {
            return Some(EvictionReason::Idle);
        }
        None
    }
}

/// Point-in-time view of the pool, for stats and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub live_instances: usize,
    pub max_concurrent_browsers: usize,
    pub leased_instances: usize,
    pub queue_depth: usize,
    pub total_instances_created: u64,
    pub total_instances_recycled: u64,
    pub total_instances_destroyed: u64,
    pub total_requests: u64,
}

/// Point-in-time view of the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: String,
    pub consecutive_failures: u32,
}

/// Aggregated engine statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub breaker: BreakerSnapshot,
    pub sessions: crate::session::SessionStoreStats,
    pub active_requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool_config() -> PoolConfig {
        PoolConfig {
            max_page_load_time: Duration::from_millis(10),
            max_memory_mb: 1,
            failure_ceiling: 3,
            ..PoolConfig::default()
        }
    }

    // ==================== Eviction Tests ====================

    #[tokio::test]
    async fn test_fresh_instance_is_not_evicted() {
        let meta = InstanceMetadata::new();
        assert_eq!(meta.eviction_reason(&test_pool_config()).await, None);
    }

    #[tokio::test]
    async fn test_failure_ceiling_triggers_eviction() {
        let meta = InstanceMetadata::new();
        meta.record_failure();
        meta.record_failure();
        assert_eq!(meta.eviction_reason(&test_pool_config()).await, None);
        meta.record_failure();
        assert_eq!(
            meta.eviction_reason(&test_pool_config()).await,
            Some(EvictionReason::Failures)
        );
    }

    #[tokio::test]
    async fn test_memory_ceiling_triggers_eviction() {
        let meta = InstanceMetadata::new();
        meta.memory_usage_bytes
            .store(2 * 1024 * 1024, Ordering::SeqCst);
        assert_eq!(
            meta.eviction_reason(&test_pool_config()).await,
            Some(EvictionReason::Memory)
        );
    }

    #[tokio::test]
    async fn test_idle_window_triggers_eviction() {
        let meta = InstanceMetadata::new();
        // Idle window is 2 x max_page_load_time = 20ms here.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            meta.eviction_reason(&test_pool_config()).await,
            Some(EvictionReason::Idle)
        );

        meta.touch().await;
        assert_eq!(meta.eviction_reason(&test_pool_config()).await, None);
    }

    #[tokio::test]
    async fn test_recycle_reset_clears_counters() {
        let meta = InstanceMetadata::new();
        meta.record_failure();
        meta.record_failure();
        meta.record_failure();
        meta.memory_usage_bytes
            .store(5 * 1024 * 1024, Ordering::SeqCst);
        meta.page_open.store(false, Ordering::SeqCst);

        meta.reset_for_recycle();
        assert_eq!(meta.failure_count.load(Ordering::SeqCst), 0);
        assert_eq!(meta.memory_usage_bytes.load(Ordering::SeqCst), 0);
        assert!(meta.page_open.load(Ordering::SeqCst));
        assert_eq!(meta.eviction_reason(&test_pool_config()).await, None);
    }

    // ==================== Lease Flag Tests ====================

    #[test]
    fn test_lease_flag_is_exclusive() {
        let meta = InstanceMetadata::new();
        assert!(meta.try_begin_lease());
        assert!(!meta.try_begin_lease());
        meta.end_lease();
        assert!(meta.try_begin_lease());
    }

    #[test]
    fn test_assignable_checks_all_gates() {
        let meta = InstanceMetadata::new();
        assert!(meta.is_assignable(3));

        assert!(meta.try_begin_lease());
        assert!(!meta.is_assignable(3));
        meta.end_lease();

        meta.page_open.store(false, Ordering::SeqCst);
        assert!(!meta.is_assignable(3));
        meta.page_open.store(true, Ordering::SeqCst);

        meta.record_failure();
        meta.record_failure();
        meta.record_failure();
        assert!(!meta.is_assignable(3));
    }
}
