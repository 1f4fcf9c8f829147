use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::types::ResearchResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// A single research conversation: the query that opened it and the
/// results accumulated while browsing.
#[derive(Debug, Clone)]
pub struct ResearchSession {
    pub id: String,
    pub query: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub results: Vec<ResearchResult>,
}

/// In-memory store of active research sessions.
///
/// The navigation core never persists results itself; completed
/// `{url, title, content, timestamp}` tuples are handed here and expire
/// with their session.
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, ResearchSession>>>,
    ttl: Duration,
    max_results_per_session: usize,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl: config.ttl,
            max_results_per_session: config.max_results_per_session,
        }
    }

    /// Open a new session for a query, returning its id.
    pub async fn create_session(&self, query: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = ResearchSession {
            id: id.clone(),
            query: query.to_string(),
            created_at: Instant::now(),
            last_activity: Instant::now(),
            results: Vec::new(),
        };

        self.sessions.write().await.insert(id.clone(), session);
        tracing::debug!(session_id = %id, "research session created");

        id
    }

    /// Append a completed result to a session.
    ///
    /// Keeps at most `max_results_per_session` entries, dropping the
    /// oldest first. Unknown ids are an error so callers cannot silently
    /// write into an expired session.
    pub async fn add_result(
        &self,
        session_id: &str,
        result: ResearchResult,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;

        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;

        session.last_activity = Instant::now();
        if session.results.len() >= self.max_results_per_session {
            session.results.remove(0);
        }
        session.results.push(result);

        Ok(())
    }

    /// Get a session snapshot, refreshing its activity timestamp.
    pub async fn get_session(&self, session_id: &str) -> Option<ResearchSession> {
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
            Some(session.clone())
        } else {
            None
        }
    }

    /// Remove a session (explicit close or expiry).
    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Periodically drop sessions idle past the TTL. Runs until shutdown.
    pub fn start_cleanup_task(&self, shutdown: CancellationToken) {
        let sessions = self.sessions.clone();
        let ttl = self.ttl;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session cleanup task stopping");
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }

                let mut sessions_guard = sessions.write().await;
                let before = sessions_guard.len();
                let now = Instant::now();

                sessions_guard
                    .retain(|_id, session| now.duration_since(session.last_activity) < ttl);

                let dropped = before - sessions_guard.len();
                if dropped > 0 {
                    tracing::info!(dropped, "expired research sessions removed");
                }
            }
        });
    }

    /// Get session store statistics
    pub async fn stats(&self) -> SessionStoreStats {
        let sessions = self.sessions.read().await;

        SessionStoreStats {
            active_sessions: sessions.len(),
            stored_results: sessions.values().map(|s| s.results.len()).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreStats {
    pub active_sessions: usize,
    pub stored_results: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== SessionStore Tests ====================

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = SessionStore::default();

        let id = store.create_session("rust async runtimes").await;
        assert_eq!(id.len(), 36); // hyphenated uuid

        let session = store.get_session(&id).await.unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.query, "rust async runtimes");
        assert!(session.results.is_empty());
    }

    #[tokio::test]
    async fn test_get_session_nonexistent() {
        let store = SessionStore::default();

        assert!(store.get_session("no-such-session").await.is_none());
    }

    #[tokio::test]
    async fn test_add_result() {
        let store = SessionStore::default();
        let id = store.create_session("query").await;

        store
            .add_result(
                &id,
                ResearchResult::new("https://example.com", "Example", "body text"),
            )
            .await
            .unwrap();

        let session = store.get_session(&id).await.unwrap();
        assert_eq!(session.results.len(), 1);
        assert_eq!(session.results[0].url, "https://example.com");
        assert_eq!(session.results[0].title, "Example");
    }

    #[tokio::test]
    async fn test_add_result_unknown_session() {
        let store = SessionStore::default();

        let err = store
            .add_result("ghost", ResearchResult::new("u", "t", "c"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_result_cap_drops_oldest() {
        let config = SessionConfig {
            ttl: Duration::from_secs(300),
            max_results_per_session: 2,
        };
        let store = SessionStore::new(&config);
        let id = store.create_session("query").await;

        for url in ["https://a.example", "https://b.example", "https://c.example"] {
            store
                .add_result(&id, ResearchResult::new(url, "t", "c"))
                .await
                .unwrap();
        }

        let session = store.get_session(&id).await.unwrap();
        assert_eq!(session.results.len(), 2);
        assert_eq!(session.results[0].url, "https://b.example");
        assert_eq!(session.results[1].url, "https://c.example");
    }

    #[tokio::test]
    async fn test_remove_session() {
        let store = SessionStore::default();
        let id = store.create_session("query").await;

        assert!(store.get_session(&id).await.is_some());

        store.remove_session(&id).await;

        assert!(store.get_session(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SessionStore::default();

        let a = store.create_session("first").await;
        let b = store.create_session("second").await;

        store
            .add_result(&a, ResearchResult::new("u1", "t", "c"))
            .await
            .unwrap();
        store
            .add_result(&a, ResearchResult::new("u2", "t", "c"))
            .await
            .unwrap();
        store
            .add_result(&b, ResearchResult::new("u3", "t", "c"))
            .await
            .unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.stored_results, 3);
    }
}
