use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by `BrowserPool::acquire`.
///
/// These are terminal for the acquisition call: the pool never retries them
/// internally. Whether to retry at a higher level is the caller's decision.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The circuit breaker is OPEN (or a HALF_OPEN trial is already in
    /// flight). No browser work was attempted.
    #[error("circuit breaker is open; refusing new browser work")]
    CircuitOpen,

    /// The admission queue was already at capacity when the request arrived.
    #[error("admission queue is full ({pending} requests waiting)")]
    QueueFull { pending: usize },

    /// The request sat in the queue past its deadline without being assigned
    /// an instance.
    #[error("timed out after {waited:?} waiting for a browser instance")]
    Timeout { waited: Duration },

    /// Creating or replacing a browser instance for this request failed.
    #[error("failed to provision a browser instance: {0}")]
    Provision(String),

    /// The pool is draining and no longer serves acquisitions.
    #[error("browser pool is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by `Navigator::safe_navigate`.
#[derive(Debug, Error)]
pub enum NavigationError {
    /// The URL failed to parse at all.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The URL's scheme is outside the allowed set. Checked before any
    /// navigation attempt is made.
    #[error("protocol {scheme:?} is not allowed")]
    DisallowedProtocol { scheme: String },

    /// The URL exceeds the configured maximum length.
    #[error("url length {len} exceeds maximum {max}")]
    UrlTooLong { len: usize, max: usize },

    /// A redirect landed on a URL whose scheme is outside the allowed set.
    /// Terminal: retrying the original URL would follow the same redirect.
    #[error("redirect landed on disallowed protocol {scheme:?}")]
    RedirectBlocked { scheme: String },

    /// The retry budget is exhausted. Carries the last per-attempt error so
    /// the caller sees one descriptive message, not a driver stack trace.
    #[error("navigation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The wait/navigate machinery was cancelled by shutdown.
    #[error("navigation cancelled by shutdown")]
    Cancelled,
}

impl NavigationError {
    /// Validation-class errors fail before or without any navigation attempt
    /// and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_)
                | Self::DisallowedProtocol { .. }
                | Self::UrlTooLong { .. }
                | Self::RedirectBlocked { .. }
        )
    }
}

/// Top-level error for the research service's tool operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error("content extraction failed: {0}")]
    Extraction(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_exhausted_mentions_attempt_count() {
        let err = NavigationError::Exhausted {
            attempts: 3,
            last_error: "bot protection detected".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("bot protection detected"));
    }

    #[test]
    fn test_queue_full_mentions_pending() {
        let err = AcquireError::QueueFull { pending: 10 };
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_disallowed_protocol_names_scheme() {
        let err = NavigationError::DisallowedProtocol {
            scheme: "ftp".to_string(),
        };
        assert!(err.to_string().contains("ftp"));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_validation_class() {
        assert!(NavigationError::DisallowedProtocol {
            scheme: "ftp".into()
        }
        .is_validation());
        assert!(NavigationError::UrlTooLong { len: 5000, max: 2048 }.is_validation());
        assert!(NavigationError::RedirectBlocked {
            scheme: "data".into()
        }
        .is_validation());
        assert!(!NavigationError::Exhausted {
            attempts: 3,
            last_error: "timeout".into()
        }
        .is_validation());
        assert!(!NavigationError::Cancelled.is_validation());
    }

    #[test]
    fn test_engine_error_wraps_acquire_transparently() {
        let err = EngineError::from(AcquireError::CircuitOpen);
        assert_eq!(
            err.to_string(),
            "circuit breaker is open; refusing new browser work"
        );
    }
}
