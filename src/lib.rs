//! # Webscout
//!
//! Webscout is a headless-browser web research engine: a pool of managed
//! Chrome instances behind an admission queue and a circuit breaker, with a
//! guarded navigation protocol (URL validation, consent handling, retries,
//! page validation) and tool operations for search, page visits and
//! screenshots.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use webscout::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Run the whole engine (pool, breaker, metrics, signal handling)
//!     // with defaults. See WEBSCOUT_* environment variables in the
//!     // webscout-engine binary for the configurable knobs.
//!     run_engine(EngineConfig::default()).await
//! }
//! ```
//!
//! Embedders who only want the service surface can assemble the pieces
//! themselves:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use webscout::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let shutdown = CancellationToken::new();
//!
//! let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
//! breaker.start_monitor(shutdown.clone());
//!
//! let pool = Arc::new(BrowserPool::new(
//!     config.pool.clone(),
//!     config.browser.clone(),
//!     config.navigation.navigation_timeout,
//!     breaker.clone(),
//! ));
//! pool.start(&shutdown);
//!
//! let metrics = Metrics::new()?;
//! let service = ResearchService::new(&config, pool, breaker, metrics, shutdown);
//!
//! let response = service.visit("https://example.com", None).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Engine**: browser pool, circuit breaker, navigator and the research
//!   service
//! - **Common**: configuration, error types, page validation, consent
//!   knowledge and the session store

/// Re-export of shared types and utilities
pub use webscout_common as common;

/// Re-export of the engine: pool, navigator, service
pub use webscout_engine as engine;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::common::config::{
        BreakerConfig, BrowserConfig, ConsentMode, EngineConfig, NavigationConfig, PoolConfig,
        ScreenshotConfig, SessionConfig,
    };

    // Errors
    pub use crate::common::error::{AcquireError, EngineError, NavigationError};

    // Responses and stats
    pub use crate::common::types::{
        EngineStats, NavigationOutcome, ScreenshotResponse, SearchResponse, SearchResult,
        VisitResponse,
    };

    // Engine surface
    pub use crate::engine::{
        run_engine, BrowserPool, CircuitBreaker, ContentExtractor, MarkdownExtractor, Metrics,
        Navigator, PageLease, ResearchService,
    };

    // Sessions
    pub use crate::common::session::{ResearchSession, SessionStore};

    // Page hardening middleware
    pub use crate::common::browser_middleware::{
        DefaultLaunchParamsMiddleware, DefaultPageInitMiddleware, LaunchParamsMiddleware,
        PageInitMiddleware,
    };
}
