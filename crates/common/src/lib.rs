pub mod browser_middleware;
pub mod config;
pub mod consent;
pub mod error;
pub mod session;
pub mod types;
pub mod utils;
pub mod validator;
pub mod wait;

pub use browser_middleware::{
    DefaultLaunchParamsMiddleware, DefaultPageInitMiddleware, LaunchParamsMiddleware,
    PageEnvironment, PageInitMiddleware,
};
pub use config::*;
pub use error::{AcquireError, EngineError, NavigationError};
pub use session::{ResearchSession, SessionStore, SessionStoreStats};
pub use types::*;
pub use validator::{ValidationFailure, CHALLENGE_SELECTORS};
pub use wait::{QuiescenceOutcome, DEFAULT_QUIESCENCE_WAIT, MAX_QUIESCENCE_WAIT};
