//! Error taxonomy for the orchestrator.
//!
//! Workers never propagate errors through the driver directly: every hook
//! converts whatever it produces into a [`crate::state::TransitionOutcome`]
//! at the boundary of its own `enter`/`exit` implementation, typically via
//! `anyhow` context and a final `.to_string()`. This type names the shapes
//! of failure specific to configuration loading and the few call sites
//! that want a structured variant to match on rather than a formatted
//! string.

use crate::state::OrchestratorState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A configuration-referenced resource (most commonly the VirtWifi
    /// installer APK) was missing or unreadable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker's `enter` exceeded its per-state deadline.
    #[error("{worker} timed out entering {state:?}")]
    Timeout {
        state: OrchestratorState,
        worker: String,
    },

    /// A spawn or wait on a child process failed, or the process exited
    /// in a way the caller treats as fatal.
    #[error("{context}: {source}")]
    ChildProcess {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
