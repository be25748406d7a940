//! Error types for the launcher

use std::time::Duration;
use thiserror::Error;

/// Launcher result type
pub type Result<T> = std::result::Result<T, LauncherError>;

/// Errors that can occur in the launcher
#[derive(Error, Debug)]
pub enum LauncherError {
    /// Protocol error on the control plane
    #[error("Protocol error: {0}")]
    Protocol(#[from] melissa_core::ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Batch system command failed; transient, the next poll retries
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Batch system reported a state missing from the lookup table
    #[error("Unknown {scheduler} job state '{state}'")]
    UnknownSchedulerState { scheduler: String, state: String },

    /// A mandatory user hook failed
    #[error("Hook '{hook}' failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid study configuration; carries the number of violations
    #[error("{count} configuration error(s)")]
    Config { count: usize },

    /// Command did not return in time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Study state that should be unreachable
    #[error("Study error: {0}")]
    Study(String),
}

impl LauncherError {
    /// Create a scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create an unknown-state error
    pub fn unknown_state(scheduler: impl Into<String>, state: impl Into<String>) -> Self {
        Self::UnknownSchedulerState {
            scheduler: scheduler.into(),
            state: state.into(),
        }
    }

    /// Wrap a failed mandatory hook
    pub fn hook(hook: &'static str, source: anyhow::Error) -> Self {
        Self::Hook { hook, source }
    }

    /// Classify a failed hook call.
    ///
    /// Launcher errors raised inside the hook keep their identity, so a
    /// transient scheduler failure stays transient. Anything else is a
    /// hook failure.
    pub fn from_hook(hook: &'static str, source: anyhow::Error) -> Self {
        match source.downcast::<LauncherError>() {
            Ok(inner) => inner,
            Err(source) => Self::Hook { hook, source },
        }
    }

    /// Create a study error
    pub fn study(msg: impl Into<String>) -> Self {
        Self::Study(msg.into())
    }

    /// Whether the study must abort on this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Scheduler(_) | Self::Timeout(_) | Self::Io(_))
    }
}
