//! SchoolCast error types.

use std::time::Duration;

/// Errors surfaced by the dispatcher, the poller and the provider client.
#[derive(Debug, thiserror::Error)]
pub enum SchoolCastError {
    /// The request could not complete, returned a non-success status or timed out.
    #[error("Network failure: {0}")]
    Network(String),

    /// The response had an unexpected shape or broke a progress invariant.
    #[error("Validation failure: {0}")]
    Validation(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("A dispatch run is already in progress")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchoolCastError {
    /// A caller-supplied deadline expired. Treated exactly like a network failure.
    pub fn timeout(after: Duration) -> Self {
        Self::Network(format!("request timed out after {}s", after.as_secs_f32()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error aborts a dispatch run when it occurs mid-run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, SchoolCastError>;
