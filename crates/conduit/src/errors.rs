use std::path::PathBuf;

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::session::StorageError;

/// Failures that are surfaced to the caller of
/// [`AgentRuntime::execute`](crate::runtime::AgentRuntime::execute) instead of
/// being folded into a [`RunResult`](crate::model::RunResult).
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Session storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("A run is already in flight for user {user_id} in {}", directory.display())]
    SessionConflict { user_id: String, directory: PathBuf },

    #[error("Prompt is empty")]
    EmptyPrompt,
}

/// Errors raised while starting a backend, before any event is produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("Agent service unavailable: {0}")]
    Unavailable(String),

    #[error("Agent protocol fault: {0}")]
    Protocol(String),

    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Structural errors are integration-layer faults; only these trigger the
    /// fallback backend.
    pub fn is_structural(&self) -> bool {
        matches!(self, BackendError::Protocol(_))
    }
}
