//! Typed error hierarchy for the migration engine.
//!
//! Every failure inside a migration's step sequence is one of these variants.
//! The orchestrator catches all of them at the job boundary; none of them
//! reaches the caller that submitted the job.

use thiserror::Error;

use crate::migration::models::Status;

/// Errors raised while driving a migration job.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration {id} not found")]
    NotFound { id: i64 },

    #[error("Migration {id} is already running")]
    AlreadyRunning { id: i64 },

    #[error("Remote API error during {operation}: {message}")]
    RemoteApi {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Command `{command}` exited with code {code:?}")]
    ProcessFailure { command: String, code: Option<i32> },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Push to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Invalid working layout: {0}")]
    InvalidLayout(String),

    #[error("Job store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrationError {
    /// Build a `RemoteApi` error for the given operation.
    pub fn remote(operation: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RemoteApi {
            operation: operation.to_string(),
            status,
            message: message.into(),
        }
    }
}
