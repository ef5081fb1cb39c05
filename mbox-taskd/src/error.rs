//! Error types for the task daemon.

use thiserror::Error;

/// Errors returned synchronously by supervisor operations.
///
/// Worker crashes and handled failures are not errors of the call that
/// started the worker; they are reported through the event log (see
/// [`crate::exit::ExitClass`]).
#[derive(Debug, Error)]
pub enum Error {
    /// A worker for this id is already running.
    #[error("task for {0} is already active")]
    AlreadyActive(String),

    /// Lock busy, conflicting operation in progress, or task not active.
    #[error("bad state: {0}")]
    BadState(String),

    /// Unknown task type, task id or app id.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event log error: {0}")]
    EventLog(#[from] mbox_log::EventLogError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The supervisor event loop is no longer running.
    #[error("supervisor has shut down")]
    Shutdown,

    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for task daemon operations.
pub type Result<T> = std::result::Result<T, Error>;
