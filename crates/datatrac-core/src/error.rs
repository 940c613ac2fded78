//! Error types shared across the sync engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced synchronously by the control API.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("unit {0} not found")]
    UnitNotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("task {0} is not running")]
    NotRunning(Uuid),

    #[error("task {0} has no pending units")]
    NoWork(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Errors raised by the engine adapters.
///
/// The `transient` / fatal split drives the per-batch error policy: under
/// `skip`, transient write failures are logged and the batch is dropped;
/// fatal errors always end the unit.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to connect to {host}:{port}: {message}")]
    Connect {
        host: String,
        port: i32,
        message: String,
    },

    #[error("illegal identifier {0:?}")]
    IllegalIdentifier(String),

    #[error("credential decryption failed: {0}")]
    Credentials(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("schema operation failed: {0}")]
    Schema(String),
}

impl AdapterError {
    /// Whether the error is a transport-level failure that the `skip`
    /// policy may step over.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Read(_) | Self::Write(_))
    }
}
