//! Error types for storage operations

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Execution id not present in the store
    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Attempted to delete an execution that is still running
    #[error("Execution {0} is running and cannot be deleted")]
    ExecutionStillRunning(Uuid),

    /// Backend-specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// PostgreSQL error
    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}
