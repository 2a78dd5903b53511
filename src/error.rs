//! Error types for the migration orchestration engine.
//!
//! Per-tenant failures during bulk operations are captured into that
//! tenant's own result record and never abort sibling tenants; only
//! malformed requests surface as errors to the caller.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type for migration engine operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Migration engine error taxonomy
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Tenant storage unreachable. Non-fatal to multi-tenant batches.
    #[error("tenant unreachable: {0}")]
    Connectivity(String),

    /// Malformed request (unknown module, bad settings, ...). Rejected
    /// before any tenant storage is touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Only the latest applied migration of a module may be rolled back
    #[error("cannot roll back {requested} for module {module}: latest applied is {latest}")]
    OutOfOrderRollback {
        module: String,
        requested: String,
        latest: String,
    },

    /// The catalog descriptor carries no backward script
    #[error("migration {0} has no backward script")]
    NoBackwardScript(String),

    /// The tenant's advisory lock is already held by another operation
    #[error("a migration is already in progress for tenant {0}")]
    MigrationInProgress(Uuid),

    /// A migration exceeded the configured per-migration timeout
    #[error("migration {name} exceeded the {timeout:?} timeout")]
    Timeout { name: String, timeout: Duration },

    /// A migration script failed to execute
    #[error("migration {name} failed: {message}")]
    ApplyFailure { name: String, message: String },

    /// Durable store (job queue, settings, ledger file) failure
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a connectivity error
    pub fn connectivity<E: fmt::Display>(err: E) -> Self {
        Self::Connectivity(err.to_string())
    }

    /// Create a validation error
    pub fn validation<E: fmt::Display>(err: E) -> Self {
        Self::Validation(err.to_string())
    }

    /// Create a not-found error
    pub fn not_found<E: fmt::Display>(err: E) -> Self {
        Self::NotFound(err.to_string())
    }

    /// Create a storage error
    pub fn storage<E: fmt::Display>(err: E) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether this error indicates the tenant could not be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}
