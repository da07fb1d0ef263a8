//! Error types for quotagate.
//!
//! A denied admission is not an error: it is reported through
//! [`crate::quota::QuotaStatus::allowed`]. Errors are reserved for missing
//! entitlements, malformed input, and store or delivery faults.

use thiserror::Error;

/// Errors produced by quota operations, the record store, and the reset job.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// No quota record exists for the user (no entitlement).
    #[error("no quota record for user '{0}'")]
    NotFound(String),

    /// A record already exists for the user.
    #[error("quota record for user '{0}' already exists")]
    AlreadyExists(String),

    /// Malformed input to `increment`, `adjust_quota`, or `provision`.
    #[error("validation error: {0}")]
    Validation(String),

    /// A compare-and-set on the reset boundary found a different value.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient fault in the backing record store.
    #[error("store error: {0}")]
    Store(String),

    /// A reset job was triggered while another run was still in progress.
    #[error("a reset job is already running")]
    JobAlreadyRunning,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Alert delivery failed.
    #[error("alert delivery failed: {0}")]
    Alert(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QuotaError {
    /// Whether retrying the same operation may succeed.
    ///
    /// The reset scheduler retries only transient errors; everything else
    /// fails the user immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, QuotaError::Store(_) | QuotaError::Io(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuotaError>;
