use chrono::{DateTime, Utc};
use opflow_core::{CoreError, OperationStatus};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdempotencyError {
    #[error("idempotency key '{key}' not found")]
    NotFound { key: String },

    /// The record exists but is past its `expires_at`.
    #[error("idempotency key '{key}' expired at {expires_at}")]
    Expired {
        key: String,
        expires_at: DateTime<Utc>,
    },

    #[error("idempotency key '{key}' is {status}; cannot {action}")]
    InvalidState {
        key: String,
        status: OperationStatus,
        action: &'static str,
    },

    #[error("idempotency key '{key}' used all {attempts} attempt(s)")]
    Exhausted { key: String, attempts: u32 },

    #[error("failed to encode or decode payload")]
    Serialization(#[from] serde_json::Error),

    #[error("idempotency storage error")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
