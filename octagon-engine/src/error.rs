//! Error types for the Octagon engine.

use octagon_crypto::CryptoError;
use octagon_store::StorageError;
use octagon_trust::TrustError;
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations.
pub type OctagonResult<T> = Result<T, OctagonError>;

/// How the retry layer treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient transport or server failure. Retry with backoff.
    Retryable,
    /// Someone else changed server state first. Refetch, then retry.
    TransactionalConflict,
    /// Surfaces to the caller immediately.
    Fatal,
}

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum OctagonError {
    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport failure talking to a remote service.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service asked us to back off.
    #[error("service unavailable (retry after {retry_after_secs:?}s)")]
    ServiceUnavailable { retry_after_secs: Option<u64> },

    /// A server-side write raced another writer.
    #[error("transactional conflict: {0}")]
    TransactionalConflict(String),

    /// A key zone record changed underneath a conditional write.
    #[error("zone conflict: {0}")]
    ZoneConflict(String),

    /// Policy or trust evaluation failed.
    #[error("trust error: {0}")]
    Trust(#[from] TrustError),

    /// Cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service refused to establish a new clique.
    #[error("establish failed: {0}")]
    EstablishFailed(String),

    /// The service refused a join.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// Secrets are unavailable while the device is locked.
    #[error("device is locked")]
    DeviceLocked,

    /// No local identity has been created or restored.
    #[error("no local identity")]
    NoIdentity,

    /// The local peer is not trusted.
    #[error("local peer is not trusted")]
    NotTrusted,

    /// No account is signed in.
    #[error("no account")]
    NoAccount,

    /// The request does not make sense in the current situation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No result within the caller's budget. Background work continues.
    #[error("operation timed out")]
    Timeout,

    /// The state machine has shut down.
    #[error("channel closed")]
    ChannelClosed,
}

impl OctagonError {
    /// Classifies the error for the retry layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            OctagonError::Network(_) | OctagonError::ServiceUnavailable { .. } => {
                ErrorClass::Retryable
            }
            OctagonError::TransactionalConflict(_) | OctagonError::ZoneConflict(_) => {
                ErrorClass::TransactionalConflict
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OctagonError::ServiceUnavailable {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}
