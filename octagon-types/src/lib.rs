//! Core type definitions for Octagon.
//!
//! This crate defines the identifiers and persisted records shared by every
//! other Octagon crate:
//! - Peer identifiers derived from signing keys
//! - Container and context names that scope per-account state
//! - Per-(container, context) account metadata and its state enums

mod account;
mod ids;

pub use account::{AccountMetadata, AttemptedJoinState, CdpState, IcloudAccountState, TrustState};
pub use ids::{ContainerName, ContextId, PeerId, DEFAULT_CONTAINER, DEFAULT_CONTEXT};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}
