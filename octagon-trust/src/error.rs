//! Error types for the trust layer.

use octagon_crypto::CryptoError;
use octagon_types::PeerId;
use thiserror::Error;

/// Result type for trust operations.
pub type TrustResult<T> = Result<T, TrustError>;

/// Errors raised while evaluating policies or trust.
#[derive(Debug, Error)]
pub enum TrustError {
    /// No document is known for this policy version.
    #[error("unknown policy version {0}")]
    UnknownPolicyVersion(u64),

    /// A document's content does not match its declared hash.
    #[error("policy {version} hash mismatch: declared {declared}, computed {computed}")]
    PolicyHashMismatch {
        version: u64,
        declared: String,
        computed: String,
    },

    /// Introducer map is not transitively closed.
    #[error("policy {version}: {category} is reachable from {via} without being listed")]
    PolicyNotClosed {
        version: u64,
        category: String,
        via: String,
    },

    /// A view rule pattern does not compile.
    #[error("policy {version}: invalid rule for view {view}: {reason}")]
    InvalidViewRule {
        version: u64,
        view: String,
        reason: String,
    },

    /// A peer's ID does not derive from its signing key.
    #[error("peer id {0} does not match its signing key")]
    PeerIdMismatch(PeerId),

    /// A signature did not verify.
    #[error("invalid {what} signature from {peer}")]
    InvalidSignature { peer: PeerId, what: &'static str },

    /// The peer is not in the graph.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// A peer's permanent info changed.
    #[error("permanent info for {0} changed")]
    PermanentInfoChanged(PeerId),

    /// A model has no category in the evaluating policy.
    #[error("model {0} has no category")]
    UnknownModel(String),

    /// The sponsor's category may not introduce the candidate's.
    #[error("{sponsor_category} devices may not introduce {candidate_category} devices")]
    IntroductionNotAllowed {
        sponsor_category: String,
        candidate_category: String,
    },

    /// Frozen policy versions only move forward.
    #[error("frozen policy for {peer} would go from {from} to {to}")]
    FrozenPolicyRegression { peer: PeerId, from: u64, to: u64 },

    /// The peer is not trusted by itself or its clique.
    #[error("peer {0} is not trusted")]
    NotTrusted(PeerId),

    /// Recovery key input was malformed.
    #[error("invalid recovery key: {0}")]
    InvalidRecoveryKey(String),

    /// Bottle did not belong to the peer or secret it was opened with.
    #[error("bottle mismatch: {0}")]
    BottleMismatch(String),

    /// Underlying crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
