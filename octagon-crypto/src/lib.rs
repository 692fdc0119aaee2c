//! Cryptographic building blocks for Octagon.
//!
//! - Argon2id derivation for human-entered recovery keys
//! - ChaCha20-Poly1305 sealing for bottles
//! - Ed25519 signing keys for peer identities and vouchers
//! - Curve25519 boxes for sharing top-level keys between peers
//!
//! Nothing here invents a scheme; it wraps well-known constructions behind
//! small, typed APIs.

pub mod boxed;
pub mod cipher;
pub mod error;
pub mod key;
pub mod signing;

pub use boxed::{open_from, seal_to, BoxedMessage, EncryptionKeyPair, PublicEncryptionKey};
pub use cipher::{open, seal, SealedData, NONCE_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_from_entropy, derive_key, generate_random_key, KdfParams, Salt, SymmetricKey, KEY_SIZE,
};
pub use signing::{PublicSigningKey, Signature, SigningKeyPair};

use base64::{engine::general_purpose::STANDARD, Engine};

/// Base64-encodes bytes for JSON transport.
pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes base64 produced by [`encode_b64`].
pub fn decode_b64(encoded: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Decodes base64 into a fixed-size array.
pub fn decode_b64_array<const N: usize>(encoded: &str) -> CryptoResult<[u8; N]> {
    let bytes = decode_b64(encoded)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        actual: bytes.len(),
    })
}
