//! Symmetric keys and their derivation.
//!
//! Recovery keys are typed by people, so they go through Argon2id. Bottle
//! entropy is already uniformly random and only needs domain separation.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of symmetric keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// SHA-256 fingerprint of the key, base64-encoded.
    ///
    /// Published next to wrapped keys so receivers can detect a swapped key.
    pub fn fingerprint(&self) -> String {
        crate::encode_b64(&Sha256::digest(self.bytes))
    }

    /// Derives a labelled 32-byte sub-secret (e.g. a signing seed).
    pub fn expand(&self, label: &str) -> [u8; KEY_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.bytes);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Salt for key derivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Salt {
    bytes: [u8; SALT_SIZE],
}

impl Salt {
    /// Generates a random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Derives a stable salt from an account-scoped label such as an altDSID.
    pub fn for_label(label: &str) -> Self {
        let digest = Sha256::digest(label.as_bytes());
        let mut bytes = [0u8; SALT_SIZE];
        bytes.copy_from_slice(&digest[..SALT_SIZE]);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.bytes
    }
}

/// Argon2id parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Time cost (iterations).
    pub time_cost: u32,
    /// Parallelism factor.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 19 * 1024, // 19 MiB
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for simulations and tests. Not for real secrets.
    pub fn minimal() -> Self {
        Self {
            memory_cost: 256,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Derives a key from a human-entered secret using Argon2id.
pub fn derive_key(secret: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<SymmetricKey> {
    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut key_bytes)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok(SymmetricKey::from_bytes(key_bytes))
}

/// Derives a key from random entropy and a context label.
pub fn derive_from_entropy(entropy: &[u8], label: &str) -> SymmetricKey {
    let mut hasher = Sha256::new();
    hasher.update(b"octagon-entropy-v1");
    hasher.update((label.len() as u64).to_be_bytes());
    hasher.update(label.as_bytes());
    hasher.update(entropy);
    SymmetricKey::from_bytes(hasher.finalize().into())
}

/// Generates a random symmetric key.
pub fn generate_random_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SymmetricKey::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        let salt = Salt::for_label("altdsid");
        let a = derive_key("ABCD-EFGH", &salt, &KdfParams::minimal()).unwrap();
        let b = derive_key("ABCD-EFGH", &salt, &KdfParams::minimal()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn derive_key_depends_on_salt() {
        let a = derive_key("secret", &Salt::for_label("a"), &KdfParams::minimal()).unwrap();
        let b = derive_key("secret", &Salt::for_label("b"), &KdfParams::minimal()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn entropy_derivation_separates_labels() {
        let a = derive_from_entropy(&[9u8; 32], "one");
        let b = derive_from_entropy(&[9u8; 32], "two");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn expand_separates_labels() {
        let key = generate_random_key();
        assert_ne!(key.expand("signing"), key.expand("encryption"));
    }

    #[test]
    fn debug_redacts() {
        let key = generate_random_key();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
