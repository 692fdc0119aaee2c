//! Sealing with ChaCha20-Poly1305.
//!
//! Every sealed payload binds associated data (the record it belongs to), so
//! a ciphertext cut from one bottle cannot be pasted into another.

use crate::error::{CryptoError, CryptoResult};
use crate::key::SymmetricKey;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Sealed bytes plus the nonce needed to open them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedData {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the auth tag.
    pub ciphertext: Vec<u8>,
}

impl SealedData {
    /// Encodes nonce || ciphertext as base64.
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        crate::encode_b64(&bytes)
    }

    /// Decodes the output of [`SealedData::to_base64`].
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = crate::decode_b64(encoded)?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("sealed data too short".to_string()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Seals `plaintext` under `key`, binding `aad`.
pub fn seal(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> CryptoResult<SealedData> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens data produced by [`seal`] with the same key and `aad`.
pub fn open(key: &SymmetricKey, sealed: &SealedData, aad: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: sealed.ciphertext.as_ref(),
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption("wrong key, wrong context or tampered data".into()))
}
