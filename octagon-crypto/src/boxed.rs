//! Curve25519 boxes (X25519 + XSalsa20-Poly1305) between two peers.
//!
//! Used to hand a view's top-level key to another peer: the sender boxes the
//! key to the receiver's encryption public key.

use crypto_box::aead::{Aead, Nonce};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// Nonce size for XSalsa20.
pub const BOX_NONCE_SIZE: usize = 24;

/// An X25519 key pair used for receiving boxed key shares.
#[derive(Clone)]
pub struct EncryptionKeyPair {
    secret: SecretKey,
}

/// X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicEncryptionKey(PublicKey);

/// A boxed message. Both halves are base64 so the record is JSON friendly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxedMessage {
    pub nonce: String,
    pub ciphertext: String,
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_secret(bytes)
    }

    pub fn from_secret(bytes: [u8; 32]) -> Self {
        Self {
            secret: SecretKey::from(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> PublicEncryptionKey {
        PublicEncryptionKey(self.secret.public_key())
    }
}

impl std::fmt::Debug for EncryptionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyPair")
            .field("public", &self.public_key().to_base64())
            .finish()
    }
}

impl PublicEncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        crate::encode_b64(&self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        Ok(Self::from_bytes(crate::decode_b64_array::<32>(encoded)?))
    }
}

/// Boxes `plaintext` from `sender` to `recipient`.
pub fn seal_to(
    recipient: &PublicEncryptionKey,
    sender: &EncryptionKeyPair,
    plaintext: &[u8],
) -> CryptoResult<BoxedMessage> {
    let salsa = SalsaBox::new(&recipient.0, &sender.secret);
    let mut nonce_bytes = [0u8; BOX_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::<SalsaBox>::from_slice(&nonce_bytes);
    let ciphertext = salsa
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(BoxedMessage {
        nonce: crate::encode_b64(&nonce_bytes),
        ciphertext: crate::encode_b64(&ciphertext),
    })
}

/// Opens a box addressed to `recipient` from `sender`.
pub fn open_from(
    sender: &PublicEncryptionKey,
    recipient: &EncryptionKeyPair,
    message: &BoxedMessage,
) -> CryptoResult<Vec<u8>> {
    let nonce_bytes = crate::decode_b64_array::<BOX_NONCE_SIZE>(&message.nonce)?;
    let ciphertext = crate::decode_b64(&message.ciphertext)?;
    let salsa = SalsaBox::new(&sender.0, &recipient.secret);
    salsa
        .decrypt(Nonce::<SalsaBox>::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption("box did not open".into()))
}
