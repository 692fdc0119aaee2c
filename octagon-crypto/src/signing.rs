//! Ed25519 signing keys for peer identities.

use ed25519_dalek::{
    Signature as DalekSignature, Signer as _, SigningKey as DalekSigningKey, Verifier as _,
    VerifyingKey as DalekVerifyingKey,
};
use rand::rngs::OsRng;

use crate::error::{CryptoError, CryptoResult};

/// An Ed25519 key pair. The secret half never leaves the local keychain.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing: DalekSigningKey,
}

/// Ed25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicSigningKey(DalekVerifyingKey);

/// Ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature(DalekSignature);

impl SigningKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        Self {
            signing: DalekSigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuilds a key pair from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: DalekSigningKey::from_bytes(seed),
        }
    }

    /// Returns the 32-byte seed.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }

    pub fn public_key(&self) -> PublicSigningKey {
        PublicSigningKey(self.signing.verifying_key())
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &self.public_key().to_base64())
            .finish()
    }
}

impl PublicSigningKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> CryptoResult<Self> {
        DalekVerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        crate::encode_b64(&self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = crate::decode_b64_array::<32>(encoded)?;
        Self::from_bytes(&bytes)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(DalekSignature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        crate::encode_b64(&self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = crate::decode_b64_array::<64>(encoded)?;
        Ok(Self::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"stable info");
        assert!(kp.public_key().verify(b"stable info", &sig).is_ok());
        assert!(kp.public_key().verify(b"dynamic info", &sig).is_err());
    }

    #[test]
    fn seed_restores_same_identity() {
        let kp = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_base64() {
        let kp = SigningKeyPair::generate();
        let encoded = kp.public_key().to_base64();
        assert_eq!(PublicSigningKey::from_base64(&encoded).unwrap(), kp.public_key());
        assert!(PublicSigningKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn signature_base64() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"voucher");
        let restored = Signature::from_base64(&sig.to_base64()).unwrap();
        assert!(kp.public_key().verify(b"voucher", &restored).is_ok());
    }
}
