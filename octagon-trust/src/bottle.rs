//! Bottles: a peer's identity sealed for escrow.
//!
//! A bottle lets a new device restore an old peer's keys, provided it can
//! obtain the bottle's entropy from escrow. The account salt (the altDSID)
//! is mixed into the sealing key so bottles do not move between accounts.

use crate::error::{TrustError, TrustResult};
use crate::identity::LocalIdentity;
use chrono::{DateTime, Utc};
use octagon_crypto::{
    decode_b64, derive_from_entropy, encode_b64, open, seal, PublicSigningKey, SealedData,
    Signature,
};
use octagon_types::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Size of the random bottle entropy.
pub const BOTTLE_ENTROPY_SIZE: usize = 32;

/// The escrowed half of a bottle: the entropy that unseals it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleSecret {
    pub bottle_id: Uuid,
    /// Base64 entropy.
    pub entropy: String,
}

impl std::fmt::Debug for BottleSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottleSecret")
            .field("bottle_id", &self.bottle_id)
            .field("entropy", &"[REDACTED]")
            .finish()
    }
}

/// A sealed identity, signed by the peer it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    pub bottle_id: Uuid,
    pub peer_id: PeerId,
    /// Base64 nonce || ciphertext.
    pub sealed_identity: String,
    pub created_at: DateTime<Utc>,
    pub signature: String,
}

#[derive(Serialize)]
struct BottleBody<'a> {
    bottle_id: &'a Uuid,
    peer_id: &'a PeerId,
    sealed_identity: &'a str,
    created_at: &'a DateTime<Utc>,
}

impl Bottle {
    /// Seals `identity` under fresh entropy.
    pub fn seal(identity: &LocalIdentity, salt: &str) -> TrustResult<(Self, BottleSecret)> {
        let mut entropy = [0u8; BOTTLE_ENTROPY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let bottle_id = Uuid::new_v4();

        let key = derive_from_entropy(&entropy, salt);
        let sealed = seal(&key, &identity.to_secret_bytes()?, bottle_id.as_bytes())?;

        let mut bottle = Self {
            bottle_id,
            peer_id: identity.peer_id().clone(),
            sealed_identity: sealed.to_base64(),
            created_at: Utc::now(),
            signature: String::new(),
        };
        bottle.signature = identity
            .signing_key()
            .sign(&bottle.signing_bytes()?)
            .to_base64();

        let secret = BottleSecret {
            bottle_id,
            entropy: encode_b64(&entropy),
        };
        Ok((bottle, secret))
    }

    fn signing_bytes(&self) -> TrustResult<Vec<u8>> {
        let body = BottleBody {
            bottle_id: &self.bottle_id,
            peer_id: &self.peer_id,
            sealed_identity: &self.sealed_identity,
            created_at: &self.created_at,
        };
        let mut bytes = b"bottle\0".to_vec();
        bytes.extend(serde_json::to_vec(&body)?);
        Ok(bytes)
    }

    /// Verifies the bottle signature with the bottled peer's key.
    pub fn verify(&self, key: &PublicSigningKey) -> TrustResult<()> {
        let signature = Signature::from_base64(&self.signature)?;
        key.verify(&self.signing_bytes()?, &signature)
            .map_err(|_| TrustError::InvalidSignature {
                peer: self.peer_id.clone(),
                what: "bottle",
            })
    }

    /// Unseals the identity using the escrowed secret.
    pub fn open(&self, secret: &BottleSecret, salt: &str) -> TrustResult<LocalIdentity> {
        if secret.bottle_id != self.bottle_id {
            return Err(TrustError::BottleMismatch(format!(
                "secret is for bottle {}, not {}",
                secret.bottle_id, self.bottle_id
            )));
        }
        let entropy = decode_b64(&secret.entropy)?;
        let key = derive_from_entropy(&entropy, salt);
        let sealed = SealedData::from_base64(&self.sealed_identity)?;
        let plaintext = open(&key, &sealed, self.bottle_id.as_bytes())?;
        let identity = LocalIdentity::from_secret_bytes(&plaintext)?;

        if identity.peer_id() != &self.peer_id {
            return Err(TrustError::BottleMismatch(format!(
                "bottle claims {} but contains {}",
                self.peer_id,
                identity.peer_id()
            )));
        }
        self.verify(&identity.signing_key().public_key())?;
        Ok(identity)
    }
}

/// How useful a bottle is for restoring trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Viability {
    /// The bottled peer is still trusted by the clique.
    Full,
    /// The bottled peer exists but is not currently trusted.
    Partial,
    None,
}

/// A bottle as listed to callers choosing which one to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub bottle_id: Uuid,
    pub peer_id: PeerId,
    pub device_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub viability: Viability,
}
