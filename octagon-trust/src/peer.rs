//! Peer information layers and their signatures.

use crate::error::{TrustError, TrustResult};
use crate::policy::PolicyVersion;
use crate::voucher::Voucher;
use octagon_crypto::{PublicEncryptionKey, PublicSigningKey, Signature, SigningKeyPair};
use octagon_types::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Immutable facts about a peer, fixed when its identity is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPermanentInfo {
    pub peer_id: PeerId,
    pub machine_id: String,
    pub model_id: String,
    pub epoch: u64,
    /// Base64 Ed25519 public key.
    pub signing_public_key: String,
    /// Base64 X25519 public key.
    pub encryption_public_key: String,
}

impl PeerPermanentInfo {
    pub fn signing_key(&self) -> TrustResult<PublicSigningKey> {
        Ok(PublicSigningKey::from_base64(&self.signing_public_key)?)
    }

    pub fn encryption_key(&self) -> TrustResult<PublicEncryptionKey> {
        Ok(PublicEncryptionKey::from_base64(&self.encryption_public_key)?)
    }

    /// Token another peer places in its preapprovals to admit this one.
    pub fn preapproval_token(&self) -> String {
        hex::encode(Sha256::digest(self.signing_public_key.as_bytes()))
    }

    /// Checks that the peer ID is the hash of the signing key.
    pub fn verify_id(&self) -> TrustResult<()> {
        let key = self.signing_key()?;
        if PeerId::from_signing_key(&key.to_bytes()) != self.peer_id {
            return Err(TrustError::PeerIdMismatch(self.peer_id.clone()));
        }
        Ok(())
    }
}

/// A peer's opinion on syncing user-controllable views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserControllableViewStatus {
    #[default]
    Unknown,
    Enabled,
    Disabled,
    /// Follow whatever the rest of the clique does.
    Following,
}

/// Rarely-changing, clock-versioned peer facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStableInfo {
    pub clock: u64,
    /// Oldest policy the peer honours. Never decreases.
    pub frozen_policy_version: PolicyVersion,
    /// `None` for peers that predate flexible policy versions.
    pub flexible_policy_version: Option<PolicyVersion>,
    #[serde(default)]
    pub user_controllable_views: UserControllableViewStatus,
    pub device_name: String,
    pub os_version: String,
    /// Base64 public signing key of a registered recovery key.
    #[serde(default)]
    pub recovery_signing_key: Option<String>,
    /// Base64 public encryption key of a registered recovery key.
    #[serde(default)]
    pub recovery_encryption_key: Option<String>,
}

impl PeerStableInfo {
    /// The policy version this peer evaluates trust under.
    pub fn effective_policy_version(&self) -> &PolicyVersion {
        self.flexible_policy_version
            .as_ref()
            .unwrap_or(&self.frozen_policy_version)
    }
}

/// Frequently-changing membership votes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerDynamicInfo {
    pub clock: u64,
    pub included: BTreeSet<PeerId>,
    pub excluded: BTreeSet<PeerId>,
    /// Preapproval tokens of peers this peer will admit without a voucher.
    pub preapprovals: BTreeSet<String>,
}

impl PeerDynamicInfo {
    /// Same votes, ignoring the clock.
    pub fn same_membership(&self, other: &PeerDynamicInfo) -> bool {
        self.included == other.included
            && self.excluded == other.excluded
            && self.preapprovals == other.preapprovals
    }
}

/// Info that can be signed by a peer.
pub trait SignedInfo: Serialize + DeserializeOwned + Clone {
    /// Domain separator mixed into the signed bytes.
    const KIND: &'static str;

    fn clock(&self) -> u64;
}

impl SignedInfo for PeerStableInfo {
    const KIND: &'static str = "stable";

    fn clock(&self) -> u64 {
        self.clock
    }
}

impl SignedInfo for PeerDynamicInfo {
    const KIND: &'static str = "dynamic";

    fn clock(&self) -> u64 {
        self.clock
    }
}

/// Info plus a base64 Ed25519 signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "T: SignedInfo")]
pub struct Signed<T: SignedInfo> {
    pub info: T,
    pub signature: String,
}

fn signing_bytes<T: SignedInfo>(info: &T) -> TrustResult<Vec<u8>> {
    let mut bytes = Vec::from(T::KIND.as_bytes());
    bytes.push(0);
    bytes.extend(serde_json::to_vec(info)?);
    Ok(bytes)
}

impl<T: SignedInfo> Signed<T> {
    pub fn sign(info: T, key: &SigningKeyPair) -> TrustResult<Self> {
        let signature = key.sign(&signing_bytes(&info)?).to_base64();
        Ok(Self { info, signature })
    }

    pub fn verify(&self, key: &PublicSigningKey, peer: &PeerId) -> TrustResult<()> {
        let signature = Signature::from_base64(&self.signature)?;
        key.verify(&signing_bytes(&self.info)?, &signature)
            .map_err(|_| TrustError::InvalidSignature {
                peer: peer.clone(),
                what: T::KIND,
            })
    }
}

/// Everything the peer list knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub permanent: PeerPermanentInfo,
    pub stable: Option<Signed<PeerStableInfo>>,
    pub dynamic: Option<Signed<PeerDynamicInfo>>,
    #[serde(default)]
    pub vouchers: Vec<Voucher>,
}

impl Peer {
    pub fn new(permanent: PeerPermanentInfo) -> Self {
        Self {
            permanent,
            stable: None,
            dynamic: None,
            vouchers: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.permanent.peer_id
    }

    pub fn stable_info(&self) -> Option<&PeerStableInfo> {
        self.stable.as_ref().map(|s| &s.info)
    }

    pub fn dynamic_info(&self) -> Option<&PeerDynamicInfo> {
        self.dynamic.as_ref().map(|d| &d.info)
    }

    /// A peer that excludes itself has left the clique.
    pub fn is_self_excluded(&self) -> bool {
        self.dynamic_info()
            .is_some_and(|d| d.excluded.contains(self.id()))
    }

    /// Verifies the ID derivation and both signatures.
    pub fn verify(&self) -> TrustResult<()> {
        self.permanent.verify_id()?;
        let key = self.permanent.signing_key()?;
        if let Some(stable) = &self.stable {
            stable.verify(&key, self.id())?;
        }
        if let Some(dynamic) = &self.dynamic {
            dynamic.verify(&key, self.id())?;
        }
        Ok(())
    }
}
