//! The local peer's secret identity and its preparation for joining.

use crate::error::{TrustError, TrustResult};
use crate::peer::{
    PeerDynamicInfo, PeerPermanentInfo, PeerStableInfo, Signed, UserControllableViewStatus,
};
use crate::policy::{PolicyEngine, FROZEN_POLICY_VERSION};
use octagon_crypto::{decode_b64_array, encode_b64, EncryptionKeyPair, SigningKeyPair};
use octagon_types::PeerId;
use serde::{Deserialize, Serialize};

/// Facts about the local device that go into permanent and stable info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub machine_id: String,
    pub model_id: String,
    pub device_name: String,
    pub os_version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            machine_id: "MID-local".to_string(),
            model_id: "iPhone17,1".to_string(),
            device_name: "iPhone".to_string(),
            os_version: "18.0".to_string(),
        }
    }
}

/// The local peer: its key pairs and permanent info.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    signing: SigningKeyPair,
    encryption: EncryptionKeyPair,
    permanent: PeerPermanentInfo,
}

/// Keychain encoding of a [`LocalIdentity`].
#[derive(Serialize, Deserialize)]
struct IdentitySecrets {
    signing_seed: String,
    encryption_secret: String,
    permanent: PeerPermanentInfo,
}

impl LocalIdentity {
    /// Creates a fresh identity for this device.
    pub fn generate(device: &DeviceInfo, epoch: u64) -> Self {
        Self::from_keys(SigningKeyPair::generate(), EncryptionKeyPair::generate(), device, epoch)
    }

    pub fn from_keys(
        signing: SigningKeyPair,
        encryption: EncryptionKeyPair,
        device: &DeviceInfo,
        epoch: u64,
    ) -> Self {
        let signing_public = signing.public_key();
        let permanent = PeerPermanentInfo {
            peer_id: PeerId::from_signing_key(&signing_public.to_bytes()),
            machine_id: device.machine_id.clone(),
            model_id: device.model_id.clone(),
            epoch,
            signing_public_key: signing_public.to_base64(),
            encryption_public_key: encryption.public_key().to_base64(),
        };
        Self {
            signing,
            encryption,
            permanent,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.permanent.peer_id
    }

    pub fn permanent(&self) -> &PeerPermanentInfo {
        &self.permanent
    }

    pub fn signing_key(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub fn encryption_key(&self) -> &EncryptionKeyPair {
        &self.encryption
    }

    pub fn sign_stable(&self, info: PeerStableInfo) -> TrustResult<Signed<PeerStableInfo>> {
        Signed::sign(info, &self.signing)
    }

    pub fn sign_dynamic(&self, info: PeerDynamicInfo) -> TrustResult<Signed<PeerDynamicInfo>> {
        Signed::sign(info, &self.signing)
    }

    /// Encodes the identity for the keychain.
    pub fn to_secret_bytes(&self) -> TrustResult<Vec<u8>> {
        let secrets = IdentitySecrets {
            signing_seed: encode_b64(&self.signing.seed()),
            encryption_secret: encode_b64(&self.encryption.secret_bytes()),
            permanent: self.permanent.clone(),
        };
        Ok(serde_json::to_vec(&secrets)?)
    }

    /// Decodes [`LocalIdentity::to_secret_bytes`], checking the keys still
    /// match the stored permanent info.
    pub fn from_secret_bytes(bytes: &[u8]) -> TrustResult<Self> {
        let secrets: IdentitySecrets = serde_json::from_slice(bytes)?;
        let signing = SigningKeyPair::from_seed(&decode_b64_array::<32>(&secrets.signing_seed)?);
        let encryption =
            EncryptionKeyPair::from_secret(decode_b64_array::<32>(&secrets.encryption_secret)?);
        if signing.public_key().to_base64() != secrets.permanent.signing_public_key
            || encryption.public_key().to_base64() != secrets.permanent.encryption_public_key
        {
            return Err(TrustError::PeerIdMismatch(secrets.permanent.peer_id));
        }
        Ok(Self {
            signing,
            encryption,
            permanent: secrets.permanent,
        })
    }

    /// Builds and signs this peer's first stable info.
    ///
    /// The frozen version is the oldest supported policy; the flexible
    /// version is the newest one the engine knows.
    pub fn prepare(
        &self,
        device: &DeviceInfo,
        policies: &PolicyEngine,
        user_controllable_views: UserControllableViewStatus,
    ) -> TrustResult<PreparedPeer> {
        let frozen = policies.resolve_number(FROZEN_POLICY_VERSION)?.version.clone();
        let flexible = policies.prevailing().map(|doc| doc.version.clone());
        let stable = PeerStableInfo {
            clock: 1,
            frozen_policy_version: frozen,
            flexible_policy_version: flexible,
            user_controllable_views,
            device_name: device.device_name.clone(),
            os_version: device.os_version.clone(),
            recovery_signing_key: None,
            recovery_encryption_key: None,
        };
        Ok(PreparedPeer {
            permanent: self.permanent.clone(),
            stable: self.sign_stable(stable)?,
        })
    }
}

/// Output of identity preparation: what a sponsor needs to vouch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedPeer {
    pub permanent: PeerPermanentInfo,
    pub stable: Signed<PeerStableInfo>,
}

impl PreparedPeer {
    pub fn peer_id(&self) -> &PeerId {
        &self.permanent.peer_id
    }

    /// Checks the ID derivation and the stable info signature.
    pub fn verify(&self) -> TrustResult<()> {
        self.permanent.verify_id()?;
        self.stable
            .verify(&self.permanent.signing_key()?, &self.permanent.peer_id)
    }
}
