//! Vouchers: a sponsor's signed statement admitting a new peer.

use crate::error::{TrustError, TrustResult};
use crate::peer::PeerPermanentInfo;
use octagon_crypto::{PublicSigningKey, Signature, SigningKeyPair};
use octagon_types::PeerId;
use serde::{Deserialize, Serialize};

/// Who signed a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherSponsor {
    /// An existing peer, by ID.
    Peer(PeerId),
    /// A recovery key, by base64 public signing key.
    RecoveryKey(String),
}

/// Why the voucher was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherReason {
    /// Sponsor and candidate talked over an authenticated channel.
    SecureChannel,
    /// The candidate restored a sponsor's bottle.
    Bottle,
    /// The candidate knew the account recovery key.
    RecoveryKey,
}

#[derive(Serialize)]
struct VoucherBody<'a> {
    beneficiary: &'a PeerId,
    beneficiary_signing_key: &'a str,
    sponsor: &'a VoucherSponsor,
    reason: VoucherReason,
}

/// A sponsor's signature admitting `beneficiary` into the clique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub beneficiary: PeerId,
    pub beneficiary_signing_key: String,
    pub sponsor: VoucherSponsor,
    pub reason: VoucherReason,
    pub signature: String,
}

impl Voucher {
    /// Signs a voucher for `beneficiary` with the sponsor's key.
    pub fn issue(
        beneficiary: &PeerPermanentInfo,
        sponsor: VoucherSponsor,
        reason: VoucherReason,
        key: &SigningKeyPair,
    ) -> TrustResult<Self> {
        let body = VoucherBody {
            beneficiary: &beneficiary.peer_id,
            beneficiary_signing_key: &beneficiary.signing_public_key,
            sponsor: &sponsor,
            reason,
        };
        let signature = key.sign(&Self::signing_bytes(&body)?).to_base64();
        Ok(Self {
            beneficiary: beneficiary.peer_id.clone(),
            beneficiary_signing_key: beneficiary.signing_public_key.clone(),
            sponsor,
            reason,
            signature,
        })
    }

    fn signing_bytes(body: &VoucherBody<'_>) -> TrustResult<Vec<u8>> {
        let mut bytes = b"voucher\0".to_vec();
        bytes.extend(serde_json::to_vec(body)?);
        Ok(bytes)
    }

    /// Verifies the voucher against the sponsor's public key.
    pub fn verify(&self, sponsor_key: &PublicSigningKey) -> TrustResult<()> {
        let body = VoucherBody {
            beneficiary: &self.beneficiary,
            beneficiary_signing_key: &self.beneficiary_signing_key,
            sponsor: &self.sponsor,
            reason: self.reason,
        };
        let signature = Signature::from_base64(&self.signature)?;
        sponsor_key
            .verify(&Self::signing_bytes(&body)?, &signature)
            .map_err(|_| TrustError::InvalidSignature {
                peer: self.beneficiary.clone(),
                what: "voucher",
            })
    }

    /// Whether the voucher names this permanent identity.
    pub fn is_for(&self, permanent: &PeerPermanentInfo) -> bool {
        self.beneficiary == permanent.peer_id
            && self.beneficiary_signing_key == permanent.signing_public_key
    }
}
