//! Human-enterable recovery keys.
//!
//! A recovery key is 28 characters in seven dash-separated groups, drawn from
//! an alphabet without easily confused glyphs. It deterministically derives a
//! signing and an encryption key pair; registering the public halves in a
//! trusted peer's stable info lets the key vouch for new peers later.

use crate::error::{TrustError, TrustResult};
use crate::voucher::VoucherSponsor;
use octagon_crypto::{derive_key, EncryptionKeyPair, KdfParams, Salt, SigningKeyPair};
use rand::Rng;

const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTVWXYZ";
const GROUPS: usize = 7;
const GROUP_LEN: usize = 4;

/// A validated, normalized recovery key.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    code: String,
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey").field("code", &"[REDACTED]").finish()
    }
}

impl RecoveryKey {
    /// Generates a new random recovery key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let groups: Vec<String> = (0..GROUPS)
            .map(|_| {
                (0..GROUP_LEN)
                    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                    .collect()
            })
            .collect();
        Self {
            code: groups.join("-"),
        }
    }

    /// Parses user input. Case, spaces and underscores are normalized.
    pub fn from_input(input: &str) -> TrustResult<Self> {
        let normalized = input
            .trim()
            .to_uppercase()
            .replace([' ', '_'], "-");

        let groups: Vec<&str> = normalized.split('-').filter(|g| !g.is_empty()).collect();
        if groups.len() != GROUPS {
            return Err(TrustError::InvalidRecoveryKey(format!(
                "expected {GROUPS} groups, got {}",
                groups.len()
            )));
        }
        for group in &groups {
            if group.len() != GROUP_LEN {
                return Err(TrustError::InvalidRecoveryKey(format!(
                    "group {group} is not {GROUP_LEN} characters"
                )));
            }
            if let Some(bad) = group.bytes().find(|b| !ALPHABET.contains(b)) {
                return Err(TrustError::InvalidRecoveryKey(format!(
                    "character {} is not allowed",
                    bad as char
                )));
            }
        }
        Ok(Self {
            code: groups.join("-"),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Derives the key pairs. `salt` is the account's altDSID.
    pub fn derive_keys(&self, salt: &str, params: &KdfParams) -> TrustResult<RecoveryKeySet> {
        let master = derive_key(&self.code, &Salt::for_label(salt), params)?;
        Ok(RecoveryKeySet {
            signing: SigningKeyPair::from_seed(&master.expand("recovery-signing")),
            encryption: EncryptionKeyPair::from_secret(master.expand("recovery-encryption")),
        })
    }
}

/// Key pairs derived from a recovery key.
#[derive(Debug, Clone)]
pub struct RecoveryKeySet {
    pub signing: SigningKeyPair,
    pub encryption: EncryptionKeyPair,
}

impl RecoveryKeySet {
    pub fn signing_public_key(&self) -> String {
        self.signing.public_key().to_base64()
    }

    pub fn encryption_public_key(&self) -> String {
        self.encryption.public_key().to_base64()
    }

    /// Voucher sponsor identity for this key.
    pub fn sponsor(&self) -> VoucherSponsor {
        VoucherSponsor::RecoveryKey(self.signing_public_key())
    }
}
