//! Durable per-account metadata.

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Whether an iCloud account is signed in on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcloudAccountState {
    #[default]
    Unknown,
    Available,
    Absent,
}

/// Whether the local peer is a trusted member of the clique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    #[default]
    Unknown,
    Trusted,
    Untrusted,
}

/// Cloud data protection enablement for the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdpState {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

/// Whether this device has ever tried to join the clique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptedJoinState {
    #[default]
    Unknown,
    Attempted,
    NotAttempted,
}

/// The durable record kept per (container, context).
///
/// Always written as a whole. A record that cannot be decoded loads as
/// `AccountMetadata::default()`, every state `Unknown` and no peer ID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountMetadata {
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    #[serde(default)]
    pub icloud_account_state: IcloudAccountState,
    #[serde(default)]
    pub trust_state: TrustState,
    #[serde(default)]
    pub cdp_state: CdpState,
    #[serde(default)]
    pub attempted_join: AttemptedJoinState,
    /// Account identifier recorded at sign-in.
    #[serde(default)]
    pub alt_dsid: Option<String>,
}

impl AccountMetadata {
    /// Metadata for a freshly signed-in account.
    #[must_use]
    pub fn signed_in(alt_dsid: Option<String>) -> Self {
        Self {
            icloud_account_state: IcloudAccountState::Available,
            alt_dsid,
            ..Self::default()
        }
    }

    /// Returns true if the account is signed in and the local peer is trusted.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.icloud_account_state == IcloudAccountState::Available
            && self.trust_state == TrustState::Trusted
            && self.peer_id.is_some()
    }

    /// Encodes to the JSON blob written by the account store.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a JSON blob written by [`AccountMetadata::to_json`].
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
