//! Trust status and debug dumps.

use crate::keysync::ViewKeyState;
use octagon_trust::Peer;
use octagon_types::{AccountMetadata, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Membership of the local peer in its clique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliqueStatus {
    In,
    NotIn,
    /// No account, or no local identity.
    Absent,
    NoCloudKitAccount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStatus {
    pub status: CliqueStatus,
    pub peer_id: Option<PeerId>,
    /// Trusted peers other than self.
    pub trusted_peer_count: usize,
    /// Some trusted peer distrusts us.
    pub is_excluded: bool,
    pub is_locked: bool,
    pub state: String,
}

/// Snapshot of a context for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustDump {
    pub container: String,
    pub context: String,
    pub state: String,
    pub metadata: AccountMetadata,
    pub self_peer: Option<Peer>,
    pub peers: Vec<Peer>,
    pub trusted: Vec<PeerId>,
    pub excluded: Vec<PeerId>,
    pub views: BTreeMap<String, ViewKeyState>,
    pub ready_flags: Vec<String>,
    pub pending_flags: Vec<String>,
    pub policy_versions: Vec<u64>,
}
