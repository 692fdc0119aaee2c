//! Cloud collaborators: account status, push notifications and key zones.
//!
//! [`SimulatedAccount`] and [`SimulatedCloud`] are in-process versions used
//! by tests and the simulation CLI. Several devices can share one
//! [`SimulatedCloud`]; each device normally gets its own account monitor.

use crate::error::{OctagonError, OctagonResult};
use async_trait::async_trait;
use octagon_crypto::BoxedMessage;
use octagon_types::{ContainerName, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const NOTIFICATION_CAPACITY: usize = 256;

/// CloudKit account status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudKitAccountStatus {
    Available,
    NoAccount,
    CouldNotDetermine,
}

/// Something changed in the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudNotification {
    AccountStatusChanged(CloudKitAccountStatus),
    /// The account was promoted to (or demoted from) two-factor auth.
    IdmsTrustLevelChanged,
    /// The remote peer list of a container changed.
    PeerListChanged { container: ContainerName },
    /// The account's list of allowed machine IDs changed.
    MachineIdListChanged,
    /// A view's key set was written or deleted.
    ZoneChanged { container: ContainerName, view: String },
}

/// Platform account state for one device.
#[async_trait]
pub trait CloudAccountMonitor: Send + Sync {
    async fn account_status(&self) -> OctagonResult<CloudKitAccountStatus>;

    /// Whether the account has two-factor authentication.
    async fn is_hsa2(&self) -> OctagonResult<bool>;

    /// Machine IDs allowed in the clique. `None` means the list is unknown
    /// and nobody should be removed for it.
    async fn allowed_machine_ids(&self) -> OctagonResult<Option<BTreeSet<String>>>;

    fn subscribe(&self) -> broadcast::Receiver<CloudNotification>;
}

/// A TLK boxed from one peer to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlkShare {
    pub tlk_uuid: Uuid,
    pub sender: PeerId,
    pub receiver: PeerId,
    /// Sender's base64 encryption key at the time of sharing.
    pub sender_public_key: String,
    pub boxed: BoxedMessage,
}

/// The current top-level key of one view and who it has been shared with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneKeySet {
    pub tlk_uuid: Uuid,
    /// Fingerprint of the key material, for checking a decrypted share.
    pub fingerprint: String,
    pub created_by: PeerId,
    pub shares: Vec<TlkShare>,
}

impl ZoneKeySet {
    pub fn share_for(&self, receiver: &PeerId) -> impl Iterator<Item = &TlkShare> {
        self.shares
            .iter()
            .filter(move |s| &s.receiver == receiver && s.tlk_uuid == self.tlk_uuid)
    }

    pub fn receivers(&self) -> BTreeSet<PeerId> {
        self.shares
            .iter()
            .filter(|s| s.tlk_uuid == self.tlk_uuid)
            .map(|s| s.receiver.clone())
            .collect()
    }
}

/// Key-value zones holding each view's key set.
#[async_trait]
pub trait KeyZone: Send + Sync {
    async fn fetch_key_set(
        &self,
        container: &ContainerName,
        view: &str,
    ) -> OctagonResult<Option<ZoneKeySet>>;

    /// Conditional write. `expected` is the TLK the writer last saw (`None`
    /// for an empty zone); a mismatch is a [`OctagonError::ZoneConflict`].
    async fn save_key_set(
        &self,
        container: &ContainerName,
        view: &str,
        key_set: ZoneKeySet,
        expected: Option<Uuid>,
    ) -> OctagonResult<()>;

    /// Deletes every zone of a container.
    async fn delete_zones(&self, container: &ContainerName) -> OctagonResult<()>;

    /// Push notifications: peer-list and zone changes.
    fn subscribe(&self) -> broadcast::Receiver<CloudNotification>;
}

// ── Simulations ──────────────────────────────────────────────────

/// Shared in-process cloud: key zones plus the push channel.
pub struct SimulatedCloud {
    zones: Mutex<HashMap<(ContainerName, String), ZoneKeySet>>,
    pushes: broadcast::Sender<CloudNotification>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            zones: Mutex::new(HashMap::new()),
            pushes,
        }
    }

    /// Sender for pushes, handed to the peer-list service.
    pub fn notifier(&self) -> broadcast::Sender<CloudNotification> {
        self.pushes.clone()
    }

    /// Views with a key set in `container`.
    pub fn views(&self, container: &ContainerName) -> BTreeSet<String> {
        self.zones()
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, view)| view.clone())
            .collect()
    }

    /// Overwrites a zone without any check, as another writer would.
    pub fn force_key_set(&self, container: &ContainerName, view: &str, key_set: ZoneKeySet) {
        self.zones()
            .insert((container.clone(), view.to_string()), key_set);
        self.push(CloudNotification::ZoneChanged {
            container: container.clone(),
            view: view.to_string(),
        });
    }

    fn zones(&self) -> std::sync::MutexGuard<'_, HashMap<(ContainerName, String), ZoneKeySet>> {
        self.zones.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, notification: CloudNotification) {
        // No subscribers is fine.
        let _ = self.pushes.send(notification);
    }
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyZone for SimulatedCloud {
    async fn fetch_key_set(
        &self,
        container: &ContainerName,
        view: &str,
    ) -> OctagonResult<Option<ZoneKeySet>> {
        Ok(self
            .zones()
            .get(&(container.clone(), view.to_string()))
            .cloned())
    }

    async fn save_key_set(
        &self,
        container: &ContainerName,
        view: &str,
        key_set: ZoneKeySet,
        expected: Option<Uuid>,
    ) -> OctagonResult<()> {
        {
            let mut zones = self.zones();
            let key = (container.clone(), view.to_string());
            let current = zones.get(&key).map(|set| set.tlk_uuid);
            if current != expected {
                return Err(OctagonError::ZoneConflict(format!(
                    "{view}: expected {expected:?}, found {current:?}"
                )));
            }
            zones.insert(key, key_set);
        }
        debug!(%container, view, "saved zone key set");
        self.push(CloudNotification::ZoneChanged {
            container: container.clone(),
            view: view.to_string(),
        });
        Ok(())
    }

    async fn delete_zones(&self, container: &ContainerName) -> OctagonResult<()> {
        let removed: Vec<String> = {
            let mut zones = self.zones();
            let views: Vec<String> = zones
                .keys()
                .filter(|(c, _)| c == container)
                .map(|(_, v)| v.clone())
                .collect();
            for view in &views {
                zones.remove(&(container.clone(), view.clone()));
            }
            views
        };
        for view in removed {
            self.push(CloudNotification::ZoneChanged {
                container: container.clone(),
                view,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CloudNotification> {
        self.pushes.subscribe()
    }
}

#[derive(Debug)]
struct AccountState {
    status: CloudKitAccountStatus,
    hsa2: bool,
    machine_ids: Option<BTreeSet<String>>,
}

/// One device's view of the platform account.
pub struct SimulatedAccount {
    state: Mutex<AccountState>,
    events: broadcast::Sender<CloudNotification>,
}

impl SimulatedAccount {
    /// An available, two-factor account with no machine-ID list.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            state: Mutex::new(AccountState {
                status: CloudKitAccountStatus::Available,
                hsa2: true,
                machine_ids: None,
            }),
            events,
        }
    }

    pub fn set_status(&self, status: CloudKitAccountStatus) {
        self.state().status = status;
        let _ = self.events.send(CloudNotification::AccountStatusChanged(status));
    }

    pub fn set_hsa2(&self, hsa2: bool) {
        self.state().hsa2 = hsa2;
        let _ = self.events.send(CloudNotification::IdmsTrustLevelChanged);
    }

    pub fn set_machine_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().machine_ids = Some(ids.into_iter().map(Into::into).collect());
        let _ = self.events.send(CloudNotification::MachineIdListChanged);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimulatedAccount {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudAccountMonitor for SimulatedAccount {
    async fn account_status(&self) -> OctagonResult<CloudKitAccountStatus> {
        Ok(self.state().status)
    }

    async fn is_hsa2(&self) -> OctagonResult<bool> {
        Ok(self.state().hsa2)
    }

    async fn allowed_machine_ids(&self) -> OctagonResult<Option<BTreeSet<String>>> {
        Ok(self.state().machine_ids.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<CloudNotification> {
        self.events.subscribe()
    }
}
