//! The remote peer-list service and an in-memory implementation.
//!
//! The service stores every peer's signed records per container, checks
//! vouchers on join, and rejects updates whose clocks do not advance. It
//! never evaluates trust itself; each peer does that locally.

use crate::cloud::CloudNotification;
use crate::error::{OctagonError, OctagonResult};
use async_trait::async_trait;
use octagon_crypto::PublicSigningKey;
use octagon_trust::{
    builtin_policies, Bottle, Peer, PeerDynamicInfo, PeerStableInfo, PolicyDocument, Signed,
    Viability, Voucher, VoucherSponsor,
};
use octagon_types::{ContainerName, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Creates a new clique with a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishRequest {
    pub peer: Peer,
    pub bottle: Option<Bottle>,
}

/// Adds a peer on the strength of a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer: Peer,
    pub voucher: Voucher,
    pub bottle: Option<Bottle>,
}

/// New stable and/or dynamic info for an existing peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustUpdate {
    pub peer_id: PeerId,
    pub stable: Option<Signed<PeerStableInfo>>,
    pub dynamic: Option<Signed<PeerDynamicInfo>>,
}

/// The full peer list of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListChanges {
    pub peers: Vec<Peer>,
    /// Increases with every accepted write.
    pub change_token: u64,
}

/// A bottle and how useful it is for restoring trust.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViableBottle {
    pub bottle: Bottle,
    pub viability: Viability,
    pub device_name: Option<String>,
}

/// The remote peer-list service ("Cuttlefish").
#[async_trait]
pub trait PeerListService: Send + Sync {
    /// Wipes a container: peers and bottles.
    async fn reset(&self, container: &ContainerName) -> OctagonResult<()>;

    async fn establish(
        &self,
        container: &ContainerName,
        request: EstablishRequest,
    ) -> OctagonResult<PeerListChanges>;

    async fn join(
        &self,
        container: &ContainerName,
        request: JoinRequest,
    ) -> OctagonResult<PeerListChanges>;

    /// Applied atomically. A clock that does not advance past the stored
    /// one is a transactional conflict.
    async fn update_trust(
        &self,
        container: &ContainerName,
        update: TrustUpdate,
    ) -> OctagonResult<PeerListChanges>;

    async fn fetch_changes(&self, container: &ContainerName) -> OctagonResult<PeerListChanges>;

    async fn fetch_viable_bottles(
        &self,
        container: &ContainerName,
    ) -> OctagonResult<Vec<ViableBottle>>;

    /// Documents for the requested versions the service knows about.
    async fn fetch_policy_documents(
        &self,
        container: &ContainerName,
        versions: &[u64],
    ) -> OctagonResult<Vec<PolicyDocument>>;
}

// ── In-memory service ────────────────────────────────────────────

/// Service operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceOp {
    Reset,
    Establish,
    Join,
    UpdateTrust,
    FetchChanges,
    FetchViableBottles,
    FetchPolicyDocuments,
}

/// A failure to return from the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Network,
    ServiceUnavailable { retry_after_secs: Option<u64> },
    Conflict,
    /// A non-retryable refusal.
    Fatal(String),
}

impl Fault {
    fn into_error(self, op: ServiceOp) -> OctagonError {
        match self {
            Fault::Network => OctagonError::Network("injected network failure".into()),
            Fault::ServiceUnavailable { retry_after_secs } => {
                OctagonError::ServiceUnavailable { retry_after_secs }
            }
            Fault::Conflict => OctagonError::TransactionalConflict("injected conflict".into()),
            Fault::Fatal(reason) => match op {
                ServiceOp::Establish => OctagonError::EstablishFailed(reason),
                ServiceOp::Join => OctagonError::JoinRejected(reason),
                _ => OctagonError::InvalidRequest(reason),
            },
        }
    }
}

#[derive(Debug, Default)]
struct ContainerState {
    peers: BTreeMap<PeerId, Peer>,
    bottles: Vec<Bottle>,
    change_token: u64,
}

impl ContainerState {
    fn changes(&self) -> PeerListChanges {
        PeerListChanges {
            peers: self.peers.values().cloned().collect(),
            change_token: self.change_token,
        }
    }

    fn sponsor_key(&self, sponsor: &VoucherSponsor) -> Option<PublicSigningKey> {
        match sponsor {
            VoucherSponsor::Peer(id) => self.peers.get(id)?.permanent.signing_key().ok(),
            VoucherSponsor::RecoveryKey(key) => {
                let registered = self.peers.values().any(|p| {
                    p.stable_info()
                        .is_some_and(|s| s.recovery_signing_key.as_ref() == Some(key))
                });
                if registered {
                    PublicSigningKey::from_base64(key).ok()
                } else {
                    None
                }
            }
        }
    }

    fn viability(&self, peer_id: &PeerId) -> Viability {
        let Some(peer) = self.peers.get(peer_id) else {
            return Viability::None;
        };
        let distrusted = peer.is_self_excluded()
            || self
                .peers
                .values()
                .filter_map(|p| p.dynamic_info())
                .any(|d| d.excluded.contains(peer_id));
        if distrusted {
            return Viability::Partial;
        }
        let included = self
            .peers
            .values()
            .filter_map(|p| p.dynamic_info())
            .any(|d| d.included.contains(peer_id));
        if included {
            Viability::Full
        } else {
            Viability::Partial
        }
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    containers: HashMap<ContainerName, ContainerState>,
    policies: BTreeMap<u64, PolicyDocument>,
    faults: HashMap<ServiceOp, VecDeque<Fault>>,
    calls: HashMap<ServiceOp, usize>,
}

/// In-process [`PeerListService`] with fault injection.
pub struct InMemoryPeerListService {
    state: Mutex<ServiceState>,
    notifier: Option<broadcast::Sender<CloudNotification>>,
}

impl InMemoryPeerListService {
    /// A service that knows the built-in policies and sends no pushes.
    pub fn new() -> Self {
        let policies = builtin_policies()
            .into_iter()
            .map(|doc| (doc.version.number, doc))
            .collect();
        Self {
            state: Mutex::new(ServiceState {
                policies,
                ..ServiceState::default()
            }),
            notifier: None,
        }
    }

    /// Sends a push through `notifier` after every accepted write.
    #[must_use]
    pub fn with_notifier(mut self, notifier: broadcast::Sender<CloudNotification>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Makes the next call of `op` fail with `fault`. Faults queue up.
    pub fn inject_fault(&self, op: ServiceOp, fault: Fault) {
        self.state().faults.entry(op).or_default().push_back(fault);
    }

    /// How many times `op` has been called, failed calls included.
    pub fn call_count(&self, op: ServiceOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Makes a policy document available for refetch.
    pub fn publish_policy(&self, doc: PolicyDocument) {
        self.state().policies.insert(doc.version.number, doc);
    }

    pub fn peer(&self, container: &ContainerName, peer_id: &PeerId) -> Option<Peer> {
        self.state()
            .containers
            .get(container)
            .and_then(|c| c.peers.get(peer_id).cloned())
    }

    pub fn peer_count(&self, container: &ContainerName) -> usize {
        self.state()
            .containers
            .get(container)
            .map_or(0, |c| c.peers.len())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counts the call and pops an injected fault, if any.
    fn begin(&self, op: ServiceOp) -> OctagonResult<()> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(fault) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!(?op, ?fault, "injecting fault");
            return Err(fault.into_error(op));
        }
        Ok(())
    }

    fn notify(&self, container: &ContainerName) {
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(CloudNotification::PeerListChanged {
                container: container.clone(),
            });
        }
    }

    fn write<T>(
        &self,
        container: &ContainerName,
        apply: impl FnOnce(&mut ContainerState) -> OctagonResult<T>,
    ) -> OctagonResult<T> {
        let result = {
            let mut state = self.state();
            let entry = state.containers.entry(container.clone()).or_default();
            let result = apply(entry)?;
            entry.change_token += 1;
            result
        };
        self.notify(container);
        Ok(result)
    }
}

impl Default for InMemoryPeerListService {
    fn default() -> Self {
        Self::new()
    }
}

fn check_peer(peer: &Peer, rejected: fn(String) -> OctagonError) -> OctagonResult<()> {
    peer.verify()
        .map_err(|e| rejected(format!("peer {} does not verify: {e}", peer.id())))?;
    if peer.stable.is_none() || peer.dynamic.is_none() {
        return Err(rejected(format!(
            "peer {} is missing stable or dynamic info",
            peer.id()
        )));
    }
    Ok(())
}

fn check_bottle(bottle: Option<&Bottle>, peer: &Peer) -> OctagonResult<()> {
    let Some(bottle) = bottle else {
        return Ok(());
    };
    if &bottle.peer_id != peer.id() {
        return Err(OctagonError::InvalidRequest(format!(
            "bottle for {} submitted with peer {}",
            bottle.peer_id,
            peer.id()
        )));
    }
    bottle.verify(&peer.permanent.signing_key()?)?;
    Ok(())
}

#[async_trait]
impl PeerListService for InMemoryPeerListService {
    async fn reset(&self, container: &ContainerName) -> OctagonResult<()> {
        self.begin(ServiceOp::Reset)?;
        self.write(container, |c| {
            c.peers.clear();
            c.bottles.clear();
            Ok(())
        })?;
        info!(%container, "container reset");
        Ok(())
    }

    async fn establish(
        &self,
        container: &ContainerName,
        request: EstablishRequest,
    ) -> OctagonResult<PeerListChanges> {
        self.begin(ServiceOp::Establish)?;
        check_peer(&request.peer, OctagonError::EstablishFailed)?;
        check_bottle(request.bottle.as_ref(), &request.peer)?;

        let peer_id = request.peer.id().clone();
        let changes = self.write(container, |c| {
            if let Some(bottle) = request.bottle {
                c.bottles.push(bottle);
            }
            c.peers.insert(peer_id.clone(), request.peer);
            Ok(c.changes())
        })?;
        info!(%container, peer = %peer_id, "established");
        Ok(changes)
    }

    async fn join(
        &self,
        container: &ContainerName,
        request: JoinRequest,
    ) -> OctagonResult<PeerListChanges> {
        self.begin(ServiceOp::Join)?;
        check_peer(&request.peer, OctagonError::JoinRejected)?;
        check_bottle(request.bottle.as_ref(), &request.peer)?;
        if !request.voucher.is_for(&request.peer.permanent) {
            return Err(OctagonError::JoinRejected(
                "voucher names a different peer".into(),
            ));
        }

        let JoinRequest {
            mut peer,
            voucher,
            bottle,
        } = request;
        let peer_id = peer.id().clone();
        let changes = self.write(container, |c| {
            let key = c.sponsor_key(&voucher.sponsor).ok_or_else(|| {
                OctagonError::JoinRejected(format!("unknown sponsor {:?}", voucher.sponsor))
            })?;
            voucher
                .verify(&key)
                .map_err(|e| OctagonError::JoinRejected(e.to_string()))?;
            if !peer.vouchers.contains(&voucher) {
                peer.vouchers.push(voucher);
            }
            if let Some(bottle) = bottle {
                c.bottles.push(bottle);
            }
            c.peers.insert(peer_id.clone(), peer);
            Ok(c.changes())
        })?;
        info!(%container, peer = %peer_id, "joined");
        Ok(changes)
    }

    async fn update_trust(
        &self,
        container: &ContainerName,
        update: TrustUpdate,
    ) -> OctagonResult<PeerListChanges> {
        self.begin(ServiceOp::UpdateTrust)?;
        let TrustUpdate {
            peer_id,
            stable,
            dynamic,
        } = update;

        self.write(container, |c| {
            let peer = c
                .peers
                .get_mut(&peer_id)
                .ok_or_else(|| OctagonError::NotFound(format!("peer {peer_id}")))?;
            let key = peer.permanent.signing_key()?;

            if let Some(stable) = &stable {
                stable.verify(&key, &peer_id)?;
                if let Some(current) = &peer.stable {
                    if current != stable && current.info.clock >= stable.info.clock {
                        return Err(OctagonError::TransactionalConflict(format!(
                            "stable clock {} is not after {}",
                            stable.info.clock, current.info.clock
                        )));
                    }
                }
            }
            if let Some(dynamic) = &dynamic {
                dynamic.verify(&key, &peer_id)?;
                if let Some(current) = &peer.dynamic {
                    if current != dynamic && current.info.clock >= dynamic.info.clock {
                        return Err(OctagonError::TransactionalConflict(format!(
                            "dynamic clock {} is not after {}",
                            dynamic.info.clock, current.info.clock
                        )));
                    }
                }
            }

            if stable.is_some() {
                peer.stable = stable;
            }
            if dynamic.is_some() {
                peer.dynamic = dynamic;
            }
            debug!(peer = %peer_id, "trust updated");
            Ok(c.changes())
        })
    }

    async fn fetch_changes(&self, container: &ContainerName) -> OctagonResult<PeerListChanges> {
        self.begin(ServiceOp::FetchChanges)?;
        Ok(self
            .state()
            .containers
            .get(container)
            .map(ContainerState::changes)
            .unwrap_or_default())
    }

    async fn fetch_viable_bottles(
        &self,
        container: &ContainerName,
    ) -> OctagonResult<Vec<ViableBottle>> {
        self.begin(ServiceOp::FetchViableBottles)?;
        let state = self.state();
        let Some(c) = state.containers.get(container) else {
            return Ok(Vec::new());
        };
        Ok(c.bottles
            .iter()
            .map(|bottle| ViableBottle {
                bottle: bottle.clone(),
                viability: c.viability(&bottle.peer_id),
                device_name: c
                    .peers
                    .get(&bottle.peer_id)
                    .and_then(|p| p.stable_info())
                    .map(|s| s.device_name.clone()),
            })
            .collect())
    }

    async fn fetch_policy_documents(
        &self,
        _container: &ContainerName,
        versions: &[u64],
    ) -> OctagonResult<Vec<PolicyDocument>> {
        self.begin(ServiceOp::FetchPolicyDocuments)?;
        let state = self.state();
        let docs: Vec<PolicyDocument> = versions
            .iter()
            .filter_map(|v| state.policies.get(v).cloned())
            .collect();
        if docs.len() < versions.len() {
            warn!(?versions, found = docs.len(), "some policy versions are unknown");
        }
        Ok(docs)
    }
}
