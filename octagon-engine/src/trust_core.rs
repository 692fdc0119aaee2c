//! The work behind every Octagon transition and request.
//!
//! [`TrustCore`] owns one context's collaborators and local caches. Its
//! methods run on the context's state machine queue (transitions and
//! requests) or directly from the API (status, dumps, escrow records).
//! Each transition method returns the next state.

use crate::cloud::{CloudAccountMonitor, CloudKitAccountStatus, KeyZone};
use crate::config::OctagonConfig;
use crate::error::{OctagonError, OctagonResult};
use crate::escrow::EscrowCache;
use crate::flags::{Condition, OctagonFlag, PendingFlag};
use crate::keychain::{Keychain, StoreKeychain};
use crate::keysync::{KeySyncCoordinator, TrustedOperation};
use crate::lock::LockStateTracker;
use crate::machine::FlagHandler;
use crate::rpc::{Attempt, RetryingRpcClient};
use crate::service::{EstablishRequest, JoinRequest, PeerListService, TrustUpdate};
use crate::status::{CliqueStatus, TrustDump, TrustStatus};
use crate::transitions::OctagonState;
use octagon_crypto::PublicEncryptionKey;
use octagon_store::AccountStore;
use octagon_trust::{
    Bottle, BottleSecret, EscrowRecord, LocalIdentity, Peer, PeerDynamicInfo, PeerTrustGraph,
    PolicyEngine, PreparedPeer, RecoveryKey, UserControllableViewStatus, Voucher, VoucherReason,
    VoucherSponsor, PRE_POLICY_VIEWS,
};
use octagon_types::{
    AccountMetadata, AttemptedJoinState, CdpState, ContainerName, ContextId, IcloudAccountState,
    PeerId, TrustState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bottle and recovery key salt for accounts without an altDSID.
const DEFAULT_SALT: &str = "default";

/// Everything a context talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: AccountStore,
    pub keychain: Arc<dyn Keychain>,
    pub service: Arc<dyn PeerListService>,
    pub zone: Arc<dyn KeyZone>,
    pub account: Arc<dyn CloudAccountMonitor>,
    pub lock: LockStateTracker,
}

impl Collaborators {
    /// Collaborators whose keychain lives in `store`.
    pub fn new(
        store: AccountStore,
        service: Arc<dyn PeerListService>,
        zone: Arc<dyn KeyZone>,
        account: Arc<dyn CloudAccountMonitor>,
        lock: LockStateTracker,
    ) -> Self {
        Self {
            keychain: Arc::new(StoreKeychain::new(store.clone(), lock.clone())),
            store,
            service,
            zone,
            account,
            lock,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("store", &self.store)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

enum IdentityLookup {
    Found(LocalIdentity),
    Missing,
    Locked,
}

/// Outcome of reconciling our published votes with the current peer list.
struct Reconciled {
    trusted: bool,
    peer_keys: BTreeMap<PeerId, PublicEncryptionKey>,
}

pub(crate) struct TrustCore {
    pub(crate) container: ContainerName,
    pub(crate) context: ContextId,
    pub(crate) config: OctagonConfig,
    store: AccountStore,
    keychain: Arc<dyn Keychain>,
    rpc: RetryingRpcClient,
    account: Arc<dyn CloudAccountMonitor>,
    pub(crate) lock: LockStateTracker,
    graph: Mutex<PeerTrustGraph>,
    policies: RwLock<PolicyEngine>,
    pub(crate) keysync: KeySyncCoordinator,
    pub(crate) escrow: EscrowCache,
    /// altDSID handed to the next sign-in.
    pending_sign_in: Mutex<Option<String>>,
    pub(crate) flags: FlagHandler,
}

impl TrustCore {
    pub(crate) fn new(
        container: ContainerName,
        context: ContextId,
        config: OctagonConfig,
        collaborators: Collaborators,
        flags: FlagHandler,
    ) -> Self {
        let Collaborators {
            store,
            keychain,
            service,
            zone,
            account,
            lock,
        } = collaborators;
        Self {
            keysync: KeySyncCoordinator::new(container.clone(), zone),
            escrow: EscrowCache::new(config.escrow_cache_ttl),
            rpc: RetryingRpcClient::new(service, config.retry.clone()),
            container,
            context,
            config,
            store,
            keychain,
            account,
            lock,
            graph: Mutex::new(PeerTrustGraph::new()),
            policies: RwLock::new(PolicyEngine::with_builtin()),
            pending_sign_in: Mutex::new(None),
            flags,
        }
    }

    // ── Local state ──────────────────────────────────────────────

    fn graph(&self) -> MutexGuard<'_, PeerTrustGraph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn policies(&self) -> RwLockReadGuard<'_, PolicyEngine> {
        self.policies.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored metadata; a missing record reads as all-unknown.
    pub(crate) fn load_metadata(&self) -> OctagonResult<AccountMetadata> {
        match self.store.load(&self.container, &self.context) {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.is_not_found() => Ok(AccountMetadata::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_metadata(&self, edit: impl FnOnce(&mut AccountMetadata)) -> OctagonResult<()> {
        let mut metadata = self.load_metadata()?;
        edit(&mut metadata);
        self.store.save(&self.container, &self.context, &metadata)?;
        Ok(())
    }

    fn salt(metadata: &AccountMetadata) -> String {
        metadata
            .alt_dsid
            .clone()
            .unwrap_or_else(|| DEFAULT_SALT.to_string())
    }

    fn lookup_identity(&self) -> OctagonResult<IdentityLookup> {
        match self.keychain.load_identity(&self.container, &self.context) {
            Ok(Some(identity)) => Ok(IdentityLookup::Found(identity)),
            Ok(None) => Ok(IdentityLookup::Missing),
            Err(OctagonError::DeviceLocked) => Ok(IdentityLookup::Locked),
            Err(e) => Err(e),
        }
    }

    fn require_identity(&self) -> OctagonResult<LocalIdentity> {
        self.keychain
            .load_identity(&self.container, &self.context)?
            .ok_or(OctagonError::NoIdentity)
    }

    fn wait_for_unlock(&self) -> OctagonState {
        self.flags.handle_pending_flag(
            PendingFlag::new(OctagonFlag::Unlocked).with_condition(Condition::DeviceUnlocked),
        );
        OctagonState::WaitForUnlock
    }

    pub(crate) fn schedule_recheck(&self) {
        self.flags.handle_pending_flag(
            PendingFlag::new(OctagonFlag::CheckTrustState).with_delay(self.config.trust_recheck_delay),
        );
    }

    pub(crate) fn set_pending_sign_in(&self, alt_dsid: Option<String>) {
        *self.pending_sign_in.lock().unwrap_or_else(|e| e.into_inner()) = alt_dsid;
    }

    /// Replaces the local peer list with the service's.
    fn absorb(&self, peers: Vec<Peer>) {
        let rejected = self.graph().apply_snapshot(peers);
        for (peer, error) in rejected {
            warn!(%peer, error = %error, "ignoring peer record");
        }
    }

    /// Fetches documents for policy versions peers declare that we lack.
    async fn fetch_missing_policies(&self) -> OctagonResult<usize> {
        let referenced = self.graph().referenced_policy_versions();
        let missing: Vec<u64> = self.policies().missing(referenced).into_iter().collect();
        if missing.is_empty() {
            return Ok(0);
        }
        debug!(?missing, "fetching policy documents");
        let docs = self
            .rpc
            .service()
            .fetch_policy_documents(&self.container, &missing)
            .await?;
        let mut accepted = 0;
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        for doc in docs {
            let version = doc.version.number;
            match policies.accept(doc) {
                Ok(()) => {
                    info!(version, "accepted policy document");
                    accepted += 1;
                }
                Err(e) => warn!(version, error = %e, "rejected policy document"),
            }
        }
        Ok(accepted)
    }

    /// One fetch of the peer list plus any policies it needs.
    async fn refresh_once(&self) -> OctagonResult<()> {
        let changes = self.rpc.service().fetch_changes(&self.container).await?;
        self.absorb(changes.peers);
        if let Err(e) = self.fetch_missing_policies().await {
            warn!(error = %e, "policy fetch failed; peers using unknown policies stay ignored");
        }
        Ok(())
    }

    async fn refresh_graph(&self) -> OctagonResult<()> {
        self.rpc.with_retry("fetch_changes", |_| self.refresh_once()).await
    }

    fn next_epoch(&self) -> u64 {
        self.graph()
            .peers()
            .map(|p| p.permanent.epoch)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn trusted_peer_keys(
        graph: &PeerTrustGraph,
        ego: &PeerId,
        trusted: &BTreeSet<PeerId>,
    ) -> BTreeMap<PeerId, PublicEncryptionKey> {
        trusted
            .iter()
            .filter(|id| *id != ego)
            .filter_map(|id| {
                let key = graph.peer(id)?.permanent.encryption_key().ok()?;
                Some((id.clone(), key))
            })
            .collect()
    }

    // ── Account transitions ──────────────────────────────────────

    pub(crate) fn initialize(&self) -> OctagonResult<OctagonState> {
        let metadata = self.load_metadata()?;
        info!(
            container = %self.container,
            context = %self.context,
            account = ?metadata.icloud_account_state,
            trust = ?metadata.trust_state,
            "loaded account metadata"
        );
        if metadata.icloud_account_state == IcloudAccountState::Available {
            Ok(OctagonState::CheckCloudKitAccount)
        } else {
            Ok(OctagonState::NoAccount)
        }
    }

    pub(crate) fn sign_in(&self) -> OctagonResult<OctagonState> {
        let alt_dsid = self
            .pending_sign_in
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.update_metadata(|m| {
            m.icloud_account_state = IcloudAccountState::Available;
            if alt_dsid.is_some() {
                m.alt_dsid = alt_dsid;
            }
        })?;
        info!(container = %self.container, context = %self.context, "account signed in");
        Ok(OctagonState::CheckCloudKitAccount)
    }

    pub(crate) async fn sign_out(&self) -> OctagonResult<OctagonState> {
        let metadata = AccountMetadata {
            icloud_account_state: IcloudAccountState::Absent,
            ..AccountMetadata::default()
        };
        self.store.save(&self.container, &self.context, &metadata)?;
        self.keychain.delete_all(&self.container, &self.context)?;
        self.graph().clear();
        self.escrow.invalidate();
        self.keysync.logout().await;
        info!(container = %self.container, context = %self.context, "account signed out");
        Ok(OctagonState::NoAccount)
    }

    pub(crate) async fn check_cloudkit(&self) -> OctagonResult<OctagonState> {
        let status = self.account.account_status().await?;
        if status != CloudKitAccountStatus::Available {
            debug!(?status, "CloudKit account not available");
            return Ok(OctagonState::WaitingForCloudKitAccount);
        }
        if !self.account.is_hsa2().await? {
            return Ok(OctagonState::WaitForHSA2);
        }
        Ok(OctagonState::DetermineCDPState)
    }

    pub(crate) async fn determine_cdp(&self) -> OctagonResult<OctagonState> {
        match self.load_metadata()?.cdp_state {
            CdpState::Enabled => Ok(OctagonState::CheckTrustState),
            CdpState::Disabled => Ok(OctagonState::WaitForCDP),
            CdpState::Unknown => {
                let changes = self.rpc.fetch_changes(&self.container).await?;
                if changes.peers.is_empty() {
                    return Ok(OctagonState::WaitForCDP);
                }
                info!(peers = changes.peers.len(), "clique exists, CDP is enabled");
                self.persist_cdp_enabled()?;
                Ok(OctagonState::CheckTrustState)
            }
        }
    }

    pub(crate) fn persist_cdp_enabled(&self) -> OctagonResult<()> {
        self.update_metadata(|m| m.cdp_state = CdpState::Enabled)
    }

    pub(crate) async fn cloudkit_lost(&self) -> OctagonResult<OctagonState> {
        self.keysync.end_trusted_operation().await;
        Ok(OctagonState::WaitingForCloudKitAccount)
    }

    // ── Trust transitions ────────────────────────────────────────

    /// Fetches, recomputes trust, and publishes new votes if they changed.
    async fn reconcile_once(
        &self,
        identity: &LocalIdentity,
        allowed_machine_ids: Option<&BTreeSet<String>>,
        attempt: Attempt,
    ) -> OctagonResult<Reconciled> {
        if attempt.after_conflict {
            debug!(attempt = attempt.number, "refetching after conflict");
        }
        self.refresh_once().await?;
        let ego = identity.peer_id();

        let (reconciled, update) = {
            let graph = self.graph();
            let policies = self.policies();
            let computation = graph.compute_trust(ego, &policies);
            if !computation.is_trusted(ego) {
                return Ok(Reconciled {
                    trusted: false,
                    peer_keys: BTreeMap::new(),
                });
            }

            let mut update = TrustUpdate {
                peer_id: ego.clone(),
                stable: None,
                dynamic: None,
            };
            if let Some((dynamic, true)) =
                graph.next_dynamic_info(ego, &policies, allowed_machine_ids)
            {
                debug!(
                    clock = dynamic.clock,
                    included = dynamic.included.len(),
                    excluded = dynamic.excluded.len(),
                    "publishing new dynamic info"
                );
                update.dynamic = Some(identity.sign_dynamic(dynamic)?);
            }

            let own_stable = graph.peer(ego).and_then(|p| p.stable_info()).cloned();
            let prevailing = graph.prevailing_policy_version(&computation.trusted);
            if let (Some(stable), Some(prevailing)) = (own_stable, prevailing) {
                let behind = stable.effective_policy_version().number < prevailing.number;
                if behind && policies.resolve(&prevailing).is_ok() {
                    info!(version = prevailing.number, "adopting newer policy version");
                    let mut next = stable;
                    next.clock += 1;
                    next.flexible_policy_version = Some(prevailing);
                    update.stable = Some(identity.sign_stable(next)?);
                }
            }

            let reconciled = Reconciled {
                trusted: true,
                peer_keys: Self::trusted_peer_keys(&graph, ego, &computation.trusted),
            };
            (reconciled, update)
        };

        if update.stable.is_some() || update.dynamic.is_some() {
            let changes = self
                .rpc
                .service()
                .update_trust(&self.container, update)
                .await?;
            self.absorb(changes.peers);
        }
        Ok(reconciled)
    }

    async fn reconcile(&self, identity: &LocalIdentity) -> OctagonResult<Reconciled> {
        let allowed = match self.account.allowed_machine_ids().await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(error = %e, "machine ID list unavailable");
                None
            }
        };
        self.rpc
            .with_retry("update_trust", |attempt| {
                self.reconcile_once(identity, allowed.as_ref(), attempt)
            })
            .await
    }

    pub(crate) async fn check_trust(&self) -> OctagonResult<OctagonState> {
        if self.lock.is_locked() {
            debug!("device locked, deferring trust check");
            return Ok(self.wait_for_unlock());
        }
        let metadata = self.load_metadata()?;
        let Some(peer_id) = metadata.peer_id else {
            debug!("no peer id, untrusted");
            return Ok(OctagonState::BecomeUntrusted);
        };
        let identity = match self.lookup_identity()? {
            IdentityLookup::Found(identity) => identity,
            IdentityLookup::Locked => return Ok(self.wait_for_unlock()),
            IdentityLookup::Missing => {
                warn!(%peer_id, "metadata names a peer but no identity is stored");
                return Ok(OctagonState::BecomeUntrusted);
            }
        };
        if identity.peer_id() != &peer_id {
            warn!(%peer_id, stored = %identity.peer_id(), "stored identity does not match metadata");
            return Ok(OctagonState::BecomeUntrusted);
        }

        if self.reconcile(&identity).await?.trusted {
            Ok(OctagonState::BecomeReady)
        } else {
            Ok(OctagonState::BecomeUntrusted)
        }
    }

    /// Trust check after a failure: retry later, sit in `Untrusted`.
    pub(crate) async fn check_trust_or_retry(&self) -> OctagonResult<OctagonState> {
        match self.check_trust().await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, delay = ?self.config.trust_recheck_delay, "trust check failed, will retry");
                self.schedule_recheck();
                Ok(OctagonState::Untrusted)
            }
        }
    }

    pub(crate) async fn update_trust(&self) -> OctagonResult<OctagonState> {
        let identity = match self.lookup_identity()? {
            IdentityLookup::Found(identity) => identity,
            IdentityLookup::Locked => return Ok(self.wait_for_unlock()),
            IdentityLookup::Missing => return Ok(OctagonState::BecomeUntrusted),
        };
        let reconciled = self.reconcile(&identity).await?;
        if !reconciled.trusted {
            info!(peer = %identity.peer_id(), "no longer trusted");
            self.escrow.invalidate();
            return Ok(OctagonState::BecomeUntrusted);
        }
        self.keysync.update_trusted_peers(reconciled.peer_keys).await;
        Ok(OctagonState::Ready)
    }

    pub(crate) async fn update_trust_or_retry(&self) -> OctagonResult<OctagonState> {
        match self.update_trust().await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(error = %e, delay = ?self.config.trust_recheck_delay, "trust update failed, will retry");
                self.schedule_recheck();
                Ok(OctagonState::Ready)
            }
        }
    }

    pub(crate) async fn become_ready(&self) -> OctagonResult<OctagonState> {
        let identity = match self.lookup_identity()? {
            IdentityLookup::Found(identity) => identity,
            IdentityLookup::Locked => return Ok(self.wait_for_unlock()),
            IdentityLookup::Missing => return Ok(OctagonState::BecomeUntrusted),
        };
        self.update_metadata(|m| m.trust_state = TrustState::Trusted)?;

        let operation = {
            let graph = self.graph();
            let policies = self.policies();
            let ego = identity.peer_id();
            let computation = graph.compute_trust(ego, &policies);
            let views = graph.effective_views(ego, &policies).unwrap_or_else(|e| {
                warn!(error = %e, "cannot resolve own views, using pre-policy views");
                PRE_POLICY_VIEWS.iter().map(|v| v.to_string()).collect()
            });
            TrustedOperation {
                self_peer: ego.clone(),
                encryption: identity.encryption_key().clone(),
                trusted_peers: Self::trusted_peer_keys(&graph, ego, &computation.trusted),
                views,
            }
        };
        self.keysync.begin_trusted_operation(operation).await;
        info!(peer = %identity.peer_id(), "trusted");
        Ok(OctagonState::Ready)
    }

    pub(crate) async fn become_untrusted(&self) -> OctagonResult<OctagonState> {
        self.update_metadata(|m| m.trust_state = TrustState::Untrusted)?;
        self.keysync.end_trusted_operation().await;
        Ok(OctagonState::Untrusted)
    }

    // ── Requests ─────────────────────────────────────────────────

    fn prepare(&self, identity: &LocalIdentity) -> OctagonResult<PreparedPeer> {
        let policies = self.policies();
        Ok(identity.prepare(
            &self.config.device,
            &policies,
            UserControllableViewStatus::Following,
        )?)
    }

    pub(crate) async fn reset_and_establish(&self) -> OctagonResult<(OctagonState, PeerId)> {
        let metadata = self.load_metadata()?;
        self.rpc.reset(&self.container).await?;
        self.keysync.reset_zones().await?;
        self.graph().clear();
        self.escrow.invalidate();

        let identity = LocalIdentity::generate(&self.config.device, 1);
        self.keychain
            .save_identity(&self.container, &self.context, &identity)?;
        let prepared = self.prepare(&identity)?;
        let dynamic = PeerDynamicInfo {
            clock: 1,
            included: BTreeSet::from([identity.peer_id().clone()]),
            ..PeerDynamicInfo::default()
        };
        let peer = Peer {
            permanent: prepared.permanent,
            stable: Some(prepared.stable),
            dynamic: Some(identity.sign_dynamic(dynamic)?),
            vouchers: Vec::new(),
        };
        let (bottle, secret) = Bottle::seal(&identity, &Self::salt(&metadata))?;
        self.keychain
            .save_bottle_secret(&self.container, &self.context, &secret)?;

        let request = EstablishRequest {
            peer,
            bottle: Some(bottle),
        };
        let changes = self.rpc.establish(&self.container, &request).await?;
        self.absorb(changes.peers);

        let peer_id = identity.peer_id().clone();
        self.update_metadata(|m| {
            m.peer_id = Some(peer_id.clone());
            m.trust_state = TrustState::Trusted;
            m.cdp_state = CdpState::Enabled;
            m.attempted_join = AttemptedJoinState::Attempted;
        })?;
        info!(container = %self.container, peer = %peer_id, "established new clique");
        Ok((OctagonState::BecomeReady, peer_id))
    }

    /// Creates and stores a fresh identity for joining.
    pub(crate) fn prepare_identity(&self) -> OctagonResult<PreparedPeer> {
        let identity = LocalIdentity::generate(&self.config.device, self.next_epoch());
        self.keychain
            .save_identity(&self.container, &self.context, &identity)?;
        let prepared = self.prepare(&identity)?;
        self.update_metadata(|m| m.peer_id = Some(identity.peer_id().clone()))?;
        info!(peer = %identity.peer_id(), "prepared identity");
        Ok(prepared)
    }

    pub(crate) async fn vouch(&self, candidate: &PreparedPeer) -> OctagonResult<Voucher> {
        let identity = self.require_identity()?;
        self.refresh_graph().await?;
        let voucher = {
            let graph = self.graph();
            let policies = self.policies();
            graph.vouch(&identity, candidate, &policies)?
        };
        info!(candidate = %candidate.peer_id(), "vouched");
        Ok(voucher)
    }

    /// Submits a join for `identity` and records the result. The new peer
    /// includes whoever the sponsors trust.
    async fn join(
        &self,
        identity: &LocalIdentity,
        voucher: Voucher,
        sponsors: &[PeerId],
    ) -> OctagonResult<PeerId> {
        let metadata = self.load_metadata()?;
        let prepared = self.prepare(identity)?;
        let mut included: BTreeSet<PeerId> = {
            let graph = self.graph();
            let policies = self.policies();
            sponsors
                .iter()
                .flat_map(|sponsor| graph.compute_trust(sponsor, &policies).trusted)
                .collect()
        };
        included.insert(identity.peer_id().clone());
        let dynamic = PeerDynamicInfo {
            clock: 1,
            included,
            ..PeerDynamicInfo::default()
        };

        let peer = Peer {
            permanent: prepared.permanent,
            stable: Some(prepared.stable),
            dynamic: Some(identity.sign_dynamic(dynamic)?),
            vouchers: vec![voucher.clone()],
        };
        let (bottle, secret) = Bottle::seal(identity, &Self::salt(&metadata))?;
        self.keychain
            .save_bottle_secret(&self.container, &self.context, &secret)?;

        let request = JoinRequest {
            peer,
            voucher,
            bottle: Some(bottle),
        };
        let changes = self.rpc.join(&self.container, &request).await?;
        self.absorb(changes.peers);
        self.escrow.invalidate();

        let peer_id = identity.peer_id().clone();
        self.update_metadata(|m| {
            m.peer_id = Some(peer_id.clone());
            m.cdp_state = CdpState::Enabled;
            m.attempted_join = AttemptedJoinState::Attempted;
        })?;
        info!(container = %self.container, peer = %peer_id, "joined clique");
        Ok(peer_id)
    }

    pub(crate) async fn join_with_voucher(&self, voucher: Voucher) -> OctagonResult<PeerId> {
        let identity = self.require_identity()?;
        if !voucher.is_for(identity.permanent()) {
            return Err(OctagonError::InvalidRequest(
                "voucher is for a different identity; prepare first".into(),
            ));
        }
        let VoucherSponsor::Peer(sponsor) = voucher.sponsor.clone() else {
            return Err(OctagonError::InvalidRequest(
                "recovery key vouchers go through join_with_recovery_key".into(),
            ));
        };
        self.refresh_graph().await?;
        self.join(&identity, voucher, &[sponsor]).await
    }

    pub(crate) async fn join_with_bottle(
        &self,
        bottle_id: Uuid,
        secret: &BottleSecret,
    ) -> OctagonResult<PeerId> {
        let metadata = self.load_metadata()?;
        let bottles = self.rpc.fetch_viable_bottles(&self.container).await?;
        let bottle = bottles
            .into_iter()
            .map(|viable| viable.bottle)
            .find(|b| b.bottle_id == bottle_id)
            .ok_or_else(|| OctagonError::NotFound(format!("bottle {bottle_id}")))?;
        let restored = bottle.open(secret, &Self::salt(&metadata))?;
        info!(bottle = %bottle_id, restored = %restored.peer_id(), "opened bottle");

        self.refresh_graph().await?;
        let identity = LocalIdentity::generate(&self.config.device, self.next_epoch());
        self.keychain
            .save_identity(&self.container, &self.context, &identity)?;
        let voucher = Voucher::issue(
            identity.permanent(),
            VoucherSponsor::Peer(restored.peer_id().clone()),
            VoucherReason::Bottle,
            restored.signing_key(),
        )?;
        self.join(&identity, voucher, &[restored.peer_id().clone()])
            .await
    }

    pub(crate) async fn join_with_recovery_key(&self, code: &str) -> OctagonResult<PeerId> {
        let recovery_key = RecoveryKey::from_input(code)?;
        let metadata = self.load_metadata()?;
        let keys = recovery_key.derive_keys(&Self::salt(&metadata), &self.config.recovery_kdf)?;

        self.refresh_graph().await?;
        let endorsers = {
            let graph = self.graph();
            let policies = self.policies();
            graph.recovery_key_endorsers(&keys.signing_public_key(), &policies)
        };
        if endorsers.is_empty() {
            return Err(OctagonError::NotFound(
                "no trusted peer has registered this recovery key".into(),
            ));
        }

        let identity = LocalIdentity::generate(&self.config.device, self.next_epoch());
        self.keychain
            .save_identity(&self.container, &self.context, &identity)?;
        let voucher = Voucher::issue(
            identity.permanent(),
            keys.sponsor(),
            VoucherReason::RecoveryKey,
            &keys.signing,
        )?;
        self.join(&identity, voucher, &endorsers).await
    }

    /// Publishes a new version of our own info built by `edit`, retrying
    /// on conflicts against a fresh peer list.
    async fn publish_own(
        &self,
        op: &str,
        identity: &LocalIdentity,
        edit: impl Fn(&Peer, &LocalIdentity) -> OctagonResult<TrustUpdate>,
    ) -> OctagonResult<()> {
        let edit = &edit;
        self.rpc
            .with_retry(op, |_| async move {
                self.refresh_once().await?;
                let update = {
                    let graph = self.graph();
                    let own = graph
                        .peer(identity.peer_id())
                        .ok_or(OctagonError::NotTrusted)?;
                    edit(own, identity)?
                };
                let changes = self
                    .rpc
                    .service()
                    .update_trust(&self.container, update)
                    .await?;
                self.absorb(changes.peers);
                Ok(())
            })
            .await
    }

    pub(crate) async fn set_recovery_key(&self, code: &str) -> OctagonResult<()> {
        let recovery_key = RecoveryKey::from_input(code)?;
        let metadata = self.load_metadata()?;
        let keys = recovery_key.derive_keys(&Self::salt(&metadata), &self.config.recovery_kdf)?;
        let identity = self.require_identity()?;
        let signing = keys.signing_public_key();
        let encryption = keys.encryption_public_key();

        self.publish_own("set_recovery_key", &identity, |own, identity| {
            let mut stable = own.stable_info().cloned().ok_or(OctagonError::NotTrusted)?;
            stable.clock += 1;
            stable.recovery_signing_key = Some(signing.clone());
            stable.recovery_encryption_key = Some(encryption.clone());
            Ok(TrustUpdate {
                peer_id: identity.peer_id().clone(),
                stable: Some(identity.sign_stable(stable)?),
                dynamic: None,
            })
        })
        .await?;
        info!(peer = %identity.peer_id(), "registered recovery key");
        Ok(())
    }

    pub(crate) async fn leave_clique(&self) -> OctagonResult<()> {
        let identity = self.require_identity()?;
        self.publish_own("leave_clique", &identity, |own, identity| {
            let mut dynamic = own.dynamic_info().cloned().unwrap_or_default();
            dynamic.clock += 1;
            dynamic.included.remove(identity.peer_id());
            dynamic.excluded.insert(identity.peer_id().clone());
            Ok(TrustUpdate {
                peer_id: identity.peer_id().clone(),
                stable: None,
                dynamic: Some(identity.sign_dynamic(dynamic)?),
            })
        })
        .await?;
        self.escrow.invalidate();
        info!(peer = %identity.peer_id(), "left clique");
        Ok(())
    }

    pub(crate) async fn distrust_peers(&self, peers: &BTreeSet<PeerId>) -> OctagonResult<()> {
        let identity = self.require_identity()?;
        if peers.contains(identity.peer_id()) {
            return Err(OctagonError::InvalidRequest(
                "use leave_clique to distrust yourself".into(),
            ));
        }
        self.publish_own("distrust_peers", &identity, |own, identity| {
            let mut dynamic = own.dynamic_info().cloned().unwrap_or_default();
            dynamic.clock += 1;
            for peer in peers {
                dynamic.included.remove(peer);
                dynamic.excluded.insert(peer.clone());
            }
            Ok(TrustUpdate {
                peer_id: identity.peer_id().clone(),
                stable: None,
                dynamic: Some(identity.sign_dynamic(dynamic)?),
            })
        })
        .await?;
        self.escrow.invalidate();
        info!(count = peers.len(), "distrusted peers");
        Ok(())
    }

    /// Fetches the peer list and any policy documents it references that
    /// we do not have. Returns every version now known.
    pub(crate) async fn refetch_policy(&self) -> OctagonResult<Vec<u64>> {
        let changes = self.rpc.fetch_changes(&self.container).await?;
        self.absorb(changes.peers);
        let accepted = self
            .rpc
            .with_retry("fetch_policy_documents", |_| self.fetch_missing_policies())
            .await?;
        debug!(accepted, "policy refetch done");
        Ok(self.policies().versions().into_iter().map(|v| v.number).collect())
    }

    // ── Queries ──────────────────────────────────────────────────

    pub(crate) async fn trust_status(&self, state: &OctagonState) -> OctagonResult<TrustStatus> {
        let metadata = self.load_metadata()?;
        let mut status = TrustStatus {
            status: CliqueStatus::Absent,
            peer_id: metadata.peer_id.clone(),
            trusted_peer_count: 0,
            is_excluded: false,
            is_locked: self.lock.is_locked(),
            state: state.to_string(),
        };
        if metadata.icloud_account_state != IcloudAccountState::Available {
            return Ok(status);
        }
        if *state == OctagonState::WaitingForCloudKitAccount
            || self.account.account_status().await? != CloudKitAccountStatus::Available
        {
            status.status = CliqueStatus::NoCloudKitAccount;
            return Ok(status);
        }
        let Some(peer_id) = metadata.peer_id else {
            return Ok(status);
        };

        let graph = self.graph();
        let policies = self.policies();
        let computation = graph.compute_trust(&peer_id, &policies);
        status.is_excluded = graph.peers().any(|p| {
            p.id() != &peer_id && p.dynamic_info().is_some_and(|d| d.excluded.contains(&peer_id))
        }) || graph.peer(&peer_id).is_some_and(|p| p.is_self_excluded());
        if computation.is_trusted(&peer_id) {
            status.status = CliqueStatus::In;
            status.trusted_peer_count = computation.trusted.len().saturating_sub(1);
        } else {
            status.status = CliqueStatus::NotIn;
        }
        Ok(status)
    }

    pub(crate) fn dump(&self, state: &OctagonState) -> OctagonResult<TrustDump> {
        let metadata = self.load_metadata()?;
        let graph = self.graph();
        let policies = self.policies();
        let computation = metadata
            .peer_id
            .as_ref()
            .map(|id| graph.compute_trust(id, &policies))
            .unwrap_or_default();
        let self_peer = metadata
            .peer_id
            .as_ref()
            .and_then(|id| graph.peer(id))
            .cloned();
        Ok(TrustDump {
            container: self.container.to_string(),
            context: self.context.to_string(),
            state: state.to_string(),
            self_peer,
            peers: graph.peers().cloned().collect(),
            trusted: computation.trusted.into_iter().collect(),
            excluded: computation.excluded.into_iter().collect(),
            views: self.keysync.view_states(),
            ready_flags: self
                .flags
                .ready_flags()
                .iter()
                .map(ToString::to_string)
                .collect(),
            pending_flags: self
                .flags
                .pending_flags()
                .iter()
                .map(|p| format!("{} delay={:?} condition={:?}", p.flag, p.delay, p.condition))
                .collect(),
            policy_versions: policies.versions().into_iter().map(|v| v.number).collect(),
            metadata,
        })
    }

    pub(crate) async fn fetch_escrow_records(&self, force: bool) -> OctagonResult<Vec<EscrowRecord>> {
        if !force {
            if let Some(records) = self.escrow.get() {
                debug!(count = records.len(), "escrow records from cache");
                return Ok(records);
            }
        }
        let bottles = self.rpc.fetch_viable_bottles(&self.container).await?;
        let records: Vec<EscrowRecord> = bottles
            .into_iter()
            .map(|viable| EscrowRecord {
                bottle_id: viable.bottle.bottle_id,
                peer_id: viable.bottle.peer_id,
                device_name: viable.device_name,
                created_at: viable.bottle.created_at,
                viability: viable.viability,
            })
            .collect();
        self.escrow.put(records.clone());
        Ok(records)
    }

    pub(crate) fn local_bottle_secret(&self) -> OctagonResult<BottleSecret> {
        self.keychain
            .load_bottle_secret(&self.container, &self.context)?
            .ok_or_else(|| OctagonError::NotFound("bottle secret".into()))
    }
}
