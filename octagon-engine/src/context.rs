//! The per-(container, context) API.
//!
//! A [`TrustContext`] owns one state machine and the task that turns cloud
//! notifications into flags. Every call that waits takes a budget and
//! returns [`OctagonError::Timeout`] when it runs out; work already queued
//! carries on in the background.

use crate::cloud::{CloudKitAccountStatus, CloudNotification};
use crate::config::OctagonConfig;
use crate::error::{OctagonError, OctagonResult};
use crate::flags::OctagonFlag;
use crate::keysync::ViewKeyState;
use crate::lock::LockStateTracker;
use crate::machine::{FlagHandler, StateMachine, TransitionOp};
use crate::status::{TrustDump, TrustStatus};
use crate::transitions::{
    OctagonState, OctagonTransitions, ESTABLISH_SOURCES, JOIN_SOURCES, REFETCH_SOURCES,
    TRUSTED_SOURCES,
};
use crate::trust_core::{Collaborators, TrustCore};
use octagon_trust::{BottleSecret, EscrowRecord, PreparedPeer, RecoveryKey, Voucher};
use octagon_types::{ContainerName, ContextId, PeerId};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One account's trust state on this device.
pub struct TrustContext {
    core: Arc<TrustCore>,
    machine: StateMachine<OctagonTransitions>,
    notifier: JoinHandle<()>,
}

impl TrustContext {
    /// Starts the context's state machine in `Initializing`. Must be called
    /// within a tokio runtime.
    pub fn start(
        container: ContainerName,
        context: ContextId,
        collaborators: Collaborators,
        config: OctagonConfig,
    ) -> Self {
        let account_events = collaborators.account.subscribe();
        let cloud_events = collaborators.zone.subscribe();
        let lock = collaborators.lock.clone();
        let flags = FlagHandler::new();
        let core = Arc::new(TrustCore::new(
            container,
            context,
            config,
            collaborators,
            flags.clone(),
        ));
        let label = format!("{}/{}", core.container, core.context);
        let machine = StateMachine::start(
            label,
            OctagonTransitions::new(Arc::clone(&core)),
            OctagonState::Initializing,
            flags,
            lock,
        );
        let notifier = tokio::spawn(forward_notifications(
            Arc::clone(&core),
            account_events,
            cloud_events,
        ));
        info!(container = %core.container, context = %core.context, "trust context started");
        Self {
            core,
            machine,
            notifier,
        }
    }

    pub fn container(&self) -> &ContainerName {
        &self.core.container
    }

    pub fn context(&self) -> &ContextId {
        &self.core.context
    }

    pub fn current_state(&self) -> OctagonState {
        self.machine.current_state()
    }

    // ── Account ──────────────────────────────────────────────────

    /// Signs the account in. `alt_dsid` salts bottles and recovery keys.
    pub fn sign_in(&self, alt_dsid: Option<String>) {
        self.core.set_pending_sign_in(alt_dsid);
        self.machine.flags().handle_flag(OctagonFlag::AccountAvailable);
    }

    /// Signs out, forgetting the local identity and all trust state.
    pub fn sign_out(&self) {
        self.machine.flags().handle_flag(OctagonFlag::AccountUnavailable);
    }

    pub fn enable_cdp(&self) {
        self.machine.flags().handle_flag(OctagonFlag::CdpEnabled);
    }

    /// Marks the device unlocked, releasing work gated on it.
    pub fn notify_unlocked(&self) {
        self.core.lock.set_locked(false);
    }

    pub fn lock_state(&self) -> LockStateTracker {
        self.core.lock.clone()
    }

    // ── Clique membership ────────────────────────────────────────

    /// Wipes the container's clique and zones and starts a new clique with
    /// this device as its only member.
    pub async fn reset_and_establish(&self, timeout: Duration) -> OctagonResult<PeerId> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("reset_and_establish", ESTABLISH_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request(
                    "reset_and_establish",
                    OctagonState::Untrusted,
                    reply,
                    async move { core.reset_and_establish().await },
                )
                .entering(OctagonState::ResetAndEstablish)
            })
            .await
    }

    /// Creates a fresh identity for a trusted peer to vouch for.
    pub async fn prepare_identity(&self, timeout: Duration) -> OctagonResult<PreparedPeer> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("prepare_identity", JOIN_SOURCES, timeout, move |current, reply| {
                let stay = *current;
                TransitionOp::for_request("prepare_identity", stay, reply, async move {
                    Ok((stay, core.prepare_identity()?))
                })
            })
            .await
    }

    /// Vouches for a prepared candidate. Only a trusted peer can vouch.
    pub async fn vouch(&self, candidate: PreparedPeer, timeout: Duration) -> OctagonResult<Voucher> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("vouch", TRUSTED_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request("vouch", OctagonState::Ready, reply, async move {
                    Ok((OctagonState::Ready, core.vouch(&candidate).await?))
                })
            })
            .await
    }

    /// Joins using a voucher issued for the identity from
    /// [`prepare_identity`](Self::prepare_identity).
    pub async fn join_with_voucher(&self, voucher: Voucher, timeout: Duration) -> OctagonResult<PeerId> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("join_with_voucher", JOIN_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request(
                    "join_with_voucher",
                    OctagonState::Untrusted,
                    reply,
                    async move {
                        let peer = core.join_with_voucher(voucher).await?;
                        Ok((OctagonState::CheckTrustState, peer))
                    },
                )
                .entering(OctagonState::JoinWithVoucher)
            })
            .await
    }

    /// Restores a departed peer's bottle and joins as a new peer it sponsors.
    pub async fn join_with_bottle(
        &self,
        bottle_id: Uuid,
        secret: BottleSecret,
        timeout: Duration,
    ) -> OctagonResult<PeerId> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("join_with_bottle", JOIN_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request(
                    "join_with_bottle",
                    OctagonState::Untrusted,
                    reply,
                    async move {
                        let peer = core.join_with_bottle(bottle_id, &secret).await?;
                        Ok((OctagonState::CheckTrustState, peer))
                    },
                )
                .entering(OctagonState::JoinWithBottle)
            })
            .await
    }

    pub async fn join_with_recovery_key(&self, code: &str, timeout: Duration) -> OctagonResult<PeerId> {
        let core = Arc::clone(&self.core);
        let code = code.to_string();
        self.machine
            .request("join_with_recovery_key", JOIN_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request(
                    "join_with_recovery_key",
                    OctagonState::Untrusted,
                    reply,
                    async move {
                        let peer = core.join_with_recovery_key(&code).await?;
                        Ok((OctagonState::CheckTrustState, peer))
                    },
                )
                .entering(OctagonState::JoinWithRecoveryKey)
            })
            .await
    }

    /// Registers `code` as this account's recovery key.
    pub async fn set_recovery_key(&self, code: &str, timeout: Duration) -> OctagonResult<()> {
        let core = Arc::clone(&self.core);
        let code = code.to_string();
        self.machine
            .request("set_recovery_key", TRUSTED_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request("set_recovery_key", OctagonState::Ready, reply, async move {
                    core.set_recovery_key(&code).await?;
                    Ok((OctagonState::Ready, ()))
                })
                .entering(OctagonState::SetRecoveryKey)
            })
            .await
    }

    /// Generates a recovery key, registers it, and returns its code.
    pub async fn create_recovery_key(&self, timeout: Duration) -> OctagonResult<String> {
        let key = RecoveryKey::generate();
        self.set_recovery_key(key.as_str(), timeout).await?;
        Ok(key.as_str().to_string())
    }

    /// Excludes this peer from the clique.
    pub async fn leave_clique(&self, timeout: Duration) -> OctagonResult<()> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("leave_clique", TRUSTED_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request("leave_clique", OctagonState::Ready, reply, async move {
                    core.leave_clique().await?;
                    Ok((OctagonState::BecomeUntrusted, ()))
                })
                .entering(OctagonState::LeaveClique)
            })
            .await
    }

    pub async fn distrust_peers(&self, peers: BTreeSet<PeerId>, timeout: Duration) -> OctagonResult<()> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("distrust_peers", TRUSTED_SOURCES, timeout, move |_, reply| {
                TransitionOp::for_request("distrust_peers", OctagonState::Ready, reply, async move {
                    core.distrust_peers(&peers).await?;
                    core.flags.handle_flag(OctagonFlag::CheckTrustState);
                    Ok((OctagonState::Ready, ()))
                })
            })
            .await
    }

    /// Fetches policy documents peers reference that this device lacks,
    /// then re-checks trust. Returns every known policy version.
    pub async fn refetch_policy(&self, timeout: Duration) -> OctagonResult<Vec<u64>> {
        let core = Arc::clone(&self.core);
        self.machine
            .request("refetch_policy", REFETCH_SOURCES, timeout, move |current, reply| {
                TransitionOp::for_request("refetch_policy", *current, reply, async move {
                    Ok((OctagonState::CheckTrustState, core.refetch_policy().await?))
                })
                .entering(OctagonState::RefetchPolicy)
            })
            .await
    }

    // ── Queries ──────────────────────────────────────────────────

    pub async fn fetch_trust_status(&self, timeout: Duration) -> OctagonResult<TrustStatus> {
        let state = self.current_state();
        with_timeout(timeout, self.core.trust_status(&state)).await
    }

    /// Bottles that could restore this account, cached for a while unless
    /// `force` is set.
    pub async fn fetch_escrow_records(
        &self,
        force: bool,
        timeout: Duration,
    ) -> OctagonResult<Vec<EscrowRecord>> {
        with_timeout(timeout, self.core.fetch_escrow_records(force)).await
    }

    pub fn dump(&self) -> OctagonResult<TrustDump> {
        self.core.dump(&self.current_state())
    }

    /// The entropy for this device's own bottle.
    pub fn local_bottle_secret(&self) -> OctagonResult<BottleSecret> {
        self.core.local_bottle_secret()
    }

    pub fn view_states(&self) -> BTreeMap<String, ViewKeyState> {
        self.core.keysync.view_states()
    }

    pub async fn tlk_fingerprint(&self, view: &str) -> Option<String> {
        self.core.keysync.tlk_fingerprint(view).await
    }

    // ── Waiting ──────────────────────────────────────────────────

    pub async fn wait_for_state(&self, state: OctagonState, timeout: Duration) -> OctagonResult<()> {
        self.machine.wait_for_state(state, timeout).await
    }

    pub async fn wait_for_ready(&self, timeout: Duration) -> OctagonResult<()> {
        self.wait_for_state(OctagonState::Ready, timeout).await
    }

    /// Waits until the machine has nothing left to do.
    pub async fn wait_for_pause(&self, timeout: Duration) -> OctagonResult<()> {
        self.machine.wait_for_pause(timeout).await
    }

    pub async fn wait_for_views_ready(&self, timeout: Duration) -> OctagonResult<()> {
        self.core.keysync.wait_for_views_ready(timeout).await
    }

    /// How many times the named transition has run.
    pub fn op_count(&self, name: &str) -> u64 {
        self.machine.op_count(name)
    }

    /// Stops the state machine after its current op, and the notification
    /// task with it.
    pub fn shutdown(&self) {
        self.machine.shutdown();
        self.notifier.abort();
        debug!(container = %self.core.container, context = %self.core.context, "trust context stopped");
    }
}

impl Drop for TrustContext {
    fn drop(&mut self) {
        self.notifier.abort();
    }
}

impl std::fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustContext")
            .field("container", &self.core.container)
            .field("context", &self.core.context)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    work: impl Future<Output = OctagonResult<T>>,
) -> OctagonResult<T> {
    tokio::time::timeout(timeout, work)
        .await
        .unwrap_or(Err(OctagonError::Timeout))
}

// ── Notifications ────────────────────────────────────────────────

async fn forward_notifications(
    core: Arc<TrustCore>,
    mut account: broadcast::Receiver<CloudNotification>,
    mut cloud: broadcast::Receiver<CloudNotification>,
) {
    loop {
        let received = tokio::select! {
            received = account.recv() => received,
            received = cloud.recv() => received,
        };
        match received {
            Ok(notification) => handle_notification(&core, notification).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(container = %core.container, missed, "missed cloud notifications, refetching");
                core.flags.handle_flag(OctagonFlag::ReceivedPush);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(container = %core.container, context = %core.context, "notification task stopped");
}

async fn handle_notification(core: &TrustCore, notification: CloudNotification) {
    match notification {
        CloudNotification::AccountStatusChanged(CloudKitAccountStatus::Available) => {
            core.flags.handle_flag(OctagonFlag::CloudKitAccountAvailable);
        }
        CloudNotification::AccountStatusChanged(CloudKitAccountStatus::NoAccount) => {
            core.flags.handle_flag(OctagonFlag::CloudKitAccountAbsent);
        }
        CloudNotification::AccountStatusChanged(CloudKitAccountStatus::CouldNotDetermine) => {
            debug!("CloudKit account status unknown, ignoring");
        }
        CloudNotification::IdmsTrustLevelChanged => {
            core.flags.handle_flag(OctagonFlag::IdmsTrustLevelChanged);
        }
        CloudNotification::MachineIdListChanged => {
            core.flags.handle_flag(OctagonFlag::MachineIdListChanged);
        }
        CloudNotification::PeerListChanged { container } if container == core.container => {
            core.escrow.invalidate();
            core.flags.handle_flag(OctagonFlag::ReceivedPush);
        }
        CloudNotification::ZoneChanged { container, view } if container == core.container => {
            core.keysync.handle_zone_change(&view).await;
        }
        CloudNotification::PeerListChanged { .. } | CloudNotification::ZoneChanged { .. } => {}
    }
}
