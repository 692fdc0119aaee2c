//! End-to-end tests: devices sharing one simulated cloud.

mod common;

use common::{establish, eventually, init_tracing, join_via, trusted_count, Cloud, Device, WAIT};
use octagon_engine::{
    CliqueStatus, CloudKitAccountStatus, CloudNotification, Collaborators, Fault,
    InMemoryPeerListService, JoinRequest, Keychain, LockStateTracker, OctagonError,
    OctagonManager, OctagonState, PeerListService, ServiceOp, SimulatedAccount, StoreKeychain,
    ViewKeyState,
};
use octagon_store::AccountStore;
use octagon_trust::{
    LocalIdentity, Peer, PeerDynamicInfo, PolicyEngine, RecoveryKey, UserControllableViewStatus,
    Viability, Voucher, VoucherReason, VoucherSponsor,
};
use octagon_types::{
    AccountMetadata, CdpState, ContainerName, ContextId, IcloudAccountState, PeerId, TrustState,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn container() -> ContainerName {
    ContainerName::default()
}

fn peer_id(device: &Device) -> PeerId {
    device
        .context
        .dump()
        .unwrap()
        .metadata
        .peer_id
        .expect("device has a peer id")
}

/// Lets the machine and notification tasks drain.
async fn quiesce(device: &Device) {
    device.settle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    device.settle().await;
}

async fn eventually_trusts(device: &Device, count: usize) {
    eventually(&format!("{} trusts {count} peers", device.info.machine_id), || async {
        trusted_count(device).await.is_ok_and(|n| n == count)
    })
    .await;
}

// ── Establish ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn establish_reaches_ready_and_persists_identity() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;

    let metadata = alice.store.load(&container(), &ContextId::default()).unwrap();
    assert_eq!(metadata.icloud_account_state, IcloudAccountState::Available);
    assert_eq!(metadata.cdp_state, CdpState::Enabled);
    assert_eq!(metadata.trust_state, TrustState::Trusted);
    assert_eq!(metadata.peer_id, Some(peer_id(&alice)));
    assert_eq!(cloud.peer_count(), 1);

    let status = alice.context.fetch_trust_status(WAIT).await.unwrap();
    assert_eq!(status.status, CliqueStatus::In);
    assert_eq!(status.trusted_peer_count, 0);

    alice.context.wait_for_views_ready(WAIT).await.unwrap();
    assert!(!alice.context.view_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_returns_to_ready_without_requests() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let before = peer_id(&alice);

    let alice = alice.restart(&cloud);
    alice.wait_for(OctagonState::Ready).await;
    assert_eq!(peer_id(&alice), before);
    assert_eq!(cloud.peer_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn establish_retries_network_failure() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = Device::start(&cloud, "machine-a", "iPhone17,1");
    alice.sign_in(OctagonState::WaitForCDP).await;
    cloud.service.inject_fault(ServiceOp::Establish, Fault::Network);

    let started = Instant::now();
    alice.context.reset_and_establish(WAIT).await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(8),
        "establish took {elapsed:?}"
    );
    assert_eq!(cloud.service.call_count(ServiceOp::Establish), 2);
    alice.wait_for(OctagonState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn fatal_establish_failure_leaves_device_untrusted() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = Device::start(&cloud, "machine-a", "iPhone17,1");
    alice.sign_in(OctagonState::WaitForCDP).await;
    cloud
        .service
        .inject_fault(ServiceOp::Establish, Fault::Fatal("quota".into()));

    let result = alice.context.reset_and_establish(WAIT).await;
    assert!(matches!(result, Err(OctagonError::EstablishFailed(_))), "{result:?}");
    alice.wait_for(OctagonState::Untrusted).await;
    assert_eq!(cloud.service.call_count(ServiceOp::Establish), 1);
    assert_eq!(cloud.peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_establish_finishes_in_background() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = Device::start(&cloud, "machine-a", "iPhone17,1");
    alice.sign_in(OctagonState::WaitForCDP).await;
    cloud.service.inject_fault(ServiceOp::Establish, Fault::Network);

    let result = alice
        .context
        .reset_and_establish(Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(OctagonError::Timeout)));

    alice.wait_for(OctagonState::Ready).await;
    assert_eq!(cloud.peer_count(), 1);
}

// ── Account ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sign_out_while_untrusted_forgets_account() {
    init_tracing();
    let cloud = Cloud::new();
    let _alice = establish(&cloud, "machine-a").await;
    let bob = Device::start(&cloud, "machine-b", "iPhone17,1");
    bob.sign_in(OctagonState::Untrusted).await;
    let metadata = bob.store.load(&container(), &ContextId::default()).unwrap();
    assert_eq!(metadata.cdp_state, CdpState::Enabled);

    bob.context.sign_out();
    bob.wait_for(OctagonState::NoAccount).await;

    let metadata = bob.store.load(&container(), &ContextId::default()).unwrap();
    assert_eq!(metadata.icloud_account_state, IcloudAccountState::Absent);
    assert_eq!(metadata.cdp_state, CdpState::Unknown);
    assert_eq!(metadata.peer_id, None);
    let status = bob.context.fetch_trust_status(WAIT).await.unwrap();
    assert_eq!(status.status, CliqueStatus::Absent);
}

#[tokio::test(start_paused = true)]
async fn sign_out_while_ready_logs_views_out() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    alice.context.wait_for_views_ready(WAIT).await.unwrap();

    alice.context.sign_out();
    alice.wait_for(OctagonState::NoAccount).await;
    assert!(alice
        .context
        .view_states()
        .values()
        .all(|s| *s == ViewKeyState::LoggedOut));
    assert!(alice.context.local_bottle_secret().is_err());
}

#[tokio::test(start_paused = true)]
async fn cloudkit_account_loss_and_return() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    alice.context.wait_for_views_ready(WAIT).await.unwrap();

    alice.account.set_status(CloudKitAccountStatus::NoAccount);
    alice.wait_for(OctagonState::WaitingForCloudKitAccount).await;
    assert!(alice
        .context
        .view_states()
        .values()
        .all(|s| *s == ViewKeyState::WaitForTrust));
    let status = alice.context.fetch_trust_status(WAIT).await.unwrap();
    assert_eq!(status.status, CliqueStatus::NoCloudKitAccount);

    alice.account.set_status(CloudKitAccountStatus::Available);
    alice.wait_for(OctagonState::Ready).await;
    alice.context.wait_for_views_ready(WAIT).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sign_in_waits_for_two_factor_then_cdp() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = Device::start(&cloud, "machine-a", "iPhone17,1");
    alice.account.set_hsa2(false);
    alice.sign_in(OctagonState::WaitForHSA2).await;

    alice.account.set_hsa2(true);
    alice.wait_for(OctagonState::WaitForCDP).await;

    // No clique yet: enabling CDP leaves the device untrusted until it
    // establishes or joins.
    alice.context.enable_cdp();
    alice.wait_for(OctagonState::Untrusted).await;
    let metadata = alice.store.load(&container(), &ContextId::default()).unwrap();
    assert_eq!(metadata.cdp_state, CdpState::Enabled);
}

#[tokio::test(start_paused = true)]
async fn locked_device_waits_for_unlock_after_restart() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;

    alice.lock.set_locked(true);
    let alice = alice.restart(&cloud);
    alice.wait_for(OctagonState::WaitForUnlock).await;
    let status = alice.context.fetch_trust_status(WAIT).await.unwrap();
    assert!(status.is_locked);

    alice.context.notify_unlocked();
    alice.wait_for(OctagonState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn push_while_locked_waits_for_unlock_then_returns_to_ready() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    quiesce(&alice).await;

    alice.lock.set_locked(true);
    cloud
        .zones
        .notifier()
        .send(CloudNotification::PeerListChanged { container: container() })
        .unwrap();
    alice.wait_for(OctagonState::WaitForUnlock).await;
    assert!(alice.context.fetch_trust_status(WAIT).await.unwrap().is_locked);

    alice.context.notify_unlocked();
    alice.wait_for(OctagonState::Ready).await;
    assert_eq!(
        alice.store.load(&container(), &ContextId::default()).unwrap().trust_state,
        TrustState::Trusted
    );
}

#[tokio::test(start_paused = true)]
async fn corrupted_metadata_row_still_signs_in_and_establishes() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    let store = AccountStore::open(&path).unwrap();
    store
        .save(
            &container(),
            &ContextId::default(),
            &AccountMetadata::signed_in(Some(common::ALT_DSID.to_string())),
        )
        .unwrap();
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute("UPDATE account_metadata SET data = X'DEADBEEF00FF'", [])
        .unwrap();

    let cloud = Cloud::new();
    let alice = Device::start_with(
        &cloud,
        common::device_info("machine-a", "iPhone17,1"),
        store,
        LockStateTracker::unlocked(),
        Arc::new(SimulatedAccount::new()),
    );
    // The signed-in record is unreadable, so the account reads as unknown.
    alice.wait_for(OctagonState::NoAccount).await;

    alice.sign_in(OctagonState::WaitForCDP).await;
    alice.context.reset_and_establish(WAIT).await.unwrap();
    alice.wait_for(OctagonState::Ready).await;

    let metadata = alice.store.load(&container(), &ContextId::default()).unwrap();
    assert_eq!(metadata.trust_state, TrustState::Trusted);
    assert_eq!(metadata.peer_id, Some(peer_id(&alice)));
}

// ── Joining ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn voucher_join_gives_mutual_trust_and_shared_keys() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;

    eventually_trusts(&alice, 1).await;
    eventually_trusts(&bob, 1).await;
    assert_eq!(cloud.peer_count(), 2);

    alice.context.wait_for_views_ready(WAIT).await.unwrap();
    bob.context.wait_for_views_ready(WAIT).await.unwrap();
    for view in bob.context.view_states().keys() {
        assert_eq!(
            bob.context.tlk_fingerprint(view).await,
            alice.context.tlk_fingerprint(view).await,
            "view {view}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn vouching_requires_a_trusted_device() {
    init_tracing();
    let cloud = Cloud::new();
    let _alice = establish(&cloud, "machine-a").await;
    let bob = Device::start(&cloud, "machine-b", "iPhone17,1");
    bob.sign_in(OctagonState::Untrusted).await;
    let carol = Device::start(&cloud, "machine-c", "iPhone17,1");
    carol.sign_in(OctagonState::Untrusted).await;

    let prepared = carol.context.prepare_identity(WAIT).await.unwrap();
    let result = bob.context.vouch(prepared, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(OctagonError::Timeout)), "{result:?}");
}

#[tokio::test(start_paused = true)]
async fn join_with_bottle_restores_trust() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let secret = alice.context.local_bottle_secret().unwrap();
    let records = alice.context.fetch_escrow_records(true, WAIT).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].bottle_id, secret.bottle_id);
    assert_eq!(records[0].viability, Viability::Full);

    let bob = Device::start(&cloud, "machine-b", "iPhone17,1");
    bob.sign_in(OctagonState::Untrusted).await;
    bob.context
        .join_with_bottle(secret.bottle_id, secret, WAIT)
        .await
        .unwrap();
    bob.wait_for(OctagonState::Ready).await;

    eventually_trusts(&alice, 1).await;
    eventually_trusts(&bob, 1).await;
}

#[tokio::test(start_paused = true)]
async fn join_with_recovery_key() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let code = alice.context.create_recovery_key(WAIT).await.unwrap();

    let bob = Device::start(&cloud, "machine-b", "iPhone17,1");
    bob.sign_in(OctagonState::Untrusted).await;

    let wrong = RecoveryKey::generate();
    let result = bob.context.join_with_recovery_key(wrong.as_str(), WAIT).await;
    assert!(matches!(result, Err(OctagonError::NotFound(_))), "{result:?}");
    bob.wait_for(OctagonState::Untrusted).await;

    bob.context.join_with_recovery_key(&code, WAIT).await.unwrap();
    bob.wait_for(OctagonState::Ready).await;
    eventually_trusts(&alice, 1).await;
}

// ── Leaving and distrust ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn leave_clique_makes_bottle_partially_viable() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;
    eventually_trusts(&alice, 1).await;
    let bob_id = peer_id(&bob);

    bob.context.leave_clique(WAIT).await.unwrap();
    bob.wait_for(OctagonState::Untrusted).await;
    eventually_trusts(&alice, 0).await;

    let records = alice.context.fetch_escrow_records(true, WAIT).await.unwrap();
    let bob_record = records.iter().find(|r| r.peer_id == bob_id).unwrap();
    assert_eq!(bob_record.viability, Viability::Partial);
    let bob_status = bob.context.fetch_trust_status(WAIT).await.unwrap();
    assert_eq!(bob_status.status, CliqueStatus::NotIn);
    assert!(bob_status.is_excluded);
}

#[tokio::test(start_paused = true)]
async fn distrusted_peer_loses_trust() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;
    eventually_trusts(&alice, 1).await;

    let result = alice
        .context
        .distrust_peers(BTreeSet::from([peer_id(&alice)]), WAIT)
        .await;
    assert!(matches!(result, Err(OctagonError::InvalidRequest(_))));

    alice
        .context
        .distrust_peers(BTreeSet::from([peer_id(&bob)]), WAIT)
        .await
        .unwrap();
    eventually_trusts(&alice, 0).await;
    bob.wait_for(OctagonState::Untrusted).await;
    assert_eq!(alice.state(), OctagonState::Ready);
}

#[tokio::test(start_paused = true)]
async fn removed_machine_id_is_distrusted() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;
    eventually_trusts(&alice, 1).await;

    alice.account.set_machine_ids(["machine-a"]);
    eventually_trusts(&alice, 0).await;
    bob.wait_for(OctagonState::Untrusted).await;
    let dump = alice.context.dump().unwrap();
    assert!(dump.excluded.contains(&peer_id(&bob)));
}

// ── Policy ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn peer_on_unknown_policy_is_ignored_until_refetch() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    let alice_identity = StoreKeychain::new(alice.store.clone(), alice.lock.clone())
        .load_identity(&container(), &ContextId::default())
        .unwrap()
        .unwrap();

    // A newer policy that only the stranger knows about.
    let mut engine = PolicyEngine::with_builtin();
    let mut next = engine.prevailing().unwrap().clone();
    next.version.number += 1;
    let next = next.sealed();
    engine.accept(next.clone()).unwrap();

    let device = common::device_info("machine-x", "iPhone17,1");
    let stranger = LocalIdentity::generate(&device, 2);
    let prepared = stranger
        .prepare(&device, &engine, UserControllableViewStatus::Following)
        .unwrap();
    let voucher = Voucher::issue(
        stranger.permanent(),
        VoucherSponsor::Peer(alice_identity.peer_id().clone()),
        VoucherReason::SecureChannel,
        alice_identity.signing_key(),
    )
    .unwrap();
    let dynamic = PeerDynamicInfo {
        clock: 1,
        included: BTreeSet::from([stranger.peer_id().clone(), alice_identity.peer_id().clone()]),
        ..PeerDynamicInfo::default()
    };
    let peer = Peer {
        permanent: prepared.permanent,
        stable: Some(prepared.stable),
        dynamic: Some(stranger.sign_dynamic(dynamic).unwrap()),
        vouchers: vec![voucher.clone()],
    };
    cloud
        .service
        .join(
            &container(),
            JoinRequest {
                peer,
                voucher,
                bottle: None,
            },
        )
        .await
        .unwrap();

    // Alice asks for the document, gets nothing, and keeps ignoring the peer.
    eventually("alice looked for the policy", || async {
        cloud.service.call_count(ServiceOp::FetchPolicyDocuments) > 0
    })
    .await;
    alice.settle().await;
    assert_eq!(trusted_count(&alice).await.unwrap(), 0);

    cloud.service.publish_policy(next.clone());
    let versions = alice.context.refetch_policy(WAIT).await.unwrap();
    assert!(versions.contains(&next.version.number));
    alice.wait_for(OctagonState::Ready).await;
    eventually_trusts(&alice, 1).await;
}

// ── Escrow records ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn escrow_records_are_cached_until_invalidated() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    quiesce(&alice).await;
    let fetches = || cloud.service.call_count(ServiceOp::FetchViableBottles);

    let first = alice.context.fetch_escrow_records(false, WAIT).await.unwrap();
    let calls = fetches();
    let second = alice.context.fetch_escrow_records(false, WAIT).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fetches(), calls);

    alice.context.fetch_escrow_records(true, WAIT).await.unwrap();
    assert_eq!(fetches(), calls + 1);

    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    alice.context.fetch_escrow_records(false, WAIT).await.unwrap();
    assert_eq!(fetches(), calls + 2);

    // A peer-list push drops the cache.
    let _bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;
    eventually_trusts(&alice, 1).await;
    quiesce(&alice).await;
    let records = alice.context.fetch_escrow_records(false, WAIT).await.unwrap();
    assert_eq!(records.len(), 2);
}

// ── Retries ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn trust_update_survives_a_conflict() {
    init_tracing();
    let cloud = Cloud::new();
    let alice = establish(&cloud, "machine-a").await;
    quiesce(&alice).await;
    let before = cloud.service.call_count(ServiceOp::UpdateTrust);
    cloud.service.inject_fault(ServiceOp::UpdateTrust, Fault::Conflict);

    let bob = join_via(&cloud, &alice, "machine-b", "iPhone17,1").await;
    eventually("alice republished after the conflict", || async {
        cloud.service.call_count(ServiceOp::UpdateTrust) >= before + 2
    })
    .await;
    let bob_id = peer_id(&bob);
    eventually("alice includes bob", || async {
        cloud
            .service
            .peer(&container(), &peer_id(&alice))
            .and_then(|p| p.dynamic_info().map(|d| d.included.contains(&bob_id)))
            .unwrap_or(false)
    })
    .await;
    quiesce(&alice).await;
    assert_eq!(alice.state(), OctagonState::Ready);
}

// ── Manager ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn manager_contexts_are_independent() {
    init_tracing();
    let zones = Arc::new(octagon_engine::SimulatedCloud::new());
    let service = Arc::new(InMemoryPeerListService::new().with_notifier(zones.notifier()));
    let account = Arc::new(SimulatedAccount::new());
    let collaborators = Collaborators::new(
        AccountStore::open_in_memory().unwrap(),
        service,
        zones,
        account,
        LockStateTracker::unlocked(),
    );
    let manager = OctagonManager::new(
        collaborators,
        common::test_config(common::device_info("machine-a", "iPhone17,1")),
    );

    let primary = manager.default_context();
    let secondary = manager.context(&container(), &ContextId::new("secondary"));
    assert!(Arc::ptr_eq(&primary, &manager.default_context()));
    assert_eq!(manager.active_contexts().len(), 2);

    primary.sign_in(Some(common::ALT_DSID.to_string()));
    primary
        .wait_for_state(OctagonState::WaitForCDP, WAIT)
        .await
        .unwrap();
    secondary.wait_for_pause(WAIT).await.unwrap();
    assert_eq!(secondary.current_state(), OctagonState::NoAccount);

    manager.shutdown();
    assert!(manager.active_contexts().is_empty());
}
