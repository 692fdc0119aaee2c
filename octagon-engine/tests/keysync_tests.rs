//! Tests for per-view TLK creation, sharing and adoption.

use octagon_crypto::{generate_random_key, EncryptionKeyPair, PublicEncryptionKey};
use octagon_engine::{
    KeySyncCoordinator, KeyZone, SimulatedCloud, TrustedOperation, ViewKeyState, ZoneKeySet,
};
use octagon_types::{ContainerName, PeerId};
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

const VIEWS: [&str; 3] = ["Passwords", "WiFi", "Health"];

struct Member {
    id: PeerId,
    keys: EncryptionKeyPair,
    sync: KeySyncCoordinator,
}

impl Member {
    fn new(cloud: &Arc<SimulatedCloud>, name: &str) -> Self {
        Self {
            id: PeerId::from_signing_key(name.as_bytes()),
            keys: EncryptionKeyPair::generate(),
            sync: KeySyncCoordinator::new(ContainerName::default(), cloud.clone()),
        }
    }

    fn public(&self) -> PublicEncryptionKey {
        self.keys.public_key()
    }

    fn operation(&self, trusted: &[&Member]) -> TrustedOperation {
        TrustedOperation {
            self_peer: self.id.clone(),
            encryption: self.keys.clone(),
            trusted_peers: trusted_map(trusted),
            views: VIEWS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

fn trusted_map(members: &[&Member]) -> BTreeMap<PeerId, PublicEncryptionKey> {
    members.iter().map(|m| (m.id.clone(), m.public())).collect()
}

fn all(state: ViewKeyState) -> BTreeMap<String, ViewKeyState> {
    VIEWS.iter().map(|v| (v.to_string(), state)).collect()
}

async fn receivers(cloud: &SimulatedCloud, view: &str) -> BTreeSet<PeerId> {
    cloud
        .fetch_key_set(&ContainerName::default(), view)
        .await
        .unwrap()
        .map(|set| set.receivers())
        .unwrap_or_default()
}

#[tokio::test]
async fn first_peer_creates_every_tlk() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");

    alice.sync.begin_trusted_operation(alice.operation(&[])).await;

    assert_eq!(alice.sync.view_states(), all(ViewKeyState::Ready));
    assert_eq!(
        cloud.views(&ContainerName::default()),
        VIEWS.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>()
    );
    assert!(alice.sync.tlk_fingerprint("Passwords").await.is_some());
}

#[tokio::test]
async fn trusted_peer_adopts_shared_tlk() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    let bob = Member::new(&cloud, "bob");

    alice.sync.begin_trusted_operation(alice.operation(&[&bob])).await;
    bob.sync.begin_trusted_operation(bob.operation(&[&alice])).await;

    assert_eq!(bob.sync.view_states(), all(ViewKeyState::Ready));
    for view in VIEWS {
        assert_eq!(
            bob.sync.tlk_fingerprint(view).await,
            alice.sync.tlk_fingerprint(view).await
        );
    }
}

#[tokio::test]
async fn share_from_untrusted_sender_is_refused() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    let bob = Member::new(&cloud, "bob");

    // Alice shares with Bob, but Bob does not trust Alice.
    alice.sync.begin_trusted_operation(alice.operation(&[&bob])).await;
    bob.sync.begin_trusted_operation(bob.operation(&[])).await;

    assert_eq!(bob.sync.view_states(), all(ViewKeyState::WaitForTlk));
    assert_eq!(bob.sync.tlk_fingerprint("WiFi").await, None);
}

#[tokio::test]
async fn newcomer_gets_shares_on_trust_update() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    let bob = Member::new(&cloud, "bob");

    alice.sync.begin_trusted_operation(alice.operation(&[])).await;
    assert_eq!(receivers(&cloud, "WiFi").await, BTreeSet::from([alice.id.clone()]));

    alice.sync.update_trusted_peers(trusted_map(&[&bob])).await;
    assert_eq!(
        receivers(&cloud, "WiFi").await,
        BTreeSet::from([alice.id.clone(), bob.id.clone()])
    );
}

#[tokio::test]
async fn replaced_tlk_discards_cached_key() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    alice.sync.begin_trusted_operation(alice.operation(&[])).await;

    let stranger = PeerId::from_signing_key(b"mallory");
    cloud.force_key_set(
        &ContainerName::default(),
        "Passwords",
        ZoneKeySet {
            tlk_uuid: Uuid::new_v4(),
            fingerprint: generate_random_key().fingerprint(),
            created_by: stranger,
            shares: Vec::new(),
        },
    );
    alice.sync.handle_zone_change("Passwords").await;

    let states = alice.sync.view_states();
    assert_eq!(states["Passwords"], ViewKeyState::WaitForTlk);
    assert_eq!(states["WiFi"], ViewKeyState::Ready);
    assert_eq!(alice.sync.tlk_fingerprint("Passwords").await, None);
}

#[tokio::test]
async fn losing_trust_and_logging_out_drop_keys() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    alice.sync.begin_trusted_operation(alice.operation(&[])).await;

    alice.sync.end_trusted_operation().await;
    assert_eq!(alice.sync.view_states(), all(ViewKeyState::WaitForTrust));
    assert_eq!(alice.sync.tlk_fingerprint("Health").await, None);

    alice.sync.logout().await;
    assert_eq!(alice.sync.view_states(), all(ViewKeyState::LoggedOut));
}

#[tokio::test]
async fn rejoining_peer_recovers_its_own_tlk() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    alice.sync.begin_trusted_operation(alice.operation(&[])).await;
    let before = alice.sync.tlk_fingerprint("WiFi").await;

    alice.sync.end_trusted_operation().await;
    alice.sync.begin_trusted_operation(alice.operation(&[])).await;

    assert_eq!(alice.sync.view_states(), all(ViewKeyState::Ready));
    assert_eq!(alice.sync.tlk_fingerprint("WiFi").await, before);
}

#[tokio::test]
async fn reset_deletes_zones() {
    let cloud = Arc::new(SimulatedCloud::new());
    let alice = Member::new(&cloud, "alice");
    alice.sync.begin_trusted_operation(alice.operation(&[])).await;

    alice.sync.reset_zones().await.unwrap();
    assert!(cloud.views(&ContainerName::default()).is_empty());
}
