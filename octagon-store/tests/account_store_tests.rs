use octagon_store::{AccountStore, StorageError};
use octagon_types::{
    AccountMetadata, AttemptedJoinState, CdpState, ContainerName, ContextId, IcloudAccountState,
    PeerId, TrustState,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn container() -> ContainerName {
    ContainerName::default()
}

fn context() -> ContextId {
    ContextId::default()
}

fn full_record(peer: &str) -> AccountMetadata {
    AccountMetadata {
        peer_id: Some(PeerId::from(peer)),
        icloud_account_state: IcloudAccountState::Available,
        trust_state: TrustState::Trusted,
        cdp_state: CdpState::Enabled,
        attempted_join: AttemptedJoinState::Attempted,
        alt_dsid: Some("1234".into()),
    }
}

// ── Save / load ─────────────────────────────────────────────────

#[test]
fn load_missing_is_not_found() {
    let store = AccountStore::open_in_memory().unwrap();
    let err = store.load(&container(), &context()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn save_then_load_returns_identical_record() {
    let store = AccountStore::open_in_memory().unwrap();
    let record = full_record("asdf");
    store.save(&container(), &context(), &record).unwrap();
    assert_eq!(store.load(&container(), &context()).unwrap(), record);
}

#[test]
fn second_save_overwrites_every_field() {
    let store = AccountStore::open_in_memory().unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();

    let replacement = AccountMetadata {
        peer_id: Some(PeerId::from("no wait another peer id")),
        icloud_account_state: IcloudAccountState::Available,
        ..AccountMetadata::default()
    };
    store.save(&container(), &context(), &replacement).unwrap();

    let loaded = store.load(&container(), &context()).unwrap();
    assert_eq!(loaded.peer_id, Some(PeerId::from("no wait another peer id")));
    assert_eq!(loaded.trust_state, TrustState::Unknown);
    assert_eq!(loaded.cdp_state, CdpState::Unknown);
    assert_eq!(loaded.alt_dsid, None);
}

#[test]
fn records_are_isolated_by_container_and_context() {
    let store = AccountStore::open_in_memory().unwrap();
    let other_container = ContainerName::new("com.example.other");
    let other_context = ContextId::new("secondDevice");

    store.save(&container(), &context(), &full_record("a")).unwrap();
    store.save(&other_container, &context(), &full_record("b")).unwrap();
    store.save(&container(), &other_context, &full_record("c")).unwrap();

    assert_eq!(
        store.load(&container(), &context()).unwrap().peer_id,
        Some(PeerId::from("a"))
    );
    assert_eq!(
        store.load(&other_container, &context()).unwrap().peer_id,
        Some(PeerId::from("b"))
    );
    assert_eq!(
        store.load(&container(), &other_context).unwrap().peer_id,
        Some(PeerId::from("c"))
    );
    assert!(store.load(&other_container, &other_context).is_err());
}

// ── Delete ──────────────────────────────────────────────────────

#[test]
fn delete_then_load_is_not_found() {
    let store = AccountStore::open_in_memory().unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();

    assert!(store.delete(&container(), &context()).unwrap());
    assert!(matches!(
        store.load(&container(), &context()),
        Err(StorageError::NotFound { .. })
    ));
}

#[test]
fn delete_missing_returns_false() {
    let store = AccountStore::open_in_memory().unwrap();
    assert!(!store.delete(&container(), &context()).unwrap());
}

#[test]
fn delete_leaves_other_contexts() {
    let store = AccountStore::open_in_memory().unwrap();
    let other = ContextId::new("other");
    store.save(&container(), &context(), &full_record("a")).unwrap();
    store.save(&container(), &other, &full_record("b")).unwrap();

    store.delete(&container(), &context()).unwrap();
    assert!(store.load(&container(), &other).is_ok());
}

// ── Corruption ──────────────────────────────────────────────────

#[test]
fn corrupted_record_loads_as_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");

    {
        let store = AccountStore::open(&path).unwrap();
        store.save(&container(), &context(), &full_record("asdf")).unwrap();
    }

    {
        let raw = rusqlite::Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE account_metadata SET data = 'definitely { not json' WHERE context = ?1",
            [context().as_str()],
        )
        .unwrap();
    }

    let store = AccountStore::open(&path).unwrap();
    let loaded = store.load(&container(), &context()).unwrap();
    assert_eq!(loaded.peer_id, None);
    assert_eq!(loaded.icloud_account_state, IcloudAccountState::Unknown);
    assert_eq!(loaded.trust_state, TrustState::Unknown);
    assert_eq!(loaded, AccountMetadata::default());
}

#[test]
fn unknown_enum_value_is_treated_as_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    let store = AccountStore::open(&path).unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "UPDATE account_metadata SET data = '{\"trust_state\":\"sideways\"}'",
        [],
    )
    .unwrap();

    assert_eq!(
        store.load(&container(), &context()).unwrap(),
        AccountMetadata::default()
    );
}

fn overwrite_data(path: &std::path::Path, sql_value: &str) {
    let raw = rusqlite::Connection::open(path).unwrap();
    raw.execute(
        &format!("UPDATE account_metadata SET data = {sql_value}"),
        [],
    )
    .unwrap();
}

#[test]
fn blob_record_loads_as_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    let store = AccountStore::open(&path).unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();

    overwrite_data(&path, "X'DEADBEEF00FF'");

    assert_eq!(
        store.load(&container(), &context()).unwrap(),
        AccountMetadata::default()
    );
}

#[test]
fn invalid_utf8_text_loads_as_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    let store = AccountStore::open(&path).unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();

    overwrite_data(&path, "CAST(X'FFFE7B' AS TEXT)");

    assert_eq!(
        store.load(&container(), &context()).unwrap(),
        AccountMetadata::default()
    );
}

#[test]
fn corrupted_record_is_replaced_by_next_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    let store = AccountStore::open(&path).unwrap();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();
    overwrite_data(&path, "X'00'");

    let mut metadata = store.load(&container(), &context()).unwrap();
    metadata.icloud_account_state = IcloudAccountState::Available;
    store.save(&container(), &context(), &metadata).unwrap();

    assert_eq!(store.load(&container(), &context()).unwrap(), metadata);
}

// ── Persistence ─────────────────────────────────────────────────

#[test]
fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("octagon.db");
    {
        let store = AccountStore::open(&path).unwrap();
        store.save(&container(), &context(), &full_record("asdf")).unwrap();
    }
    let store = AccountStore::open(&path).unwrap();
    assert_eq!(store.load(&container(), &context()).unwrap(), full_record("asdf"));
}

#[test]
fn list_contexts_is_sorted_and_scoped() {
    let store = AccountStore::open_in_memory().unwrap();
    store.save(&container(), &ContextId::new("zeta"), &full_record("z")).unwrap();
    store.save(&container(), &ContextId::new("alpha"), &full_record("a")).unwrap();
    store
        .save(&ContainerName::new("elsewhere"), &ContextId::new("beta"), &full_record("b"))
        .unwrap();

    let contexts = store.list_contexts(&container()).unwrap();
    assert_eq!(contexts, vec![ContextId::new("alpha"), ContextId::new("zeta")]);
}

// ── Secret items ────────────────────────────────────────────────

#[test]
fn secrets_roundtrip_and_replace() {
    let store = AccountStore::open_in_memory().unwrap();
    assert_eq!(store.load_secret(&container(), &context(), "identity").unwrap(), None);

    store.save_secret(&container(), &context(), "identity", b"one").unwrap();
    store.save_secret(&container(), &context(), "identity", b"two").unwrap();
    assert_eq!(
        store.load_secret(&container(), &context(), "identity").unwrap(),
        Some(b"two".to_vec())
    );
}

#[test]
fn delete_secrets_scoped_to_context() {
    let store = AccountStore::open_in_memory().unwrap();
    let other = ContextId::new("other");
    store.save_secret(&container(), &context(), "identity", b"a").unwrap();
    store.save_secret(&container(), &context(), "bottle", b"b").unwrap();
    store.save_secret(&container(), &other, "identity", b"c").unwrap();

    assert_eq!(store.delete_secrets(&container(), &context()).unwrap(), 2);
    assert_eq!(store.load_secret(&container(), &context(), "bottle").unwrap(), None);
    assert!(store.load_secret(&container(), &other, "identity").unwrap().is_some());
}

#[test]
fn clones_share_the_connection() {
    let store = AccountStore::open_in_memory().unwrap();
    let clone = store.clone();
    store.save(&container(), &context(), &full_record("asdf")).unwrap();
    assert!(clone.load(&container(), &context()).is_ok());
}
