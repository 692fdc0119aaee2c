use octagon_types::{ContainerName, ContextId, PeerId, DEFAULT_CONTAINER, DEFAULT_CONTEXT};
use std::collections::HashSet;
use std::str::FromStr;

// ── PeerId ────────────────────────────────────────────────────────

#[test]
fn peer_id_from_signing_key_has_prefix() {
    let id = PeerId::from_signing_key(&[7u8; 32]);
    assert!(id.as_str().starts_with("SHA256:"));
    assert!(id.is_key_derived());
}

#[test]
fn peer_id_is_deterministic_per_key() {
    let a = PeerId::from_signing_key(&[1u8; 32]);
    let b = PeerId::from_signing_key(&[1u8; 32]);
    let c = PeerId::from_signing_key(&[2u8; 32]);
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn peer_id_display_parse_roundtrip() {
    let id = PeerId::from_signing_key(b"some public key bytes");
    let parsed: PeerId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn peer_id_parse_rejects_missing_prefix() {
    assert!(PeerId::from_str("asdf").is_err());
}

#[test]
fn peer_id_parse_rejects_short_digest() {
    assert!(PeerId::parse("SHA256:AAAA").is_err());
}

#[test]
fn peer_id_from_arbitrary_string_is_opaque() {
    let id = PeerId::from("no wait another peer id");
    assert_eq!(id.as_str(), "no wait another peer id");
    assert!(!id.is_key_derived());
}

#[test]
fn peer_id_serde_is_transparent() {
    let id = PeerId::from("asdf");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"asdf\"");
    let back: PeerId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn peer_id_hashable() {
    let mut set = HashSet::new();
    set.insert(PeerId::from_signing_key(&[1u8; 32]));
    set.insert(PeerId::from_signing_key(&[1u8; 32]));
    set.insert(PeerId::from_signing_key(&[3u8; 32]));
    assert_eq!(set.len(), 2);
}

// ── Scope names ───────────────────────────────────────────────────

#[test]
fn default_scope_names() {
    assert_eq!(ContainerName::default().as_str(), DEFAULT_CONTAINER);
    assert_eq!(ContextId::default().as_str(), DEFAULT_CONTEXT);
    assert_eq!(DEFAULT_CONTEXT, "defaultContext");
}

#[test]
fn scope_names_display() {
    let container = ContainerName::new("com.example.container");
    let context = ContextId::from("secondDevice");
    assert_eq!(container.to_string(), "com.example.container");
    assert_eq!(context.to_string(), "secondDevice");
}

// ── Properties ────────────────────────────────────────────────────

mod properties {
    use octagon_types::PeerId;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn every_signing_key_yields_a_parseable_id(key in proptest::collection::vec(any::<u8>(), 0..128)) {
            let id = PeerId::from_signing_key(&key);
            prop_assert!(id.is_key_derived());
            prop_assert_eq!(PeerId::parse(id.as_str()).unwrap(), id);
        }

        #[test]
        fn unprefixed_strings_never_parse(s in "[a-zA-Z0-9+/=]{0,64}") {
            prop_assert!(PeerId::parse(&s).is_err());
        }
    }
}
