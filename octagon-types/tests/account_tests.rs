use octagon_types::{
    AccountMetadata, AttemptedJoinState, CdpState, IcloudAccountState, PeerId, TrustState,
};
use pretty_assertions::assert_eq;

#[test]
fn default_metadata_is_all_unknown() {
    let m = AccountMetadata::default();
    assert_eq!(m.peer_id, None);
    assert_eq!(m.icloud_account_state, IcloudAccountState::Unknown);
    assert_eq!(m.trust_state, TrustState::Unknown);
    assert_eq!(m.cdp_state, CdpState::Unknown);
    assert_eq!(m.attempted_join, AttemptedJoinState::Unknown);
    assert!(!m.is_trusted());
}

#[test]
fn signed_in_metadata() {
    let m = AccountMetadata::signed_in(Some("1234".into()));
    assert_eq!(m.icloud_account_state, IcloudAccountState::Available);
    assert_eq!(m.alt_dsid.as_deref(), Some("1234"));
    assert_eq!(m.trust_state, TrustState::Unknown);
}

#[test]
fn is_trusted_requires_peer_id() {
    let mut m = AccountMetadata::signed_in(None);
    m.trust_state = TrustState::Trusted;
    assert!(!m.is_trusted());
    m.peer_id = Some(PeerId::from("asdf"));
    assert!(m.is_trusted());
}

#[test]
fn json_uses_snake_case_states() {
    let mut m = AccountMetadata::signed_in(None);
    m.cdp_state = CdpState::Enabled;
    m.attempted_join = AttemptedJoinState::NotAttempted;
    let json = m.to_json().unwrap();
    assert!(json.contains("\"available\""));
    assert!(json.contains("\"enabled\""));
    assert!(json.contains("\"not_attempted\""));
    assert_eq!(AccountMetadata::from_json(&json).unwrap(), m);
}

#[test]
fn missing_fields_default() {
    let m = AccountMetadata::from_json("{\"peer_id\":\"asdf\"}").unwrap();
    assert_eq!(m.peer_id, Some(PeerId::from("asdf")));
    assert_eq!(m.cdp_state, CdpState::Unknown);
}

#[test]
fn garbage_is_an_error() {
    assert!(AccountMetadata::from_json("not json").is_err());
}
