use octagon_crypto::KdfParams;
use octagon_trust::{
    Bottle, BottleSecret, DeviceInfo, LocalIdentity, RecoveryKey, TrustError, Voucher,
    VoucherReason, VoucherSponsor,
};

fn identity() -> LocalIdentity {
    LocalIdentity::generate(&DeviceInfo::default(), 1)
}

// ── Bottles ──────────────────────────────────────────────────────

#[test]
fn bottle_restores_identity() {
    let original = identity();
    let (bottle, secret) = Bottle::seal(&original, "alt-dsid").unwrap();
    assert_eq!(bottle.peer_id, *original.peer_id());

    let restored = bottle.open(&secret, "alt-dsid").unwrap();
    assert_eq!(restored.peer_id(), original.peer_id());
    assert_eq!(restored.permanent(), original.permanent());
    assert_eq!(
        restored.signing_key().public_key().to_bytes(),
        original.signing_key().public_key().to_bytes()
    );
}

#[test]
fn bottle_with_wrong_salt_fails() {
    let (bottle, secret) = Bottle::seal(&identity(), "alt-dsid").unwrap();
    assert!(bottle.open(&secret, "other-account").is_err());
}

#[test]
fn bottle_secret_must_match_bottle() {
    let (bottle, _) = Bottle::seal(&identity(), "alt-dsid").unwrap();
    let (_, other_secret) = Bottle::seal(&identity(), "alt-dsid").unwrap();
    let err = bottle.open(&other_secret, "alt-dsid").unwrap_err();
    assert!(matches!(err, TrustError::BottleMismatch(_)));
}

#[test]
fn bottle_signature_covers_contents() {
    let original = identity();
    let (mut bottle, _) = Bottle::seal(&original, "alt-dsid").unwrap();
    let key = original.signing_key().public_key();
    bottle.verify(&key).unwrap();

    bottle.created_at += chrono::Duration::seconds(1);
    assert!(matches!(
        bottle.verify(&key).unwrap_err(),
        TrustError::InvalidSignature { what: "bottle", .. }
    ));
}

#[test]
fn bottle_secret_debug_is_redacted() {
    let (_, secret) = Bottle::seal(&identity(), "alt-dsid").unwrap();
    let rendered = format!("{secret:?}");
    assert!(!rendered.contains(&secret.entropy));
    let json = serde_json::to_string(&secret).unwrap();
    let back: BottleSecret = serde_json::from_str(&json).unwrap();
    assert_eq!(back.bottle_id, secret.bottle_id);
}

#[test]
fn identity_secret_bytes_round_trip() {
    let original = identity();
    let bytes = original.to_secret_bytes().unwrap();
    let restored = LocalIdentity::from_secret_bytes(&bytes).unwrap();
    assert_eq!(restored.permanent(), original.permanent());
}

// ── Recovery keys ────────────────────────────────────────────────

#[test]
fn generated_key_has_seven_groups() {
    let key = RecoveryKey::generate();
    let groups: Vec<&str> = key.as_str().split('-').collect();
    assert_eq!(groups.len(), 7);
    assert!(groups.iter().all(|g| g.len() == 4));
    assert_eq!(RecoveryKey::from_input(key.as_str()).unwrap(), key);
}

#[test]
fn input_is_normalized() {
    let key = RecoveryKey::from_input(" abcd efgh_jkmn-pqrs tvwx yz23 4567 ").unwrap();
    assert_eq!(key.as_str(), "ABCD-EFGH-JKMN-PQRS-TVWX-YZ23-4567");
}

#[test]
fn malformed_input_is_rejected() {
    for input in [
        "ABCD-EFGH-JKMN-PQRS-TVWX-YZ23",
        "ABCD-EFGH-JKMN-PQRS-TVWX-YZ23-456",
        "ABCD-EFGH-JKMN-PQRS-TVWX-YZ23-4561",
        "ABCD-EFGH-JKMN-PQRS-TVWX-YZ23-45O7",
    ] {
        assert!(
            matches!(RecoveryKey::from_input(input), Err(TrustError::InvalidRecoveryKey(_))),
            "{input}"
        );
    }
}

#[test]
fn derivation_is_deterministic_per_salt() {
    let key = RecoveryKey::generate();
    let params = KdfParams::minimal();
    let a = key.derive_keys("alt-dsid", &params).unwrap();
    let b = key.derive_keys("alt-dsid", &params).unwrap();
    let other = key.derive_keys("other", &params).unwrap();

    assert_eq!(a.signing_public_key(), b.signing_public_key());
    assert_eq!(a.encryption_public_key(), b.encryption_public_key());
    assert_ne!(a.signing_public_key(), other.signing_public_key());
    assert_eq!(
        a.sponsor(),
        VoucherSponsor::RecoveryKey(a.signing_public_key())
    );
}

#[test]
fn recovery_voucher_verifies_with_derived_key() {
    let keys = RecoveryKey::generate()
        .derive_keys("alt-dsid", &KdfParams::minimal())
        .unwrap();
    let candidate = identity();
    let voucher = Voucher::issue(
        candidate.permanent(),
        keys.sponsor(),
        VoucherReason::RecoveryKey,
        &keys.signing,
    )
    .unwrap();

    assert!(voucher.is_for(candidate.permanent()));
    voucher.verify(&keys.signing.public_key()).unwrap();
    assert!(voucher.verify(&candidate.signing_key().public_key()).is_err());
}
