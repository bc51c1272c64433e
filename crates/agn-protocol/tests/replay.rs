use agn_common::FixedTimeProvider;
use agn_identity::generate_keypair;
use agn_protocol::{EnvelopeError, EnvelopeSigner, EnvelopeVerifier, MessageKind};
use std::sync::Arc;

const MAX_AGE_MS: u64 = 300_000;

/// Sign a heartbeat at T; verify -> Valid; verify again 30s later ->
/// Replay; wait past the freshness window -> Expired, not Valid.
#[test]
fn heartbeat_replay_then_expiry() {
    let time = Arc::new(FixedTimeProvider::from_seconds(1_700_000_000));
    let (sk, _) = generate_keypair();
    let signer = EnvelopeSigner::new(sk, time.clone());
    let verifier = EnvelopeVerifier::new(MAX_AGE_MS, time.clone());

    let env = signer.sign(MessageKind::Heartbeat, b"heartbeat".to_vec());
    assert_eq!(verifier.verify(&env), Ok(signer.node_id()));

    time.advance_seconds(30);
    assert_eq!(verifier.verify(&env), Err(EnvelopeError::Replay));

    time.advance_seconds(600);
    verifier.sweep();
    assert!(matches!(
        verifier.verify(&env),
        Err(EnvelopeError::Expired { .. })
    ));
}

/// Replay rejection holds for every envelope kind.
#[test]
fn replay_rejected_for_all_kinds() {
    let time = Arc::new(FixedTimeProvider::from_seconds(1_700_000_000));
    let (sk, _) = generate_keypair();
    let signer = EnvelopeSigner::new(sk, time.clone());
    let verifier = EnvelopeVerifier::new(MAX_AGE_MS, time.clone());

    for kind in [
        MessageKind::TaskReward,
        MessageKind::RewardPropagation,
        MessageKind::Accusation,
        MessageKind::AccusationAnalysis,
        MessageKind::Proposal,
        MessageKind::Vote,
        MessageKind::Heartbeat,
    ] {
        let env = signer.sign(kind, format!("payload-{kind}").into_bytes());
        assert!(verifier.verify(&env).is_ok(), "{kind} first pass");
        assert_eq!(verifier.verify(&env), Err(EnvelopeError::Replay), "{kind}");
    }
}

/// A wire round trip through JSON must not invalidate the signature.
#[test]
fn json_round_trip_still_verifies() {
    let time = Arc::new(FixedTimeProvider::from_seconds(1_700_000_000));
    let (sk, _) = generate_keypair();
    let signer = EnvelopeSigner::new(sk, time.clone());
    let verifier = EnvelopeVerifier::new(MAX_AGE_MS, time.clone());

    let env = signer.sign(MessageKind::Accusation, br#"{"accused":"x"}"#.to_vec());
    let json = serde_json::to_string(&env).unwrap();
    let parsed: agn_protocol::SignedEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(verifier.verify(&parsed), Ok(signer.node_id()));
}
