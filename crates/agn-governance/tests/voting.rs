use agn_common::{FixedTimeProvider, NodeId, Signable};
use agn_governance::{
    NodeStatus, ProposalKind, ProposalStatus, StaticStakeProvider, Vote, VoteChoice, VotingConfig,
    VotingEngine, VotingError,
};
use agn_identity::{generate_keypair, sign_bytes, SignatureBytes, SigningKey};
use agn_reputation::InMemoryReputationStore;
use std::sync::Arc;

const EPS: f64 = 1e-3;

struct Fixture {
    engine: Arc<VotingEngine>,
    reputation: Arc<InMemoryReputationStore>,
    stake: Arc<StaticStakeProvider>,
    time: Arc<FixedTimeProvider>,
}

fn fixture(config: VotingConfig) -> Fixture {
    let (sk, _) = generate_keypair();
    let reputation = Arc::new(InMemoryReputationStore::new());
    let stake = Arc::new(StaticStakeProvider::new());
    let time = Arc::new(FixedTimeProvider::from_seconds(1_000_000));
    let engine = Arc::new(VotingEngine::new(
        config,
        sk,
        reputation.clone(),
        stake.clone(),
        time.clone(),
    ));
    Fixture {
        engine,
        reputation,
        stake,
        time,
    }
}

/// Registers the four standard scenario nodes {50/30, 60/40, 70/50, 80/60}
/// plus a zero-weight target, and returns (voters, target).
fn scenario_nodes(f: &Fixture) -> (Vec<NodeId>, NodeId) {
    let specs = [(50.0, 30.0), (60.0, 40.0), (70.0, 50.0), (80.0, 60.0)];
    let mut voters = Vec::new();
    for (i, (rep, stake)) in specs.iter().enumerate() {
        let node = NodeId::from_public_key_bytes(format!("node-{i}").as_bytes());
        f.reputation.set_score(node, *rep);
        f.stake.set_stake(node, *stake);
        f.engine.register_node(node);
        voters.push(node);
    }
    let target = NodeId::from_public_key_bytes(b"target");
    f.reputation.set_score(target, 0.0);
    f.engine.register_node(target);
    (voters, target)
}

/// Four nodes, weights 44/54/64/74; three Yes (44 + 54 + 74 = 172) against
/// one No (64) gives yes_ratio ~ 0.729 >= 0.6 with full quorum: Passed, and
/// the kicked target's status becomes Removed.
#[test]
fn kick_proposal_passes_with_weighted_majority() {
    // Quorum above 162/236 so the tally includes all four ballots.
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.9,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "protocol abuse")
        .unwrap();

    f.engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[1], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[2], &proposal.id, VoteChoice::No, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[3], &proposal.id, VoteChoice::Yes, "")
        .unwrap();

    let finalized = f.engine.proposal(&proposal.id).unwrap();
    assert_eq!(finalized.status, ProposalStatus::Passed);
    let result = finalized.result.unwrap();
    assert!((result.yes_weight - 172.0).abs() < EPS);
    assert!((result.total_weight - 236.0).abs() < EPS);
    assert!((result.yes_ratio - 172.0 / 236.0).abs() < EPS);
    assert_eq!(f.engine.node(&target).unwrap().status, NodeStatus::Removed);
}

/// One Yes (44) against two No (54 + 64): yes_ratio ~ 0.27 < 0.6 once
/// quorum is reached, so the proposal is Rejected and the target stays
/// Active.
#[test]
fn kick_proposal_rejected_on_low_yes_ratio() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.5,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "disputed")
        .unwrap();

    f.engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[1], &proposal.id, VoteChoice::No, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[2], &proposal.id, VoteChoice::No, "")
        .unwrap();

    let finalized = f.engine.proposal(&proposal.id).unwrap();
    assert_eq!(finalized.status, ProposalStatus::Rejected);
    let result = finalized.result.unwrap();
    assert!((result.yes_ratio - 44.0 / 162.0).abs() < EPS);
    assert_eq!(f.engine.node(&target).unwrap().status, NodeStatus::Active);
}

/// A proposal is never finalized Passed below the quorum gate.
#[test]
fn quorum_gate_holds_until_enough_weight_votes() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.5,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();

    // 44 of 236 voted: quorum ~ 0.186, stays Pending despite 100% yes.
    f.engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    assert_eq!(
        f.engine.proposal(&proposal.id).unwrap().status,
        ProposalStatus::Pending
    );

    // 98 of 236: still short.
    f.engine
        .cast_vote(&voters[1], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    assert_eq!(
        f.engine.proposal(&proposal.id).unwrap().status,
        ProposalStatus::Pending
    );

    // 172 of 236 crosses 0.5: finalizes Passed.
    f.engine
        .cast_vote(&voters[3], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    assert_eq!(
        f.engine.proposal(&proposal.id).unwrap().status,
        ProposalStatus::Passed
    );
}

#[test]
fn buffer_period_defeats_rapid_flood() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 600,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();
    let early = f
        .engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "");
    assert!(matches!(early, Err(VotingError::BufferPeriod { .. })));

    f.time.advance_seconds(600);
    assert!(f
        .engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .is_ok());
}

#[test]
fn duplicate_votes_and_proposals_refused() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.9,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();
    assert!(matches!(
        f.engine
            .create_proposal(&voters[1], ProposalKind::Kick, &target, ""),
        Err(VotingError::DuplicateProposal(ProposalKind::Kick))
    ));
    // A different kind against the same target is allowed.
    assert!(f
        .engine
        .create_proposal(&voters[1], ProposalKind::Demote, &target, "")
        .is_ok());

    f.engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    assert!(matches!(
        f.engine
            .cast_vote(&voters[0], &proposal.id, VoteChoice::No, ""),
        Err(VotingError::AlreadyVoted(_))
    ));
}

#[test]
fn restore_reactivates_a_removed_node() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.9,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let kick = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();
    for (voter, choice) in voters.iter().zip([
        VoteChoice::Yes,
        VoteChoice::Yes,
        VoteChoice::Yes,
        VoteChoice::Yes,
    ]) {
        f.engine.cast_vote(voter, &kick.id, choice, "").unwrap();
    }
    assert_eq!(f.engine.node(&target).unwrap().status, NodeStatus::Removed);

    let restore = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Restore, &target, "appeal")
        .unwrap();
    for voter in &voters {
        f.engine
            .cast_vote(voter, &restore.id, VoteChoice::Yes, "")
            .unwrap();
    }
    assert_eq!(f.engine.node(&target).unwrap().status, NodeStatus::Active);
}

fn foreign_vote(
    sk: &SigningKey,
    voter: NodeId,
    proposal_id: &str,
    choice: VoteChoice,
    ts: u64,
) -> Vote {
    let mut vote = Vote {
        id: uuid_like(voter, proposal_id),
        proposal_id: proposal_id.to_string(),
        voter,
        voter_public_key: sk.verifying_key().as_bytes().to_vec(),
        choice,
        weight: 0.0,
        ts,
        reason: String::new(),
        signature: SignatureBytes(Vec::new()),
    };
    vote.signature = sign_bytes(sk, &vote.to_signable_bytes().unwrap());
    vote
}

fn uuid_like(voter: NodeId, proposal_id: &str) -> String {
    format!("{voter}-{proposal_id}")
}

#[test]
fn remote_votes_verify_and_use_local_weights() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        quorum_threshold: 0.9,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    // A remote voter with its own keypair, registered locally.
    let (remote_sk, remote_vk) = generate_keypair();
    let remote = agn_identity::node_id_from_verifying_key(&remote_vk);
    f.reputation.set_score(remote, 100.0);
    f.stake.set_stake(remote, 10.0);
    f.engine.register_node(remote);

    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();

    let vote = foreign_vote(
        &remote_sk,
        remote,
        &proposal.id,
        VoteChoice::Yes,
        1_000_000,
    );
    let stored = f.engine.receive_vote(vote.clone()).unwrap();
    // Weight comes from the local registry, not the wire.
    assert!((stored.weight - (0.7 * 100.0 + 0.3 * 10.0)).abs() < EPS);

    // Replayed ballot is a duplicate.
    assert!(matches!(
        f.engine.receive_vote(vote.clone()),
        Err(VotingError::AlreadyVoted(_))
    ));

    // A tampered ballot fails signature verification.
    let mut tampered = foreign_vote(
        &remote_sk,
        remote,
        &proposal.id,
        VoteChoice::Yes,
        1_000_001,
    );
    tampered.choice = VoteChoice::No;
    assert!(matches!(
        f.engine.receive_vote(tampered),
        Err(VotingError::InvalidSignature(_))
    ));
}

#[test]
fn expiry_sweep_expires_quorumless_proposals() {
    let f = fixture(VotingConfig {
        buffer_period_secs: 0,
        proposal_duration_secs: 3600,
        ..VotingConfig::default()
    });
    let (voters, target) = scenario_nodes(&f);

    let starved = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "")
        .unwrap();
    f.engine
        .cast_vote(&voters[0], &starved.id, VoteChoice::Yes, "")
        .unwrap();

    f.time.advance_seconds(3601);
    assert_eq!(f.engine.run_expiry_sweep(), 1);
    assert_eq!(
        f.engine.proposal(&starved.id).unwrap().status,
        ProposalStatus::Expired
    );

    // Long-dead proposals are eventually garbage collected.
    f.time.advance_seconds(8 * 24 * 3600);
    assert_eq!(f.engine.run_cleanup(), 1);
    assert!(f.engine.proposal(&starved.id).is_none());
}

#[test]
fn snapshot_round_trip_preserves_registry_and_proposals() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("governance.json");
    let (sk, _) = generate_keypair();
    let reputation = Arc::new(InMemoryReputationStore::new());
    let stake = Arc::new(StaticStakeProvider::new());
    let time = Arc::new(FixedTimeProvider::from_seconds(1_000_000));

    let f = Fixture {
        engine: Arc::new(
            VotingEngine::new(
                VotingConfig {
                    buffer_period_secs: 0,
                    quorum_threshold: 0.9,
                    ..VotingConfig::default()
                },
                sk.clone(),
                reputation.clone(),
                stake.clone(),
                time.clone(),
            )
            .with_snapshot_path(path.clone())
            .unwrap(),
        ),
        reputation: reputation.clone(),
        stake: stake.clone(),
        time: time.clone(),
    };
    let (voters, target) = scenario_nodes(&f);
    let proposal = f
        .engine
        .create_proposal(&voters[0], ProposalKind::Kick, &target, "persist me")
        .unwrap();
    f.engine
        .cast_vote(&voters[0], &proposal.id, VoteChoice::Yes, "")
        .unwrap();
    f.engine.save().unwrap();

    let restored = VotingEngine::new(
        VotingConfig::default(),
        sk,
        reputation,
        stake,
        time,
    )
    .with_snapshot_path(path)
    .unwrap();

    let loaded = restored.proposal(&proposal.id).unwrap();
    assert_eq!(loaded.status, ProposalStatus::Pending);
    assert_eq!(loaded.votes.len(), 1);
    assert_eq!(loaded.reason, "persist me");
    assert_eq!(restored.node(&target).unwrap().status, NodeStatus::Active);
    assert_eq!(restored.pending_proposals().len(), 1);
}
