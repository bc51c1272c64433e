use agn_common::{FixedTimeProvider, NodeId, StaticNeighborProvider};
use agn_governance::{NodeStatus, ProposalKind, StaticStakeProvider, VoteChoice, VotingConfig};
use agn_identity::generate_keypair;
use agn_incentive::RewardSource;
use agn_runtime::{FabricConfig, FabricError, FabricManager, HandleOutcome};
use std::sync::Arc;

const EPS: f64 = 1e-3;

struct Network {
    neighbors: Arc<StaticNeighborProvider>,
    stake: Arc<StaticStakeProvider>,
    time: Arc<FixedTimeProvider>,
}

impl Network {
    fn new() -> Self {
        Self {
            neighbors: Arc::new(StaticNeighborProvider::new()),
            stake: Arc::new(StaticStakeProvider::new()),
            time: Arc::new(FixedTimeProvider::from_seconds(1_700_000_000)),
        }
    }

    fn spawn(&self, config: FabricConfig) -> FabricManager {
        let (sk, _) = generate_keypair();
        FabricManager::new(
            sk,
            config,
            self.neighbors.clone(),
            self.stake.clone(),
            self.time.clone(),
        )
        .unwrap()
    }
}

fn open_voting() -> FabricConfig {
    FabricConfig {
        voting: VotingConfig {
            buffer_period_secs: 0,
            quorum_threshold: 0.9,
            ..VotingConfig::default()
        },
        ..FabricConfig::default()
    }
}

#[test]
fn reward_flows_across_the_wire() {
    let net = Network::new();
    let alpha = net.spawn(FabricConfig::default());
    let beta = net.spawn(FabricConfig::default());
    net.neighbors
        .set_neighbors(alpha.node_id(), vec![beta.node_id()]);

    let reward = alpha
        .award_task(
            "task-1",
            "compute",
            12.5,
            RewardSource::TaskCompletion,
            "wire test",
        )
        .unwrap();
    assert!(alpha.reputation_of(&alpha.node_id()) > 10.0);

    let outgoing = alpha.propagate_reward(&reward.reward_id).unwrap();
    assert_eq!(outgoing.len(), 1);
    let (target, envelope) = &outgoing[0];
    assert_eq!(*target, beta.node_id());

    let before = beta.reputation_of(&beta.node_id());
    match beta.handle_envelope(envelope).unwrap() {
        HandleOutcome::RewardCredited(report) => {
            assert!((report.credited.propagated_score - 8.75).abs() < EPS);
            assert_eq!(report.credited.depth, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(beta.reputation_of(&beta.node_id()) > before);

    // Replaying the same envelope is rejected by the signed-message layer.
    assert!(matches!(
        beta.handle_envelope(envelope),
        Err(FabricError::Envelope(_))
    ));
}

#[test]
fn accusation_flows_verify_and_penalize() {
    let net = Network::new();
    let alpha = net.spawn(FabricConfig::default());
    let beta = net.spawn(FabricConfig::default());
    let culprit = NodeId::from_public_key_bytes(b"culprit");
    net.neighbors
        .set_neighbors(alpha.node_id(), vec![beta.node_id()]);

    // Alpha needs standing to accuse; beta's local view of the culprit has
    // something to lose.
    alpha
        .reputation_store()
        .set_score(alpha.node_id(), 500.0);
    beta.reputation_store().set_score(culprit, 600.0);

    let accusation = alpha
        .accuse(&culprit, "fraud", "forged audit receipt", vec!["blob-1".into()])
        .unwrap();
    let outgoing = alpha.propagate_accusation(&accusation.accusation_id).unwrap();
    assert_eq!(outgoing.len(), 1);

    let (_, envelope) = &outgoing[0];
    match beta.handle_envelope(envelope).unwrap() {
        HandleOutcome::AccusationStored(id) => assert_eq!(id, accusation.accusation_id),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let before = beta.reputation_of(&culprit);
    let analysis = beta
        .analyze_accusation(&accusation.accusation_id, true, "evidence holds")
        .unwrap();
    assert!(analysis.accepted);
    assert!(beta.reputation_of(&culprit) < before);

    // Beta's verdict can be audited by alpha.
    let audit = beta.broadcast_analysis(&analysis).unwrap();
    match alpha.handle_envelope(&audit).unwrap() {
        HandleOutcome::AnalysisRecorded(id) => assert_eq!(id, accusation.accusation_id),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn governance_flows_across_the_wire() {
    let net = Network::new();
    let alpha = net.spawn(open_voting());
    let beta = net.spawn(open_voting());
    let target = NodeId::from_public_key_bytes(b"target");

    for manager in [&alpha, &beta] {
        manager.reputation_store().set_score(alpha.node_id(), 300.0);
        manager.reputation_store().set_score(beta.node_id(), 300.0);
        manager.register_node(alpha.node_id());
        manager.register_node(beta.node_id());
        manager.reputation_store().set_score(target, 0.0);
        manager.register_node(target);
    }

    let proposal = alpha
        .submit_proposal(ProposalKind::Kick, &target, "spamming the mesh")
        .unwrap();

    // Beta learns about the proposal from the wire.
    let announcement = alpha.announce_proposal(&proposal.id).unwrap();
    match beta.handle_envelope(&announcement).unwrap() {
        HandleOutcome::ProposalStored(id) => assert_eq!(id, proposal.id),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Both nodes vote on their own replicas; alpha's ballot also reaches
    // beta over the wire.
    let alpha_vote = alpha.vote(&proposal.id, VoteChoice::Yes, "").unwrap();
    beta.vote(&proposal.id, VoteChoice::Yes, "").unwrap();
    let ballot = alpha.broadcast_vote(&alpha_vote).unwrap();
    match beta.handle_envelope(&ballot).unwrap() {
        HandleOutcome::VoteRecorded(_) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    let finalized = beta.voting().proposal(&proposal.id).unwrap();
    assert_eq!(
        finalized.status,
        agn_governance::ProposalStatus::Passed
    );
    assert_eq!(
        beta.voting().node(&target).unwrap().status,
        NodeStatus::Removed
    );
}

#[test]
fn heartbeats_touch_activity() {
    let net = Network::new();
    let alpha = net.spawn(FabricConfig::default());
    let beta = net.spawn(FabricConfig::default());

    let hb = alpha.heartbeat();
    match beta.handle_envelope(&hb).unwrap() {
        HandleOutcome::Heartbeat(sender) => assert_eq!(sender, alpha.node_id()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn start_stop_saves_every_engine() {
    let dir = tempfile::tempdir().unwrap();
    let net = Network::new();
    let config = FabricConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..FabricConfig::default()
    };
    let manager = net.spawn(config);

    manager
        .award_task("task-1", "compute", 10.0, RewardSource::AuditPass, "")
        .unwrap();
    manager.start();
    manager.stop().await;

    assert!(dir.path().join("incentive.json").exists());
    assert!(dir.path().join("accusation.json").exists());
    assert!(dir.path().join("governance.json").exists());

    // A second manager on the same data dir restores the reward and still
    // refuses the duplicate task id.
    let restored = {
        let (sk, _) = generate_keypair();
        FabricManager::new(
            sk,
            FabricConfig {
                data_dir: Some(dir.path().to_path_buf()),
                ..FabricConfig::default()
            },
            net.neighbors.clone(),
            net.stake.clone(),
            net.time.clone(),
        )
        .unwrap()
    };
    assert!(restored.incentive().reward_for_task("task-1").is_some());
}

#[test]
fn stats_reflect_local_standing() {
    let net = Network::new();
    let manager = net.spawn(FabricConfig::default());
    let stats = manager.stats();
    assert_eq!(stats.node_id, manager.node_id());
    assert!((stats.score - 10.0).abs() < EPS);
    assert_eq!(stats.pending_proposals, 0);
    assert_eq!(stats.replay_cache_entries, 0);
}
