#![doc = include_str!("../README.md")]

//! # AGN Runtime Crate
//! The manager facade of the reputation fabric. It owns the node identity,
//! composes the reputation kernel, the incentive, accusation, and voting
//! engines, and the signed-envelope layer, and runs their background sweeps
//! under a single shutdown signal.

use agn_accusation::{Accusation, AccusationAnalysis, AccusationConfig, AccusationEngine};
use agn_common::{CommonError, NeighborProvider, NodeId, TimeProvider};
use agn_governance::{
    Proposal, ProposalKind, StakeProvider, Vote, VoteChoice, VotingConfig, VotingEngine,
};
use agn_identity::SigningKey;
use agn_incentive::{
    IncentiveConfig, IncentiveEngine, ReceiveReport, RewardPropagationMsg, RewardSource,
    TaskReward,
};
use agn_protocol::{EnvelopeSigner, EnvelopeVerifier, MessageKind, SignedEnvelope};
use agn_reputation::{InMemoryReputationStore, ReputationStore, Tier};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Aggregated configuration for one fabric node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Directory holding one `<engine>.json` snapshot per engine. `None`
    /// disables persistence.
    pub data_dir: Option<PathBuf>,
    /// Freshness window of the envelope verifier, in milliseconds.
    pub max_age_ms: u64,
    /// Refuse legacy nonce-less envelopes.
    pub strict_envelopes: bool,
    /// Cadence of the replay-cache compaction sweep.
    pub replay_sweep_interval_secs: u64,
    pub incentive: IncentiveConfig,
    pub accusation: AccusationConfig,
    pub voting: VotingConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_age_ms: 300_000,
            strict_envelopes: false,
            replay_sweep_interval_secs: 60,
            incentive: IncentiveConfig::default(),
            accusation: AccusationConfig::default(),
            voting: VotingConfig::default(),
        }
    }
}

/// Errors surfaced by the facade; engine refusals pass through unchanged.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Incentive(#[from] agn_incentive::IncentiveError),
    #[error(transparent)]
    Accusation(#[from] agn_accusation::AccusationError),
    #[error(transparent)]
    Voting(#[from] agn_governance::VotingError),
    #[error("envelope rejected: {0}")]
    Envelope(#[from] agn_protocol::EnvelopeError),
    #[error("unsupported envelope kind {0}")]
    UnsupportedKind(MessageKind),
    #[error("envelope sender {sender} does not match payload author {author}")]
    AuthorMismatch { sender: NodeId, author: NodeId },
    #[error(transparent)]
    Common(#[from] CommonError),
}

/// What handling a verified envelope did.
#[derive(Debug)]
pub enum HandleOutcome {
    RewardCredited(ReceiveReport),
    AccusationStored(String),
    AnalysisRecorded(String),
    VoteRecorded(String),
    ProposalStored(String),
    Heartbeat(NodeId),
}

/// Point-in-time counters for operator surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct FabricStats {
    pub node_id: NodeId,
    pub score: f64,
    pub tier: Tier,
    pub pending_proposals: usize,
    pub replay_cache_entries: usize,
}

/// Single entry point composing the engines under one identity.
pub struct FabricManager {
    node_id: NodeId,
    signer: EnvelopeSigner,
    verifier: Arc<EnvelopeVerifier>,
    reputation: Arc<InMemoryReputationStore>,
    incentive: Arc<IncentiveEngine>,
    accusation: Arc<AccusationEngine>,
    voting: Arc<VotingEngine>,
    time: Arc<dyn TimeProvider>,
    config: FabricConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl FabricManager {
    pub fn new(
        signing_key: SigningKey,
        config: FabricConfig,
        neighbors: Arc<dyn NeighborProvider>,
        stake: Arc<dyn StakeProvider>,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, CommonError> {
        let node_id =
            agn_identity::node_id_from_verifying_key(&signing_key.verifying_key());
        let reputation = Arc::new(InMemoryReputationStore::new());
        let reputation_dyn: Arc<dyn ReputationStore> = reputation.clone();

        let mut incentive = IncentiveEngine::new(
            config.incentive.clone(),
            node_id,
            reputation_dyn.clone(),
            neighbors.clone(),
            time.clone(),
        );
        let mut accusation = AccusationEngine::new(
            config.accusation.clone(),
            signing_key.clone(),
            reputation_dyn.clone(),
            neighbors,
            time.clone(),
        );
        let mut voting = VotingEngine::new(
            config.voting.clone(),
            signing_key.clone(),
            reputation_dyn,
            stake,
            time.clone(),
        );
        if let Some(dir) = &config.data_dir {
            incentive = incentive.with_snapshot_path(dir.join("incentive.json"))?;
            accusation = accusation.with_snapshot_path(dir.join("accusation.json"))?;
            voting = voting.with_snapshot_path(dir.join("governance.json"))?;
        }

        let mut verifier = EnvelopeVerifier::new(config.max_age_ms, time.clone());
        if config.strict_envelopes {
            verifier = verifier.strict();
        }

        Ok(Self {
            node_id,
            signer: EnvelopeSigner::new(signing_key, time.clone()),
            verifier: Arc::new(verifier),
            reputation,
            incentive: Arc::new(incentive),
            accusation: Arc::new(accusation),
            voting: Arc::new(voting),
            time,
            config,
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn reputation_of(&self, node: &NodeId) -> f64 {
        self.reputation.get_score(node)
    }

    pub fn tier_of(&self, node: &NodeId) -> Tier {
        self.reputation.tier(node)
    }

    /// The shared score registry; engines hold the same instance.
    pub fn reputation_store(&self) -> Arc<InMemoryReputationStore> {
        self.reputation.clone()
    }

    pub fn incentive(&self) -> &Arc<IncentiveEngine> {
        &self.incentive
    }

    pub fn accusation(&self) -> &Arc<AccusationEngine> {
        &self.accusation
    }

    pub fn voting(&self) -> &Arc<VotingEngine> {
        &self.voting
    }

    pub fn verifier(&self) -> &Arc<EnvelopeVerifier> {
        &self.verifier
    }

    /// Registers a peer in the voting registry and the score registry.
    pub fn register_node(&self, node: NodeId) {
        self.reputation.touch(&node, self.time.unix_seconds());
        self.voting.register_node(node);
    }

    /// Awards a local task completion.
    pub fn award_task(
        &self,
        task_id: &str,
        task_type: &str,
        base_score: f64,
        source: RewardSource,
        description: &str,
    ) -> Result<TaskReward, FabricError> {
        Ok(self.incentive.award(
            &self.node_id,
            task_id,
            task_type,
            base_score,
            source,
            description,
        )?)
    }

    /// Propagates a confirmed reward and returns one signed envelope per
    /// accepted hop, addressed to the hop's target, ready for transport.
    pub fn propagate_reward(
        &self,
        reward_id: &str,
    ) -> Result<Vec<(NodeId, SignedEnvelope)>, FabricError> {
        let records = self.incentive.propagate(reward_id)?;
        let mut outgoing = Vec::with_capacity(records.len());
        for record in records {
            let msg = RewardPropagationMsg {
                reward_id: record.origin_reward_id.clone(),
                origin: record.source,
                score: record.original_score,
                depth: record.depth,
            };
            let envelope = self
                .signer
                .sign_payload(MessageKind::RewardPropagation, &msg)?;
            outgoing.push((record.target, envelope));
        }
        Ok(outgoing)
    }

    /// Issues an accusation against a peer.
    pub fn accuse(
        &self,
        accused: &NodeId,
        kind: &str,
        reason: &str,
        evidence: Vec<String>,
    ) -> Result<Accusation, FabricError> {
        Ok(self.accusation.accuse(accused, kind, reason, evidence)?)
    }

    /// Plans accusation fan-out and wraps the accusation for each target.
    pub fn propagate_accusation(
        &self,
        accusation_id: &str,
    ) -> Result<Vec<(NodeId, SignedEnvelope)>, FabricError> {
        let targets = self.accusation.propagate(accusation_id)?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let accusation = self
            .accusation
            .accusation(accusation_id)
            .ok_or_else(|| {
                agn_accusation::AccusationError::UnknownAccusation(accusation_id.to_string())
            })?;
        let mut outgoing = Vec::with_capacity(targets.len());
        for target in targets {
            let envelope = self
                .signer
                .sign_payload(MessageKind::Accusation, &accusation)?;
            outgoing.push((target, envelope));
        }
        Ok(outgoing)
    }

    /// Runs the local verdict policy output through the accusation engine.
    pub fn analyze_accusation(
        &self,
        accusation_id: &str,
        accepted: bool,
        reason: &str,
    ) -> Result<AccusationAnalysis, FabricError> {
        Ok(self.accusation.analyze(accusation_id, accepted, reason)?)
    }

    /// Submits a governance proposal under the local identity.
    pub fn submit_proposal(
        &self,
        kind: ProposalKind,
        target: &NodeId,
        reason: &str,
    ) -> Result<Proposal, FabricError> {
        Ok(self
            .voting
            .create_proposal(&self.node_id, kind, target, reason)?)
    }

    /// Casts the local node's ballot.
    pub fn vote(
        &self,
        proposal_id: &str,
        choice: VoteChoice,
        reason: &str,
    ) -> Result<Vote, FabricError> {
        Ok(self
            .voting
            .cast_vote(&self.node_id, proposal_id, choice, reason)?)
    }

    /// Wraps a local proposal for announcement to peers.
    pub fn announce_proposal(&self, proposal_id: &str) -> Result<SignedEnvelope, FabricError> {
        let proposal = self
            .voting
            .proposal(proposal_id)
            .ok_or_else(|| agn_governance::VotingError::UnknownProposal(proposal_id.into()))?;
        Ok(self.signer.sign_payload(MessageKind::Proposal, &proposal)?)
    }

    /// Wraps a locally recorded ballot for broadcast.
    pub fn broadcast_vote(&self, vote: &Vote) -> Result<SignedEnvelope, FabricError> {
        Ok(self.signer.sign_payload(MessageKind::Vote, vote)?)
    }

    /// Wraps a local analysis so downstream nodes can audit the verdict.
    pub fn broadcast_analysis(
        &self,
        analysis: &AccusationAnalysis,
    ) -> Result<SignedEnvelope, FabricError> {
        Ok(self
            .signer
            .sign_payload(MessageKind::AccusationAnalysis, analysis)?)
    }

    /// Produces a liveness heartbeat envelope.
    pub fn heartbeat(&self) -> SignedEnvelope {
        self.signer.sign(MessageKind::Heartbeat, Vec::new())
    }

    /// Verifies a peer envelope and dispatches its payload to the owning
    /// engine. Rejections affect only this envelope and are returned, never
    /// propagated further.
    pub fn handle_envelope(
        &self,
        envelope: &SignedEnvelope,
    ) -> Result<HandleOutcome, FabricError> {
        let sender = self.verifier.verify(envelope)?;
        self.reputation.touch(&sender, self.time.unix_seconds());

        match envelope.kind {
            MessageKind::RewardPropagation => {
                let msg: RewardPropagationMsg = envelope.decode_payload()?;
                let report = self.incentive.receive_propagation(&sender, &msg)?;
                Ok(HandleOutcome::RewardCredited(report))
            }
            MessageKind::Accusation => {
                let accusation: Accusation = envelope.decode_payload()?;
                let stored = self.accusation.receive(accusation)?;
                Ok(HandleOutcome::AccusationStored(stored.accusation_id))
            }
            MessageKind::AccusationAnalysis => {
                let analysis: AccusationAnalysis = envelope.decode_payload()?;
                if analysis.analyzer != sender {
                    return Err(FabricError::AuthorMismatch {
                        sender,
                        author: analysis.analyzer,
                    });
                }
                let id = analysis.accusation_id.clone();
                self.accusation.record_analysis(analysis)?;
                Ok(HandleOutcome::AnalysisRecorded(id))
            }
            MessageKind::Vote => {
                let vote: Vote = envelope.decode_payload()?;
                if vote.voter != sender {
                    return Err(FabricError::AuthorMismatch {
                        sender,
                        author: vote.voter,
                    });
                }
                let stored = self.voting.receive_vote(vote)?;
                Ok(HandleOutcome::VoteRecorded(stored.id))
            }
            MessageKind::Proposal => {
                let proposal: Proposal = envelope.decode_payload()?;
                if proposal.proposer != sender {
                    return Err(FabricError::AuthorMismatch {
                        sender,
                        author: proposal.proposer,
                    });
                }
                let stored = self.voting.receive_proposal(proposal)?;
                Ok(HandleOutcome::ProposalStored(stored.id))
            }
            MessageKind::Heartbeat => Ok(HandleOutcome::Heartbeat(sender)),
            MessageKind::TaskReward => Err(FabricError::UnsupportedKind(envelope.kind)),
        }
    }

    pub fn stats(&self) -> FabricStats {
        FabricStats {
            node_id: self.node_id,
            score: self.reputation.get_score(&self.node_id),
            tier: self.reputation.tier(&self.node_id),
            pending_proposals: self.voting.pending_proposals().len(),
            replay_cache_entries: self.verifier.cache_len(),
        }
    }

    /// Spawns every engine's background sweeps plus the replay-cache
    /// compaction, all stopping on one shutdown signal.
    pub fn start(&self) {
        let mut shutdown_slot = self.shutdown.lock().expect("shutdown slot lock poisoned");
        if shutdown_slot.is_some() {
            log::warn!("fabric manager already started");
            return;
        }
        let (tx, rx) = watch::channel(false);
        let mut handles = Vec::new();
        handles.extend(self.incentive.spawn_background_tasks(rx.clone()));
        handles.extend(self.accusation.spawn_background_tasks(rx.clone()));
        handles.extend(self.voting.spawn_background_tasks(rx.clone()));

        let verifier = self.verifier.clone();
        let mut rx_sweep = rx;
        let interval =
            std::time::Duration::from_secs(self.config.replay_sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { verifier.sweep(); }
                    changed = rx_sweep.changed() => {
                        if changed.is_err() || *rx_sweep.borrow() { break; }
                    }
                }
            }
        }));

        *shutdown_slot = Some(tx);
        self.tasks.lock().expect("task list lock poisoned").extend(handles);
        log::info!("fabric manager {} started", self.node_id);
    }

    /// Signals shutdown, waits for every background task, then performs a
    /// final save of each engine.
    pub async fn stop(&self) {
        let sender = self.shutdown.lock().expect("shutdown slot lock poisoned").take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list lock poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("background task join failed: {e}");
            }
        }
        self.save_all();
        log::info!("fabric manager {} stopped", self.node_id);
    }

    /// Saves every engine's snapshot; failures are logged and retried on
    /// the next save.
    pub fn save_all(&self) {
        for (name, result) in [
            ("incentive", self.incentive.save()),
            ("accusation", self.accusation.save()),
            ("governance", self.voting.save()),
        ] {
            if let Err(e) = result {
                log::warn!("{name} snapshot save failed: {e}");
            }
        }
    }
}
