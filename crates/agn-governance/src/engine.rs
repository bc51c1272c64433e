//! The voting engine: proposals, weighted ballots, finalization.

use crate::types::{
    NodeStatus, NodeTrust, Proposal, ProposalKind, ProposalStatus, TallyResult, Vote, VoteChoice,
};
use crate::{metrics, StakeProvider, VotingConfig, VotingError};
use agn_common::fsutil::{read_json_if_exists, write_json_atomic};
use agn_common::{CommonError, NodeId, Signable, TimeProvider};
use agn_identity::{sign_bytes, verify_bytes, verifying_key_from_bytes, SignatureBytes, SigningKey};
use agn_reputation::ReputationStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type ProposalCallback = Box<dyn Fn(&Proposal) + Send + Sync>;
type VoteCallback = Box<dyn Fn(&Vote) + Send + Sync>;
type NodeCallback = Box<dyn Fn(&NodeId) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_proposal_created: Option<ProposalCallback>,
    on_vote_cast: Option<VoteCallback>,
    on_proposal_finalized: Option<ProposalCallback>,
    on_node_kicked: Option<NodeCallback>,
    on_node_restored: Option<NodeCallback>,
}

struct VotingState {
    nodes: HashMap<NodeId, NodeTrust>,
    proposals: HashMap<String, Proposal>,
}

#[derive(Serialize, Deserialize)]
struct VotingSnapshot {
    saved_at: u64,
    nodes: Vec<NodeTrust>,
    proposals: Vec<Proposal>,
}

/// What a finalization decided, gathered under the lock and dispatched
/// after it is released.
enum FinalizeEffect {
    None,
    Kicked(NodeId),
    Restored(NodeId),
}

/// Thread-safe voting engine for one node identity.
pub struct VotingEngine {
    config: VotingConfig,
    local: NodeId,
    signing_key: SigningKey,
    stake: Arc<dyn StakeProvider>,
    reputation: Arc<dyn ReputationStore>,
    time: Arc<dyn TimeProvider>,
    state: RwLock<VotingState>,
    callbacks: RwLock<Callbacks>,
    snapshot_path: Option<PathBuf>,
}

impl VotingEngine {
    pub fn new(
        config: VotingConfig,
        signing_key: SigningKey,
        reputation: Arc<dyn ReputationStore>,
        stake: Arc<dyn StakeProvider>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let local = agn_identity::node_id_from_verifying_key(&signing_key.verifying_key());
        Self {
            config,
            local,
            signing_key,
            stake,
            reputation,
            time,
            state: RwLock::new(VotingState {
                nodes: HashMap::new(),
                proposals: HashMap::new(),
            }),
            callbacks: RwLock::new(Callbacks::default()),
            snapshot_path: None,
        }
    }

    /// Enables persistence at `path`, loading any previous snapshot.
    pub fn with_snapshot_path(mut self, path: PathBuf) -> Result<Self, CommonError> {
        if let Some(snapshot) = read_json_if_exists::<VotingSnapshot>(&path)? {
            let mut state = self.state.write().expect("voting state lock poisoned");
            state.nodes = snapshot
                .nodes
                .into_iter()
                .map(|n| (n.node_id, n))
                .collect();
            state.proposals = snapshot
                .proposals
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect();
            log::info!(
                "voting engine restored {} nodes, {} proposals",
                state.nodes.len(),
                state.proposals.len()
            );
        }
        self.snapshot_path = Some(path);
        Ok(self)
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn set_on_proposal_created<F: Fn(&Proposal) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("voting callbacks lock poisoned")
            .on_proposal_created = Some(Box::new(f));
    }

    pub fn set_on_vote_cast<F: Fn(&Vote) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("voting callbacks lock poisoned")
            .on_vote_cast = Some(Box::new(f));
    }

    pub fn set_on_proposal_finalized<F: Fn(&Proposal) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("voting callbacks lock poisoned")
            .on_proposal_finalized = Some(Box::new(f));
    }

    pub fn set_on_node_kicked<F: Fn(&NodeId) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("voting callbacks lock poisoned")
            .on_node_kicked = Some(Box::new(f));
    }

    pub fn set_on_node_restored<F: Fn(&NodeId) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("voting callbacks lock poisoned")
            .on_node_restored = Some(Box::new(f));
    }

    /// Registers a node in the trust registry, pulling reputation and stake
    /// from their sources of truth.
    pub fn register_node(&self, node: NodeId) -> NodeTrust {
        let now = self.time.unix_seconds();
        let trust = NodeTrust {
            node_id: node,
            reputation: self.reputation.get_score(&node),
            stake: self.stake.stake(&node),
            status: NodeStatus::Active,
            joined_at: now,
            last_active: now,
            vote_count: 0,
        };
        self.state
            .write()
            .expect("voting state lock poisoned")
            .nodes
            .entry(node)
            .or_insert(trust)
            .clone()
    }

    /// Refreshes one node's reputation and stake from their sources.
    pub fn sync_node(&self, node: &NodeId) -> Option<NodeTrust> {
        let reputation = self.reputation.get_score(node);
        let stake = self.stake.stake(node);
        let mut state = self.state.write().expect("voting state lock poisoned");
        let trust = state.nodes.get_mut(node)?;
        trust.reputation = reputation;
        trust.stake = stake;
        Some(trust.clone())
    }

    pub fn node(&self, node: &NodeId) -> Option<NodeTrust> {
        self.state
            .read()
            .expect("voting state lock poisoned")
            .nodes
            .get(node)
            .cloned()
    }

    fn weight_of(&self, trust: &NodeTrust) -> f64 {
        self.config.reputation_weight * trust.reputation
            + self.config.stake_weight * trust.stake
    }

    /// Creates a proposal, gated on the proposer's reputation and on no
    /// identical (kind, target) proposal already pending.
    pub fn create_proposal(
        &self,
        proposer: &NodeId,
        kind: ProposalKind,
        target: &NodeId,
        reason: &str,
    ) -> Result<Proposal, VotingError> {
        let score = self.reputation.get_score(proposer);
        if score < self.config.min_rep_to_propose {
            return Err(VotingError::InsufficientReputation {
                required: self.config.min_rep_to_propose,
                actual: score,
            });
        }
        let now = self.time.unix_seconds();
        let proposal = {
            let mut state = self.state.write().expect("voting state lock poisoned");
            if !state.nodes.contains_key(proposer) {
                return Err(VotingError::UnknownNode(*proposer));
            }
            let duplicate = state.proposals.values().any(|p| {
                p.status == ProposalStatus::Pending && p.kind == kind && p.target == *target
            });
            if duplicate {
                return Err(VotingError::DuplicateProposal(kind));
            }
            let proposal = Proposal {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                target: *target,
                proposer: *proposer,
                reason: reason.to_string(),
                created_at: now,
                expires_at: now + self.config.proposal_duration_secs,
                votes: HashMap::new(),
                status: ProposalStatus::Pending,
                result: None,
            };
            state.proposals.insert(proposal.id.clone(), proposal.clone());
            proposal
        };

        metrics::PROPOSALS_CREATED.inc();
        let callbacks = self.callbacks.read().expect("voting callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_proposal_created {
            cb(&proposal);
        }
        drop(callbacks);
        self.request_save();
        Ok(proposal)
    }

    /// Records a ballot from a locally known voter; the engine signs on its
    /// own behalf as the recording witness, then attempts finalization.
    pub fn cast_vote(
        &self,
        voter: &NodeId,
        proposal_id: &str,
        choice: VoteChoice,
        reason: &str,
    ) -> Result<Vote, VotingError> {
        let now = self.time.unix_seconds();
        let vote = {
            let mut guard = self.state.write().expect("voting state lock poisoned");
            let state = &mut *guard;
            let trust = state
                .nodes
                .get_mut(voter)
                .ok_or(VotingError::UnknownNode(*voter))?;
            if trust.reputation < self.config.min_rep_to_vote {
                return Err(VotingError::InsufficientReputation {
                    required: self.config.min_rep_to_vote,
                    actual: trust.reputation,
                });
            }
            let weight = self.config.reputation_weight * trust.reputation
                + self.config.stake_weight * trust.stake;

            let proposal = state
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| VotingError::UnknownProposal(proposal_id.to_string()))?;
            Self::check_open(proposal, now, self.config.buffer_period_secs)?;
            if proposal.votes.contains_key(voter) {
                return Err(VotingError::AlreadyVoted(*voter));
            }

            let mut vote = Vote {
                id: uuid::Uuid::new_v4().to_string(),
                proposal_id: proposal_id.to_string(),
                voter: *voter,
                voter_public_key: self.signing_key.verifying_key().as_bytes().to_vec(),
                choice,
                weight,
                ts: now,
                reason: reason.to_string(),
                signature: SignatureBytes(Vec::new()),
            };
            vote.signature = sign_bytes(&self.signing_key, &vote.to_signable_bytes()?);
            proposal.votes.insert(*voter, vote.clone());
            trust.vote_count += 1;
            trust.last_active = now;
            vote
        };

        metrics::VOTES_CAST.inc();
        let callbacks = self.callbacks.read().expect("voting callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_vote_cast {
            cb(&vote);
        }
        drop(callbacks);
        self.try_finalize(proposal_id)?;
        self.request_save();
        Ok(vote)
    }

    /// Accepts a remotely signed ballot: signature and binding are
    /// verified, the voter floor is enforced against the local registry,
    /// and the weight is recomputed from the local view rather than trusted
    /// from the wire.
    pub fn receive_vote(&self, mut vote: Vote) -> Result<Vote, VotingError> {
        let expected = NodeId::from_public_key_bytes(&vote.voter_public_key);
        if expected != vote.voter {
            return Err(VotingError::BindingMismatch);
        }
        let vk = verifying_key_from_bytes(&vote.voter_public_key)
            .map_err(|e| VotingError::InvalidSignature(e.to_string()))?;
        verify_bytes(&vk, &vote.to_signable_bytes()?, &vote.signature)
            .map_err(|e| VotingError::InvalidSignature(e.to_string()))?;

        let now = self.time.unix_seconds();
        let proposal_id = vote.proposal_id.clone();
        {
            let mut guard = self.state.write().expect("voting state lock poisoned");
            let state = &mut *guard;
            let trust = state
                .nodes
                .get_mut(&vote.voter)
                .ok_or(VotingError::UnknownNode(vote.voter))?;
            if trust.reputation < self.config.min_rep_to_vote {
                return Err(VotingError::InsufficientReputation {
                    required: self.config.min_rep_to_vote,
                    actual: trust.reputation,
                });
            }
            vote.weight = self.config.reputation_weight * trust.reputation
                + self.config.stake_weight * trust.stake;

            let proposal = state
                .proposals
                .get_mut(&proposal_id)
                .ok_or_else(|| VotingError::UnknownProposal(proposal_id.clone()))?;
            Self::check_open(proposal, now, self.config.buffer_period_secs)?;
            if proposal.votes.contains_key(&vote.voter) {
                return Err(VotingError::AlreadyVoted(vote.voter));
            }
            proposal.votes.insert(vote.voter, vote.clone());
            trust.vote_count += 1;
            trust.last_active = now;
        }

        metrics::VOTES_CAST.inc();
        let callbacks = self.callbacks.read().expect("voting callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_vote_cast {
            cb(&vote);
        }
        drop(callbacks);
        self.try_finalize(&proposal_id)?;
        self.request_save();
        Ok(vote)
    }

    /// Stores a proposal announced by a remote node. The envelope layer has
    /// already authenticated the sender; the proposer floor and the
    /// duplicate gates still apply, and any ballots smuggled in the wire
    /// form are discarded.
    pub fn receive_proposal(&self, mut proposal: Proposal) -> Result<Proposal, VotingError> {
        let score = self.reputation.get_score(&proposal.proposer);
        if score < self.config.min_rep_to_propose {
            return Err(VotingError::InsufficientReputation {
                required: self.config.min_rep_to_propose,
                actual: score,
            });
        }
        {
            let mut state = self.state.write().expect("voting state lock poisoned");
            if state.proposals.contains_key(&proposal.id) {
                return Err(VotingError::Validation(format!(
                    "proposal {} already known",
                    proposal.id
                )));
            }
            let duplicate = state.proposals.values().any(|p| {
                p.status == ProposalStatus::Pending
                    && p.kind == proposal.kind
                    && p.target == proposal.target
            });
            if duplicate {
                return Err(VotingError::DuplicateProposal(proposal.kind));
            }
            proposal.votes.clear();
            proposal.status = ProposalStatus::Pending;
            proposal.result = None;
            state.proposals.insert(proposal.id.clone(), proposal.clone());
        }
        metrics::PROPOSALS_CREATED.inc();
        let callbacks = self.callbacks.read().expect("voting callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_proposal_created {
            cb(&proposal);
        }
        drop(callbacks);
        self.request_save();
        Ok(proposal)
    }

    fn check_open(proposal: &Proposal, now: u64, buffer_secs: u64) -> Result<(), VotingError> {
        if proposal.status != ProposalStatus::Pending {
            return Err(VotingError::NotPending(proposal.id.clone()));
        }
        if now >= proposal.expires_at {
            return Err(VotingError::Expired(proposal.id.clone()));
        }
        let elapsed = now.saturating_sub(proposal.created_at);
        if elapsed < buffer_secs {
            return Err(VotingError::BufferPeriod {
                remaining_secs: buffer_secs - elapsed,
            });
        }
        Ok(())
    }

    fn tally(&self, proposal: &Proposal, nodes: &HashMap<NodeId, NodeTrust>) -> TallyResult {
        let mut result = TallyResult::default();
        for vote in proposal.votes.values() {
            result.total_weight += vote.weight;
            match vote.choice {
                VoteChoice::Yes => result.yes_weight += vote.weight,
                VoteChoice::No => result.no_weight += vote.weight,
                VoteChoice::Abstain => result.abstain_weight += vote.weight,
            }
        }
        result.total_possible_weight = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| self.weight_of(n))
            .sum();
        result.quorum = if result.total_possible_weight > 0.0 {
            result.total_weight / result.total_possible_weight
        } else {
            0.0
        };
        result.yes_ratio = if result.total_weight > 0.0 {
            result.yes_weight / result.total_weight
        } else {
            0.0
        };
        result
    }

    /// Finalizes a proposal if quorum is met; idempotent, and a no-op while
    /// the quorum gate is still open.
    pub fn try_finalize(&self, proposal_id: &str) -> Result<ProposalStatus, VotingError> {
        let (status, finalized, effect) = {
            let mut guard = self.state.write().expect("voting state lock poisoned");
            let state = &mut *guard;
            let proposal = state
                .proposals
                .get(proposal_id)
                .ok_or_else(|| VotingError::UnknownProposal(proposal_id.to_string()))?;
            if proposal.status != ProposalStatus::Pending {
                return Ok(proposal.status);
            }
            let result = self.tally(proposal, &state.nodes);
            if result.quorum < self.config.quorum_threshold {
                return Ok(ProposalStatus::Pending);
            }
            let status = if result.yes_ratio >= self.config.pass_threshold {
                ProposalStatus::Passed
            } else {
                ProposalStatus::Rejected
            };
            let proposal = state
                .proposals
                .get_mut(proposal_id)
                .expect("proposal vanished under write lock");
            proposal.status = status;
            proposal.result = Some(result);
            let effect = if status == ProposalStatus::Passed {
                Self::apply_passed(proposal.kind, proposal.target, &mut state.nodes)
            } else {
                FinalizeEffect::None
            };
            (status, proposal.clone(), effect)
        };

        self.dispatch_finalized(&finalized, effect);
        self.request_save();
        Ok(status)
    }

    fn apply_passed(
        kind: ProposalKind,
        target: NodeId,
        nodes: &mut HashMap<NodeId, NodeTrust>,
    ) -> FinalizeEffect {
        match kind {
            ProposalKind::Kick => {
                if let Some(trust) = nodes.get_mut(&target) {
                    trust.status = NodeStatus::Removed;
                }
                FinalizeEffect::Kicked(target)
            }
            ProposalKind::Restore => {
                if let Some(trust) = nodes.get_mut(&target) {
                    trust.status = NodeStatus::Active;
                }
                FinalizeEffect::Restored(target)
            }
            ProposalKind::Promote | ProposalKind::Demote | ProposalKind::Generic => {
                FinalizeEffect::None
            }
        }
    }

    fn dispatch_finalized(&self, proposal: &Proposal, effect: FinalizeEffect) {
        metrics::PROPOSALS_FINALIZED.inc();
        log::info!(
            "proposal {} ({:?} {}) finalized as {:?}",
            proposal.id,
            proposal.kind,
            proposal.target,
            proposal.status
        );
        let callbacks = self.callbacks.read().expect("voting callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_proposal_finalized {
            cb(proposal);
        }
        match effect {
            FinalizeEffect::Kicked(node) => {
                if let Some(cb) = &callbacks.on_node_kicked {
                    cb(&node);
                }
            }
            FinalizeEffect::Restored(node) => {
                if let Some(cb) = &callbacks.on_node_restored {
                    cb(&node);
                }
            }
            FinalizeEffect::None => {}
        }
    }

    pub fn proposal(&self, proposal_id: &str) -> Option<Proposal> {
        self.state
            .read()
            .expect("voting state lock poisoned")
            .proposals
            .get(proposal_id)
            .cloned()
    }

    pub fn pending_proposals(&self) -> Vec<Proposal> {
        self.state
            .read()
            .expect("voting state lock poisoned")
            .proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Pending)
            .cloned()
            .collect()
    }

    /// Finalizes expired proposals: quorum met decides Passed/Rejected,
    /// otherwise the proposal expires. Returns how many left Pending.
    pub fn run_expiry_sweep(&self) -> usize {
        let now = self.time.unix_seconds();
        let expired_ids: Vec<String> = {
            let state = self.state.read().expect("voting state lock poisoned");
            state
                .proposals
                .values()
                .filter(|p| p.status == ProposalStatus::Pending && now >= p.expires_at)
                .map(|p| p.id.clone())
                .collect()
        };

        let mut swept = 0;
        for id in expired_ids {
            match self.try_finalize(&id) {
                Ok(ProposalStatus::Pending) => {
                    // Quorum never met: expire in place.
                    let finalized = {
                        let mut state =
                            self.state.write().expect("voting state lock poisoned");
                        let Some(proposal) = state.proposals.get_mut(&id) else {
                            continue;
                        };
                        if proposal.status != ProposalStatus::Pending {
                            continue;
                        }
                        proposal.status = ProposalStatus::Expired;
                        proposal.clone()
                    };
                    self.dispatch_finalized(&finalized, FinalizeEffect::None);
                    swept += 1;
                }
                Ok(_) => {
                    swept += 1;
                }
                Err(e) => log::warn!("expiry sweep failed to finalize {id}: {e}"),
            }
        }
        if swept > 0 {
            self.request_save();
        }
        swept
    }

    /// Deletes finalized proposals past the retention period.
    pub fn run_cleanup(&self) -> usize {
        let now = self.time.unix_seconds();
        let retention = self.config.finalized_retention_secs;
        let removed = {
            let mut state = self.state.write().expect("voting state lock poisoned");
            let before = state.proposals.len();
            state.proposals.retain(|_, p| {
                p.status == ProposalStatus::Pending
                    || now.saturating_sub(p.expires_at) <= retention
            });
            before - state.proposals.len()
        };
        if removed > 0 {
            log::debug!("voting cleanup removed {removed} finalized proposals");
            self.request_save();
        }
        removed
    }

    /// Serializes primary records and commits them atomically.
    pub fn save(&self) -> Result<(), CommonError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = {
            let state = self.state.read().expect("voting state lock poisoned");
            VotingSnapshot {
                saved_at: self.time.unix_seconds(),
                nodes: state.nodes.values().cloned().collect(),
                proposals: state.proposals.values().cloned().collect(),
            }
        };
        write_json_atomic(path, &snapshot)
    }

    fn request_save(&self) {
        if let Err(e) = self.save() {
            log::warn!("voting snapshot save failed, will retry on next save: {e}");
        }
    }

    /// Spawns the expiry sweep and the cleanup task.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        let mut rx = shutdown.clone();
        let interval =
            std::time::Duration::from_secs(self.config.expiry_sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.run_expiry_sweep(); }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() { break; }
                    }
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut rx = shutdown;
        let interval = std::time::Duration::from_secs(self.config.cleanup_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.run_cleanup(); }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() { break; }
                    }
                }
            }
        }));

        handles
    }
}
