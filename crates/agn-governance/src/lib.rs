#![doc = include_str!("../README.md")]

//! # AGN Governance Crate
//! Weighted voting over node standing: proposals gate on proposer
//! reputation, ballots gate on voter reputation and a buffer period, and
//! finalization enforces quorum against the total possible weight of active
//! nodes before the pass threshold decides the outcome.

use agn_common::{CommonError, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

pub mod engine;
pub mod metrics;
pub mod types;

pub use engine::VotingEngine;
pub use types::{
    NodeStatus, NodeTrust, Proposal, ProposalKind, ProposalStatus, TallyResult, Vote, VoteChoice,
};

/// Engine configuration; all fields carry production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Fraction of received weight that must be Yes for a pass, 0 < t <= 1.
    pub pass_threshold: f64,
    /// Fraction of total possible weight that must have voted, 0 < q <= 1.
    pub quorum_threshold: f64,
    /// How long a proposal accepts votes.
    pub proposal_duration_secs: u64,
    /// Votes are refused until this long after proposal creation.
    pub buffer_period_secs: u64,
    /// alpha in `weight = alpha * reputation + beta * stake`.
    pub reputation_weight: f64,
    /// beta in `weight = alpha * reputation + beta * stake`.
    pub stake_weight: f64,
    pub min_rep_to_vote: f64,
    pub min_rep_to_propose: f64,
    /// Cadence of the expiry sweep.
    pub expiry_sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How long finalized proposals are retained before deletion.
    pub finalized_retention_secs: u64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.6,
            quorum_threshold: 0.5,
            proposal_duration_secs: 24 * 3600,
            buffer_period_secs: 600,
            reputation_weight: 0.7,
            stake_weight: 0.3,
            min_rep_to_vote: 50.0,
            min_rep_to_propose: 50.0,
            expiry_sweep_interval_secs: 60,
            cleanup_interval_secs: 3600,
            finalized_retention_secs: 7 * 24 * 3600,
        }
    }
}

/// External source of truth for per-node stake, refreshed whenever the
/// registry syncs a node.
pub trait StakeProvider: Send + Sync {
    fn stake(&self, node: &NodeId) -> f64;
}

/// In-memory [`StakeProvider`] for wiring and tests.
#[derive(Debug, Default)]
pub struct StaticStakeProvider {
    stakes: RwLock<std::collections::HashMap<NodeId, f64>>,
}

impl StaticStakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stake(&self, node: NodeId, stake: f64) {
        self.stakes
            .write()
            .expect("stake map lock poisoned")
            .insert(node, stake);
    }
}

impl StakeProvider for StaticStakeProvider {
    fn stake(&self, node: &NodeId) -> f64 {
        self.stakes
            .read()
            .expect("stake map lock poisoned")
            .get(node)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Every gate a proposal or vote can trip; all are non-fatal refusals.
#[derive(Debug, Error)]
pub enum VotingError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown proposal {0}")]
    UnknownProposal(String),
    #[error("a {0:?} proposal against this target is already pending")]
    DuplicateProposal(types::ProposalKind),
    #[error("reputation {actual:.1} below required {required:.1}")]
    InsufficientReputation { required: f64, actual: f64 },
    #[error("proposal {0} is not open for voting")]
    NotPending(String),
    #[error("proposal {0} has expired")]
    Expired(String),
    #[error("buffer period active for another {remaining_secs}s")]
    BufferPeriod { remaining_secs: u64 },
    #[error("{0} already voted on this proposal")]
    AlreadyVoted(NodeId),
    #[error("signature invalid: {0}")]
    InvalidSignature(String),
    #[error("voter does not match public key binding")]
    BindingMismatch,
    #[error(transparent)]
    Common(#[from] CommonError),
}
