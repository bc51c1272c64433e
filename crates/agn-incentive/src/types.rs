//! Reward records and the closed set of verifiable sources.

use agn_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a reward claims to originate.
///
/// Only machine-verifiable sources may mint reputation; peer ratings and
/// direct transfers are representable but always refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSource {
    TaskCompletion,
    RelayService,
    StorageService,
    AuditPass,
    VotingParticipation,
    PeerRating,
    DirectTransfer,
}

impl RewardSource {
    pub fn is_verifiable(&self) -> bool {
        !matches!(self, RewardSource::PeerRating | RewardSource::DirectTransfer)
    }
}

impl std::fmt::Display for RewardSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            RewardSource::TaskCompletion => "task_completion",
            RewardSource::RelayService => "relay_service",
            RewardSource::StorageService => "storage_service",
            RewardSource::AuditPass => "audit_pass",
            RewardSource::VotingParticipation => "voting_participation",
            RewardSource::PeerRating => "peer_rating",
            RewardSource::DirectTransfer => "direct_transfer",
        };
        write!(f, "{tag}")
    }
}

/// Shaping applied to the base score of one task type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskWeight {
    pub multiplier: f64,
    pub min_score: f64,
    pub max_score: f64,
}

impl Default for TaskWeight {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            min_score: 0.0,
            max_score: 100.0,
        }
    }
}

impl TaskWeight {
    /// `clamp(base, min, max) * multiplier`.
    pub fn shape(&self, base_score: f64) -> f64 {
        base_score.clamp(self.min_score, self.max_score) * self.multiplier
    }
}

/// Built-in weight table; config entries override per task type.
pub fn default_task_weights() -> HashMap<String, TaskWeight> {
    let mut weights = HashMap::new();
    weights.insert(
        "compute".to_string(),
        TaskWeight {
            multiplier: 1.0,
            min_score: 1.0,
            max_score: 50.0,
        },
    );
    weights.insert(
        "relay".to_string(),
        TaskWeight {
            multiplier: 0.5,
            min_score: 0.5,
            max_score: 20.0,
        },
    );
    weights.insert(
        "storage".to_string(),
        TaskWeight {
            multiplier: 0.8,
            min_score: 1.0,
            max_score: 30.0,
        },
    );
    weights.insert(
        "audit".to_string(),
        TaskWeight {
            multiplier: 1.5,
            min_score: 2.0,
            max_score: 40.0,
        },
    );
    weights
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    /// Created but not yet credited to the ledger.
    Pending,
    /// Credited; eligible for propagation.
    Confirmed,
}

/// A single task-completion reward. At most one exists per `task_id` for the
/// lifetime of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReward {
    pub reward_id: String,
    pub node_id: NodeId,
    pub task_id: String,
    pub task_type: String,
    pub source_kind: RewardSource,
    pub base_score: f64,
    pub task_weight: TaskWeight,
    pub final_score: f64,
    pub ts: u64,
    pub status: RewardStatus,
    pub description: String,
    pub propagated_to: Vec<NodeId>,
}

/// Created once per hop a reward crosses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationRecord {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub original_score: f64,
    pub decay_factor: f64,
    pub propagated_score: f64,
    pub depth: u32,
    pub ts: u64,
    pub origin_reward_id: String,
}

/// Wire payload carried inside a `RewardPropagation` envelope. `score` is
/// the sender's held score before this hop's decay; `depth` is the number of
/// hops from the origin to the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardPropagationMsg {
    pub reward_id: String,
    pub origin: NodeId,
    pub score: f64,
    pub depth: u32,
}
