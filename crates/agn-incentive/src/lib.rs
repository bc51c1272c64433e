#![doc = include_str!("../README.md")]

//! # AGN Incentive Crate
//! This crate implements the reward half of the reputation fabric: creating
//! task-completion rewards from verifiable sources and propagating them to
//! neighbors with per-hop decay, bounded depth, and per-origin tolerance.

use agn_common::{CommonError, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod engine;
pub mod metrics;
pub mod types;

pub use engine::{IncentiveEngine, ReceiveReport};
pub use types::{
    default_task_weights, PropagationRecord, RewardPropagationMsg, RewardSource, RewardStatus,
    TaskReward, TaskWeight,
};

/// Engine configuration; every field has a production default so partial
/// config files stay valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncentiveConfig {
    /// Per-hop multiplier applied to propagated scores, 0 < f < 1.
    pub default_decay_factor: f64,
    /// Per-(target, source) cap on inbound credit per reset period.
    pub default_tolerance: f64,
    /// Full-refill period for tolerance buckets.
    pub tolerance_reset_period_secs: u64,
    /// How often the background sweep scans for due resets.
    pub tolerance_sweep_interval_secs: u64,
    /// Propagated scores below this are refused rather than credited.
    pub min_propagation_score: f64,
    /// Maximum number of hops a reward may travel.
    pub max_propagation_depth: u32,
    /// Per task type shaping; missing types use [`TaskWeight::default`].
    pub task_weights: HashMap<String, TaskWeight>,
}

impl Default for IncentiveConfig {
    fn default() -> Self {
        Self {
            default_decay_factor: 0.7,
            default_tolerance: 100.0,
            tolerance_reset_period_secs: 24 * 3600,
            tolerance_sweep_interval_secs: 3600,
            min_propagation_score: 1.0,
            max_propagation_depth: 3,
            task_weights: default_task_weights(),
        }
    }
}

impl IncentiveConfig {
    pub fn weight_for(&self, task_type: &str) -> TaskWeight {
        self.task_weights
            .get(task_type)
            .copied()
            .unwrap_or_default()
    }
}

/// Every gate a reward or propagation can trip. All variants are non-fatal
/// refusals reported to the caller; none mutate state.
#[derive(Debug, Error)]
pub enum IncentiveError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("source {0} is not verifiable")]
    UnverifiableSource(RewardSource),
    #[error("task {task_id} was already rewarded")]
    DuplicateReward { task_id: String },
    #[error("unknown reward {0}")]
    UnknownReward(String),
    #[error("reward {0} is not confirmed")]
    NotConfirmed(String),
    #[error("refusing to propagate a reward back to its source")]
    SelfPropagation,
    #[error("propagation depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },
    #[error("propagated score {score:.3} below threshold {min:.3}")]
    BelowThreshold { score: f64, min: f64 },
    #[error("tolerance exceeded for {target} from {src}: requested {requested:.3}, remaining {remaining:.3}")]
    ToleranceExceeded {
        src: NodeId,
        target: NodeId,
        requested: f64,
        remaining: f64,
    },
    #[error(transparent)]
    Common(#[from] CommonError),
}
