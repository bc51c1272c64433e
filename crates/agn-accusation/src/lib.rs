#![doc = include_str!("../README.md")]

//! # AGN Accusation Crate
//! The mirror of the incentive engine for punishment: signed accusations
//! propagate with bounded depth and per-hop decay, receivers charge each
//! accuser's tolerance bucket, and a local analysis decides whether the
//! decayed penalty lands on the accused.

use agn_common::{CommonError, NodeId};
use agn_reputation::clamp_score;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod engine;
pub mod metrics;
pub mod types;

pub use engine::AccusationEngine;
pub use types::{Accusation, AccusationAnalysis, AccusationStatus};

/// Engine configuration; all fields carry production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccusationConfig {
    /// Lifetime of a fresh accusation before it archives unverified.
    pub default_expiry_secs: u64,
    /// Per-hop multiplier on penalties, 0 < f < 1.
    pub decay_factor: f64,
    /// Per-(target, accuser) cap on inbound penalty per reset period.
    pub default_tolerance: f64,
    pub tolerance_reset_period_secs: u64,
    pub tolerance_sweep_interval_secs: u64,
    /// Penalty before reputation scaling and hop decay.
    pub base_penalty: f64,
    /// Cost the accuser pays up front, divided by the reputation factor.
    pub base_accuser_cost: f64,
    /// Accusations from nodes below this score are refused at creation.
    pub min_accuser_reputation: f64,
    pub max_propagation_depth: u32,
    pub natural_decay_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How long archived accusations are retained before deletion.
    pub archived_retention_secs: u64,
}

impl Default for AccusationConfig {
    fn default() -> Self {
        Self {
            default_expiry_secs: 3 * 24 * 3600,
            decay_factor: 0.8,
            default_tolerance: 30.0,
            tolerance_reset_period_secs: 24 * 3600,
            tolerance_sweep_interval_secs: 3600,
            base_penalty: 10.0,
            base_accuser_cost: 2.0,
            min_accuser_reputation: 50.0,
            max_propagation_depth: 3,
            natural_decay_interval_secs: 24 * 3600,
            cleanup_interval_secs: 3600,
            archived_retention_secs: 7 * 24 * 3600,
        }
    }
}

/// Scales penalties and accuser costs by the accuser's standing.
///
/// The formula operates on a 0-100 band, so kernel scores are divided by 10
/// first: `0.5 + (r/10)/100 * 1.5`, i.e. 0.5 at the floor and 2.0 at the
/// ceiling. High-reputation accusers hit harder and pay less.
pub fn reputation_factor(kernel_score: f64) -> f64 {
    let banded = clamp_score(kernel_score) / 10.0;
    0.5 + banded / 100.0 * 1.5
}

/// Every gate an accusation can trip; all are non-fatal refusals.
#[derive(Debug, Error)]
pub enum AccusationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("a node cannot accuse itself")]
    SelfAccusation,
    #[error("accuser reputation {actual:.1} below required {required:.1}")]
    InsufficientReputation { required: f64, actual: f64 },
    #[error("unknown accusation {0}")]
    UnknownAccusation(String),
    #[error("duplicate accusation {0}")]
    Duplicate(String),
    #[error("accusation {0} has expired")]
    Expired(String),
    #[error("accusation {0} already finalized")]
    AlreadyFinalized(String),
    #[error("propagation depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },
    #[error("signature invalid: {0}")]
    InvalidSignature(String),
    #[error("accuser does not match public key binding")]
    BindingMismatch,
    #[error("tolerance exceeded for penalties from {accuser}: requested {requested:.3}, remaining {remaining:.3}")]
    ToleranceExceeded {
        accuser: NodeId,
        requested: f64,
        remaining: f64,
    },
    #[error(transparent)]
    Common(#[from] CommonError),
}
