#![doc = include_str!("../README.md")]

//! # AGN Reputation Crate
//! The kernel every reputation mutation in the system funnels through. All
//! arithmetic is f64 with explicit clamping at the kernel boundary; no code
//! path exposes a score outside `[MIN_SCORE, MAX_SCORE]`.

use agn_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub mod metrics;
pub mod tolerance;

pub use tolerance::{ChargeOutcome, ToleranceBook, ToleranceRecord};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 1000.0;
/// Score assigned to newly observed nodes ("probation").
pub const INITIAL_SCORE: f64 = 10.0;

/// Days of inactivity before natural decay begins.
pub const DECAY_GRACE_DAYS: u64 = 7;
/// Nodes at or above this score never decay below it.
pub const DECAY_FLOOR: f64 = 50.0;
/// Per-tick decay rate never exceeds this fraction.
pub const MAX_DECAY_RATE: f64 = 0.10;

/// Discrete band of reputation driving permissions and quotas.
///
/// The ladder and its permission tables live here and nowhere else; no other
/// component may hardcode thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Blacklist,
    Probation,
    Normal,
    Active,
    Trusted,
    Elder,
}

impl Tier {
    pub fn from_score(score: f64) -> Self {
        let score = clamp_score(score);
        if score < 10.0 {
            Tier::Blacklist
        } else if score < 50.0 {
            Tier::Probation
        } else if score < 200.0 {
            Tier::Normal
        } else if score < 500.0 {
            Tier::Active
        } else if score < 800.0 {
            Tier::Trusted
        } else {
            Tier::Elder
        }
    }

    /// Messages a node of this tier may publish per day.
    pub fn daily_message_quota(&self) -> u32 {
        match self {
            Tier::Blacklist => 0,
            Tier::Probation => 50,
            Tier::Normal => 200,
            Tier::Active => 500,
            Tier::Trusted => 1000,
            Tier::Elder => 2000,
        }
    }

    /// Newcomers a node of this tier may simultaneously endorse.
    pub fn endorsement_slots(&self) -> u32 {
        match self {
            Tier::Blacklist => 0,
            Tier::Probation => 0,
            Tier::Normal => 1,
            Tier::Active => 3,
            Tier::Trusted => 5,
            Tier::Elder => 10,
        }
    }

    /// Whether a node of this tier may serve on committees or as a
    /// super-node.
    pub fn committee_eligible(&self) -> bool {
        matches!(self, Tier::Trusted | Tier::Elder)
    }
}

/// Clamps a score into the kernel band. Non-finite inputs collapse to the
/// minimum rather than failing.
pub fn clamp_score(score: f64) -> f64 {
    if !score.is_finite() {
        return MIN_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Gain with diminishing returns: `base * (1 - r/1000)^0.5`, clipped so the
/// resulting score never exceeds the ceiling. Monotone non-increasing in `r`.
pub fn gain(score: f64, base: f64) -> f64 {
    let score = clamp_score(score);
    let base = if base.is_finite() { base.max(0.0) } else { 0.0 };
    let delta = base * (1.0 - score / MAX_SCORE).sqrt();
    delta.min(MAX_SCORE - score)
}

/// Loss with high-rank-high-duty: `base * (r/1000)^0.3`, clipped so the
/// resulting score never drops below the floor. Monotone non-decreasing in
/// `r`.
pub fn loss(score: f64, base: f64) -> f64 {
    let score = clamp_score(score);
    let base = if base.is_finite() { base.max(0.0) } else { 0.0 };
    let delta = base * (score / MAX_SCORE).powf(0.3);
    delta.min(score)
}

pub fn apply_gain(score: f64, base: f64) -> f64 {
    let score = clamp_score(score);
    clamp_score(score + gain(score, base))
}

pub fn apply_loss(score: f64, base: f64) -> f64 {
    let score = clamp_score(score);
    clamp_score(score - loss(score, base))
}

/// Natural decay after `days_inactive` days. The first
/// [`DECAY_GRACE_DAYS`] days are free; after that the score shrinks by
/// `0.01 * (days - grace) / grace`, capped at [`MAX_DECAY_RATE`] per
/// application. Nodes at or above [`DECAY_FLOOR`] before decay never fall
/// below it.
pub fn natural_decay(score: f64, days_inactive: u64) -> f64 {
    let score = clamp_score(score);
    if days_inactive <= DECAY_GRACE_DAYS {
        return score;
    }
    let excess = (days_inactive - DECAY_GRACE_DAYS) as f64;
    let rate = (0.01 * excess / DECAY_GRACE_DAYS as f64).min(MAX_DECAY_RATE);
    let decayed = score * (1.0 - rate);
    if score >= DECAY_FLOOR {
        decayed.max(DECAY_FLOOR)
    } else {
        decayed.max(MIN_SCORE)
    }
}

/// One node's standing as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub score: f64,
    pub last_active: u64,
}

/// A decay applied to one node by the periodic sweep.
#[derive(Debug, Clone)]
pub struct DecayEvent {
    pub node_id: NodeId,
    pub old_score: f64,
    pub new_score: f64,
    pub days_inactive: u64,
}

/// Registry of node scores; the only mutation paths are `apply_gain` and
/// `apply_loss`, so bounds and rank-dependent shaping always hold.
pub trait ReputationStore: Send + Sync {
    /// Current score, [`INITIAL_SCORE`] for nodes never seen before.
    fn get_score(&self, node: &NodeId) -> f64;

    /// Credits via the kernel gain curve; returns the new score.
    fn apply_gain(&self, node: &NodeId, base: f64) -> Result<f64, agn_common::CommonError>;

    /// Debits via the kernel loss curve; returns the new score.
    fn apply_loss(&self, node: &NodeId, base: f64) -> Result<f64, agn_common::CommonError>;

    /// Records activity so natural decay restarts its grace period.
    fn touch(&self, node: &NodeId, now_secs: u64);

    fn tier(&self, node: &NodeId) -> Tier {
        Tier::from_score(self.get_score(node))
    }

    fn all_nodes(&self) -> Vec<NodeId>;

    /// Applies natural decay to every inactive node; default is a no-op for
    /// stores that do not track activity.
    fn decay_inactive(&self, now_secs: u64) -> Vec<DecayEvent> {
        let _ = now_secs;
        Vec::new()
    }
}

impl std::fmt::Debug for dyn ReputationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReputationStore")
    }
}

/// In-memory score registry shared by the engines of one node.
#[derive(Default)]
pub struct InMemoryReputationStore {
    nodes: Mutex<HashMap<NodeId, NodeScore>>,
}

impl InMemoryReputationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a score directly; test wiring only, still clamped.
    pub fn set_score(&self, node: NodeId, score: f64) {
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        let entry = nodes.entry(node).or_insert(NodeScore {
            node_id: node,
            score: INITIAL_SCORE,
            last_active: 0,
        });
        entry.score = clamp_score(score);
    }

    pub fn snapshot(&self) -> Vec<NodeScore> {
        self.nodes
            .lock()
            .expect("score registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn restore(&self, scores: Vec<NodeScore>) {
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        nodes.clear();
        for mut record in scores {
            record.score = clamp_score(record.score);
            nodes.insert(record.node_id, record);
        }
    }
}

impl ReputationStore for InMemoryReputationStore {
    fn get_score(&self, node: &NodeId) -> f64 {
        self.nodes
            .lock()
            .expect("score registry lock poisoned")
            .get(node)
            .map(|r| r.score)
            .unwrap_or(INITIAL_SCORE)
    }

    fn apply_gain(&self, node: &NodeId, base: f64) -> Result<f64, agn_common::CommonError> {
        metrics::GAIN_APPLICATIONS.inc();
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        let entry = nodes.entry(*node).or_insert(NodeScore {
            node_id: *node,
            score: INITIAL_SCORE,
            last_active: 0,
        });
        entry.score = apply_gain(entry.score, base);
        Ok(entry.score)
    }

    fn apply_loss(&self, node: &NodeId, base: f64) -> Result<f64, agn_common::CommonError> {
        metrics::LOSS_APPLICATIONS.inc();
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        let entry = nodes.entry(*node).or_insert(NodeScore {
            node_id: *node,
            score: INITIAL_SCORE,
            last_active: 0,
        });
        entry.score = apply_loss(entry.score, base);
        Ok(entry.score)
    }

    fn touch(&self, node: &NodeId, now_secs: u64) {
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        let entry = nodes.entry(*node).or_insert(NodeScore {
            node_id: *node,
            score: INITIAL_SCORE,
            last_active: now_secs,
        });
        entry.last_active = entry.last_active.max(now_secs);
    }

    fn all_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .lock()
            .expect("score registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    fn decay_inactive(&self, now_secs: u64) -> Vec<DecayEvent> {
        let mut events = Vec::new();
        let mut nodes = self.nodes.lock().expect("score registry lock poisoned");
        for record in nodes.values_mut() {
            let idle_secs = now_secs.saturating_sub(record.last_active);
            let days_inactive = idle_secs / 86_400;
            if days_inactive <= DECAY_GRACE_DAYS {
                continue;
            }
            let new_score = natural_decay(record.score, days_inactive);
            if (new_score - record.score).abs() > f64::EPSILON {
                events.push(DecayEvent {
                    node_id: record.node_id,
                    old_score: record.score,
                    new_score,
                    days_inactive,
                });
                record.score = new_score;
            }
        }
        if !events.is_empty() {
            metrics::DECAY_EVENTS.inc_by(events.len() as u64);
        }
        events
    }
}
