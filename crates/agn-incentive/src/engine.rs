//! The incentive engine: award, propagate, receive.

use crate::types::{
    PropagationRecord, RewardPropagationMsg, RewardSource, RewardStatus, TaskReward,
};
use crate::{metrics, IncentiveConfig, IncentiveError};
use agn_common::fsutil::{read_json_if_exists, write_json_atomic};
use agn_common::{CommonError, NeighborProvider, NodeId, TimeProvider};
use agn_reputation::{ChargeOutcome, ReputationStore, ToleranceBook, ToleranceRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type RewardCreatedCallback = Box<dyn Fn(&TaskReward) + Send + Sync>;
type RewardPropagatedCallback = Box<dyn Fn(&PropagationRecord) + Send + Sync>;
type ToleranceExceededCallback = Box<dyn Fn(&NodeId, &NodeId, f64) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_reward_created: Option<RewardCreatedCallback>,
    on_reward_propagated: Option<RewardPropagatedCallback>,
    on_tolerance_exceeded: Option<ToleranceExceededCallback>,
}

struct IncentiveState {
    rewards: HashMap<String, TaskReward>,
    /// task_id -> reward_id, the idempotence index; rebuilt on load.
    by_task: HashMap<String, String>,
    propagations: HashMap<String, PropagationRecord>,
    tolerance: ToleranceBook,
}

/// Primary records persisted to disk; indices are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct IncentiveSnapshot {
    saved_at: u64,
    rewards: Vec<TaskReward>,
    propagations: Vec<PropagationRecord>,
    tolerances: Vec<ToleranceRecord>,
}

/// Outcome of receiving a propagation from an upstream node.
#[derive(Debug)]
pub struct ReceiveReport {
    /// The hop credited to this node.
    pub credited: PropagationRecord,
    /// Hops forwarded onward to local neighbors.
    pub forwarded: Vec<PropagationRecord>,
    /// Neighbors skipped with the gate each tripped.
    pub refused: Vec<(NodeId, IncentiveError)>,
}

/// Thread-safe reward engine for one node identity.
///
/// State transitions happen under the engine lock; snapshot writes and
/// callback dispatch happen after it is released.
pub struct IncentiveEngine {
    config: IncentiveConfig,
    local: NodeId,
    reputation: Arc<dyn ReputationStore>,
    neighbors: Arc<dyn NeighborProvider>,
    time: Arc<dyn TimeProvider>,
    state: RwLock<IncentiveState>,
    callbacks: RwLock<Callbacks>,
    snapshot_path: Option<PathBuf>,
}

impl IncentiveEngine {
    pub fn new(
        config: IncentiveConfig,
        local: NodeId,
        reputation: Arc<dyn ReputationStore>,
        neighbors: Arc<dyn NeighborProvider>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let tolerance = ToleranceBook::new(
            config.default_tolerance,
            config.tolerance_reset_period_secs,
        );
        Self {
            config,
            local,
            reputation,
            neighbors,
            time,
            state: RwLock::new(IncentiveState {
                rewards: HashMap::new(),
                by_task: HashMap::new(),
                propagations: HashMap::new(),
                tolerance,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            snapshot_path: None,
        }
    }

    /// Enables persistence at `path`, loading any previous snapshot.
    pub fn with_snapshot_path(mut self, path: PathBuf) -> Result<Self, CommonError> {
        if let Some(snapshot) = read_json_if_exists::<IncentiveSnapshot>(&path)? {
            let mut state = self.state.write().expect("incentive state lock poisoned");
            state.by_task = snapshot
                .rewards
                .iter()
                .map(|r| (r.task_id.clone(), r.reward_id.clone()))
                .collect();
            state.rewards = snapshot
                .rewards
                .into_iter()
                .map(|r| (r.reward_id.clone(), r))
                .collect();
            state.propagations = snapshot
                .propagations
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect();
            state.tolerance = ToleranceBook::from_records(
                snapshot.tolerances,
                self.config.default_tolerance,
                self.config.tolerance_reset_period_secs,
            );
            log::info!(
                "incentive engine restored {} rewards, {} propagations",
                state.rewards.len(),
                state.propagations.len()
            );
        }
        self.snapshot_path = Some(path);
        Ok(self)
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn set_on_reward_created<F: Fn(&TaskReward) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("incentive callbacks lock poisoned")
            .on_reward_created = Some(Box::new(f));
    }

    pub fn set_on_reward_propagated<F: Fn(&PropagationRecord) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("incentive callbacks lock poisoned")
            .on_reward_propagated = Some(Box::new(f));
    }

    pub fn set_on_tolerance_exceeded<F: Fn(&NodeId, &NodeId, f64) + Send + Sync + 'static>(
        &self,
        f: F,
    ) {
        self.callbacks
            .write()
            .expect("incentive callbacks lock poisoned")
            .on_tolerance_exceeded = Some(Box::new(f));
    }

    /// Creates and credits a reward for a completed task.
    ///
    /// Rejects unverifiable sources and duplicate `task_id`s; the base score
    /// is clamped into the task type's band before the multiplier applies.
    pub fn award(
        &self,
        node: &NodeId,
        task_id: &str,
        task_type: &str,
        base_score: f64,
        source: RewardSource,
        description: &str,
    ) -> Result<TaskReward, IncentiveError> {
        if task_id.is_empty() {
            return Err(IncentiveError::Validation("empty task id".into()));
        }
        if !base_score.is_finite() || base_score < 0.0 {
            return Err(IncentiveError::Validation(format!(
                "base score {base_score} out of range"
            )));
        }
        if !source.is_verifiable() {
            return Err(IncentiveError::UnverifiableSource(source));
        }

        let weight = self.config.weight_for(task_type);
        let final_score = weight.shape(base_score);
        let now = self.time.unix_seconds();
        let mut reward = TaskReward {
            reward_id: uuid::Uuid::new_v4().to_string(),
            node_id: *node,
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            source_kind: source,
            base_score,
            task_weight: weight,
            final_score,
            ts: now,
            status: RewardStatus::Pending,
            description: description.to_string(),
            propagated_to: Vec::new(),
        };

        {
            let mut state = self.state.write().expect("incentive state lock poisoned");
            if state.by_task.contains_key(task_id) {
                return Err(IncentiveError::DuplicateReward {
                    task_id: task_id.to_string(),
                });
            }
            state
                .by_task
                .insert(task_id.to_string(), reward.reward_id.clone());
            state.rewards.insert(reward.reward_id.clone(), reward.clone());
        }

        // Credit outside the lock; a failed credit leaves the reward Pending
        // for a later retry.
        match self.reputation.apply_gain(node, final_score) {
            Ok(new_score) => {
                reward.status = RewardStatus::Confirmed;
                self.reputation.touch(node, now);
                let mut state = self.state.write().expect("incentive state lock poisoned");
                if let Some(stored) = state.rewards.get_mut(&reward.reward_id) {
                    stored.status = RewardStatus::Confirmed;
                }
                drop(state);
                log::debug!(
                    "reward {} confirmed for {node}: +{final_score:.3} -> {new_score:.3}",
                    reward.reward_id
                );
            }
            Err(e) => {
                log::warn!("reward {} left pending: {e}", reward.reward_id);
            }
        }

        metrics::REWARDS_CREATED.inc();
        let callbacks = self.callbacks.read().expect("incentive callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_reward_created {
            cb(&reward);
        }
        drop(callbacks);
        self.request_save();
        Ok(reward)
    }

    /// Fans a confirmed reward out to the origin's neighbors at depth 1.
    pub fn propagate(&self, reward_id: &str) -> Result<Vec<PropagationRecord>, IncentiveError> {
        let (origin, score) = {
            let state = self.state.read().expect("incentive state lock poisoned");
            let reward = state
                .rewards
                .get(reward_id)
                .ok_or_else(|| IncentiveError::UnknownReward(reward_id.to_string()))?;
            if reward.status != RewardStatus::Confirmed {
                return Err(IncentiveError::NotConfirmed(reward_id.to_string()));
            }
            (reward.node_id, reward.final_score)
        };

        let mut accepted = Vec::new();
        for neighbor in self.neighbors.neighbors(&origin) {
            if neighbor == origin {
                continue;
            }
            match self.propagate_to_node(&origin, &neighbor, score, 1, reward_id) {
                Ok(record) => accepted.push(record),
                Err(e) => {
                    log::debug!("propagation {reward_id} -> {neighbor} refused: {e}");
                }
            }
        }

        if !accepted.is_empty() {
            let mut state = self.state.write().expect("incentive state lock poisoned");
            if let Some(reward) = state.rewards.get_mut(reward_id) {
                for record in &accepted {
                    if !reward.propagated_to.contains(&record.target) {
                        reward.propagated_to.push(record.target);
                    }
                }
            }
        }
        self.request_save();
        Ok(accepted)
    }

    /// The recursion primitive: one hop of decayed credit from `src` to
    /// `tgt`. Refusals never mutate state.
    pub fn propagate_to_node(
        &self,
        src: &NodeId,
        tgt: &NodeId,
        score: f64,
        depth: u32,
        origin_reward_id: &str,
    ) -> Result<PropagationRecord, IncentiveError> {
        if tgt == src {
            metrics::PROPAGATIONS_REFUSED.inc();
            return Err(IncentiveError::SelfPropagation);
        }
        if depth > self.config.max_propagation_depth {
            metrics::PROPAGATIONS_REFUSED.inc();
            return Err(IncentiveError::DepthExceeded {
                depth,
                max: self.config.max_propagation_depth,
            });
        }
        let propagated = score * self.config.default_decay_factor;
        if propagated < self.config.min_propagation_score {
            metrics::PROPAGATIONS_REFUSED.inc();
            return Err(IncentiveError::BelowThreshold {
                score: propagated,
                min: self.config.min_propagation_score,
            });
        }

        let now = self.time.unix_seconds();
        let record = {
            let mut state = self.state.write().expect("incentive state lock poisoned");
            match state.tolerance.charge(tgt, src, propagated, now) {
                ChargeOutcome::Exceeded {
                    requested,
                    remaining,
                } => {
                    drop(state);
                    metrics::PROPAGATIONS_REFUSED.inc();
                    let callbacks =
                        self.callbacks.read().expect("incentive callbacks lock poisoned");
                    if let Some(cb) = &callbacks.on_tolerance_exceeded {
                        cb(src, tgt, requested);
                    }
                    return Err(IncentiveError::ToleranceExceeded {
                        src: *src,
                        target: *tgt,
                        requested,
                        remaining,
                    });
                }
                ChargeOutcome::Accepted { .. } => {
                    let record = PropagationRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        source: *src,
                        target: *tgt,
                        original_score: score,
                        decay_factor: self.config.default_decay_factor,
                        propagated_score: propagated,
                        depth,
                        ts: now,
                        origin_reward_id: origin_reward_id.to_string(),
                    };
                    state.propagations.insert(record.id.clone(), record.clone());
                    record
                }
            }
        };

        if let Err(e) = self.reputation.apply_gain(tgt, propagated) {
            log::warn!("propagation credit to {tgt} failed: {e}");
        }
        metrics::PROPAGATIONS_ACCEPTED.inc();
        let callbacks = self.callbacks.read().expect("incentive callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_reward_propagated {
            cb(&record);
        }
        drop(callbacks);
        Ok(record)
    }

    /// Handles a propagation arriving from `upstream`: credits this node,
    /// then independently forwards one hop deeper to every local neighbor
    /// except the upstream, the origin, and itself.
    pub fn receive_propagation(
        &self,
        upstream: &NodeId,
        msg: &RewardPropagationMsg,
    ) -> Result<ReceiveReport, IncentiveError> {
        let credited =
            self.propagate_to_node(upstream, &self.local, msg.score, msg.depth, &msg.reward_id)?;

        let mut forwarded = Vec::new();
        let mut refused = Vec::new();
        for neighbor in self.neighbors.neighbors(&self.local) {
            if neighbor == *upstream || neighbor == self.local || neighbor == msg.origin {
                continue;
            }
            match self.propagate_to_node(
                &self.local,
                &neighbor,
                credited.propagated_score,
                msg.depth + 1,
                &msg.reward_id,
            ) {
                Ok(record) => forwarded.push(record),
                Err(e) => refused.push((neighbor, e)),
            }
        }
        self.request_save();
        Ok(ReceiveReport {
            credited,
            forwarded,
            refused,
        })
    }

    pub fn reward(&self, reward_id: &str) -> Option<TaskReward> {
        self.state
            .read()
            .expect("incentive state lock poisoned")
            .rewards
            .get(reward_id)
            .cloned()
    }

    pub fn reward_for_task(&self, task_id: &str) -> Option<TaskReward> {
        let state = self.state.read().expect("incentive state lock poisoned");
        let reward_id = state.by_task.get(task_id)?;
        state.rewards.get(reward_id).cloned()
    }

    pub fn rewards_for_node(&self, node: &NodeId) -> Vec<TaskReward> {
        self.state
            .read()
            .expect("incentive state lock poisoned")
            .rewards
            .values()
            .filter(|r| r.node_id == *node)
            .cloned()
            .collect()
    }

    pub fn propagations_for_reward(&self, reward_id: &str) -> Vec<PropagationRecord> {
        self.state
            .read()
            .expect("incentive state lock poisoned")
            .propagations
            .values()
            .filter(|p| p.origin_reward_id == reward_id)
            .cloned()
            .collect()
    }

    pub fn tolerance(&self, target: &NodeId, source: &NodeId) -> Option<ToleranceRecord> {
        self.state
            .read()
            .expect("incentive state lock poisoned")
            .tolerance
            .get(target, source)
            .cloned()
    }

    /// Administrative cap override for one (target, source) pair.
    pub fn set_tolerance_max(&self, target: &NodeId, source: &NodeId, new_max: f64) {
        let now = self.time.unix_seconds();
        self.state
            .write()
            .expect("incentive state lock poisoned")
            .tolerance
            .set_max(target, source, new_max, now);
    }

    /// Administrative immediate refill of one (target, source) pair.
    pub fn reset_tolerance(&self, target: &NodeId, source: &NodeId) {
        let now = self.time.unix_seconds();
        self.state
            .write()
            .expect("incentive state lock poisoned")
            .tolerance
            .reset(target, source, now);
    }

    /// Refills every tolerance bucket whose reset time has passed.
    pub fn run_tolerance_reset(&self) -> usize {
        let now = self.time.unix_seconds();
        let refilled = self
            .state
            .write()
            .expect("incentive state lock poisoned")
            .tolerance
            .reset_due(now);
        if refilled > 0 {
            log::debug!("incentive tolerance sweep refilled {refilled} buckets");
            self.request_save();
        }
        refilled
    }

    /// Serializes primary records and commits them atomically.
    pub fn save(&self) -> Result<(), CommonError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = {
            let state = self.state.read().expect("incentive state lock poisoned");
            IncentiveSnapshot {
                saved_at: self.time.unix_seconds(),
                rewards: state.rewards.values().cloned().collect(),
                propagations: state.propagations.values().cloned().collect(),
                tolerances: state.tolerance.clone().into_records(),
            }
        };
        write_json_atomic(path, &snapshot)
    }

    fn request_save(&self) {
        if let Err(e) = self.save() {
            log::warn!("incentive snapshot save failed, will retry on next save: {e}");
        }
    }

    /// Spawns the hourly tolerance-reset sweep; stops when `shutdown` turns
    /// true.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let engine = Arc::clone(self);
        let sweep_interval =
            std::time::Duration::from_secs(self.config.tolerance_sweep_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.run_tolerance_reset();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        vec![handle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agn_common::{FixedTimeProvider, StaticNeighborProvider};
    use agn_reputation::InMemoryReputationStore;

    fn engine() -> (Arc<IncentiveEngine>, Arc<InMemoryReputationStore>, NodeId) {
        let local = NodeId::from_public_key_bytes(b"local");
        let reputation = Arc::new(InMemoryReputationStore::new());
        let neighbors = Arc::new(StaticNeighborProvider::new());
        let time = Arc::new(FixedTimeProvider::from_seconds(1_000));
        let engine = Arc::new(IncentiveEngine::new(
            IncentiveConfig::default(),
            local,
            reputation.clone(),
            neighbors,
            time,
        ));
        (engine, reputation, local)
    }

    #[test]
    fn award_confirms_and_credits() {
        let (engine, reputation, local) = engine();
        let reward = engine
            .award(
                &local,
                "task-1",
                "compute",
                10.0,
                RewardSource::TaskCompletion,
                "unit test",
            )
            .unwrap();
        assert_eq!(reward.status, RewardStatus::Confirmed);
        assert_eq!(reward.final_score, 10.0);
        assert!(reputation.get_score(&local) > 10.0);
    }

    #[test]
    fn duplicate_task_refused() {
        let (engine, _, local) = engine();
        engine
            .award(&local, "task-1", "compute", 10.0, RewardSource::TaskCompletion, "")
            .unwrap();
        let second = engine.award(
            &local,
            "task-1",
            "compute",
            10.0,
            RewardSource::TaskCompletion,
            "",
        );
        assert!(matches!(
            second,
            Err(IncentiveError::DuplicateReward { .. })
        ));
        assert_eq!(engine.rewards_for_node(&local).len(), 1);
    }

    #[test]
    fn unverifiable_sources_refused() {
        let (engine, _, local) = engine();
        for source in [RewardSource::PeerRating, RewardSource::DirectTransfer] {
            let result = engine.award(&local, "t", "compute", 10.0, source, "");
            assert!(matches!(
                result,
                Err(IncentiveError::UnverifiableSource(_))
            ));
        }
    }

    #[test]
    fn propagation_requires_confirmed_reward() {
        let (engine, _, _) = engine();
        assert!(matches!(
            engine.propagate("no-such"),
            Err(IncentiveError::UnknownReward(_))
        ));
    }

    #[test]
    fn callbacks_fire_on_award() {
        let (engine, _, local) = engine();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = seen.clone();
        engine.set_on_reward_created(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        engine
            .award(&local, "t", "compute", 5.0, RewardSource::AuditPass, "")
            .unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
