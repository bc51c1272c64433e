//! The accusation engine: accuse, propagate, receive, analyze.

use crate::types::{Accusation, AccusationAnalysis, AccusationStatus};
use crate::{metrics, reputation_factor, AccusationConfig, AccusationError};
use agn_common::fsutil::{read_json_if_exists, write_json_atomic};
use agn_common::{CommonError, NeighborProvider, NodeId, Signable, TimeProvider};
use agn_identity::{sign_bytes, verify_bytes, verifying_key_from_bytes, SignatureBytes, SigningKey};
use agn_reputation::{ChargeOutcome, DecayEvent, ReputationStore, ToleranceBook, ToleranceRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

type AccusationCallback = Box<dyn Fn(&Accusation) + Send + Sync>;
type AnalysisCallback = Box<dyn Fn(&Accusation, &AccusationAnalysis) + Send + Sync>;
type ToleranceExceededCallback = Box<dyn Fn(&NodeId, f64) + Send + Sync>;
type NaturalDecayCallback = Box<dyn Fn(&DecayEvent) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_accusation_created: Option<AccusationCallback>,
    on_accusation_received: Option<AccusationCallback>,
    on_accusation_verified: Option<AnalysisCallback>,
    on_accusation_rejected: Option<AnalysisCallback>,
    on_tolerance_exceeded: Option<ToleranceExceededCallback>,
    on_natural_decay: Option<NaturalDecayCallback>,
}

struct AccusationState {
    accusations: HashMap<String, Accusation>,
    by_accuser: HashMap<NodeId, Vec<String>>,
    by_accused: HashMap<NodeId, Vec<String>>,
    analyses: HashMap<String, Vec<AccusationAnalysis>>,
    tolerance: ToleranceBook,
}

impl AccusationState {
    fn index(&mut self, accusation: &Accusation) {
        self.by_accuser
            .entry(accusation.accuser)
            .or_default()
            .push(accusation.accusation_id.clone());
        self.by_accused
            .entry(accusation.accused)
            .or_default()
            .push(accusation.accusation_id.clone());
    }

    fn unindex(&mut self, accusation: &Accusation) {
        if let Some(ids) = self.by_accuser.get_mut(&accusation.accuser) {
            ids.retain(|id| id != &accusation.accusation_id);
        }
        if let Some(ids) = self.by_accused.get_mut(&accusation.accused) {
            ids.retain(|id| id != &accusation.accusation_id);
        }
    }
}

/// Primary records persisted to disk; by-accuser and by-accused indices are
/// rebuilt on load.
#[derive(Serialize, Deserialize)]
struct AccusationSnapshot {
    saved_at: u64,
    accusations: Vec<Accusation>,
    analyses: Vec<AccusationAnalysis>,
    tolerances: Vec<ToleranceRecord>,
}

/// Thread-safe accusation engine for one node identity.
pub struct AccusationEngine {
    config: AccusationConfig,
    local: NodeId,
    signing_key: SigningKey,
    reputation: Arc<dyn ReputationStore>,
    neighbors: Arc<dyn NeighborProvider>,
    time: Arc<dyn TimeProvider>,
    state: RwLock<AccusationState>,
    callbacks: RwLock<Callbacks>,
    snapshot_path: Option<PathBuf>,
}

impl AccusationEngine {
    pub fn new(
        config: AccusationConfig,
        signing_key: SigningKey,
        reputation: Arc<dyn ReputationStore>,
        neighbors: Arc<dyn NeighborProvider>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let local = agn_identity::node_id_from_verifying_key(&signing_key.verifying_key());
        let tolerance = ToleranceBook::new(
            config.default_tolerance,
            config.tolerance_reset_period_secs,
        );
        Self {
            config,
            local,
            signing_key,
            reputation,
            neighbors,
            time,
            state: RwLock::new(AccusationState {
                accusations: HashMap::new(),
                by_accuser: HashMap::new(),
                by_accused: HashMap::new(),
                analyses: HashMap::new(),
                tolerance,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            snapshot_path: None,
        }
    }

    /// Enables persistence at `path`, loading any previous snapshot.
    pub fn with_snapshot_path(mut self, path: PathBuf) -> Result<Self, CommonError> {
        if let Some(snapshot) = read_json_if_exists::<AccusationSnapshot>(&path)? {
            let mut state = self.state.write().expect("accusation state lock poisoned");
            for accusation in &snapshot.accusations {
                state.index(accusation);
            }
            state.accusations = snapshot
                .accusations
                .into_iter()
                .map(|a| (a.accusation_id.clone(), a))
                .collect();
            let mut analyses: HashMap<String, Vec<AccusationAnalysis>> = HashMap::new();
            for analysis in snapshot.analyses {
                analyses
                    .entry(analysis.accusation_id.clone())
                    .or_default()
                    .push(analysis);
            }
            state.analyses = analyses;
            state.tolerance = ToleranceBook::from_records(
                snapshot.tolerances,
                self.config.default_tolerance,
                self.config.tolerance_reset_period_secs,
            );
            log::info!(
                "accusation engine restored {} accusations",
                state.accusations.len()
            );
        }
        self.snapshot_path = Some(path);
        Ok(self)
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn set_on_accusation_created<F: Fn(&Accusation) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_accusation_created = Some(Box::new(f));
    }

    pub fn set_on_accusation_received<F: Fn(&Accusation) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_accusation_received = Some(Box::new(f));
    }

    pub fn set_on_accusation_verified<
        F: Fn(&Accusation, &AccusationAnalysis) + Send + Sync + 'static,
    >(
        &self,
        f: F,
    ) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_accusation_verified = Some(Box::new(f));
    }

    pub fn set_on_accusation_rejected<
        F: Fn(&Accusation, &AccusationAnalysis) + Send + Sync + 'static,
    >(
        &self,
        f: F,
    ) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_accusation_rejected = Some(Box::new(f));
    }

    pub fn set_on_tolerance_exceeded<F: Fn(&NodeId, f64) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_tolerance_exceeded = Some(Box::new(f));
    }

    pub fn set_on_natural_decay<F: Fn(&DecayEvent) + Send + Sync + 'static>(&self, f: F) {
        self.callbacks
            .write()
            .expect("accusation callbacks lock poisoned")
            .on_natural_decay = Some(Box::new(f));
    }

    /// Issues a signed accusation and debits the accuser's own reputation
    /// by the cost up front.
    pub fn accuse(
        &self,
        accused: &NodeId,
        kind: &str,
        reason: &str,
        evidence: Vec<String>,
    ) -> Result<Accusation, AccusationError> {
        if *accused == self.local {
            return Err(AccusationError::SelfAccusation);
        }
        if kind.is_empty() {
            return Err(AccusationError::Validation("empty accusation kind".into()));
        }
        let score = self.reputation.get_score(&self.local);
        if score < self.config.min_accuser_reputation {
            return Err(AccusationError::InsufficientReputation {
                required: self.config.min_accuser_reputation,
                actual: score,
            });
        }

        let factor = reputation_factor(score);
        let base_penalty = self.config.base_penalty * factor;
        let accuser_cost = self.config.base_accuser_cost / factor;
        let now = self.time.unix_seconds();
        let mut accusation = Accusation {
            accusation_id: uuid::Uuid::new_v4().to_string(),
            accuser: self.local,
            accuser_public_key: self.signing_key.verifying_key().as_bytes().to_vec(),
            accused: *accused,
            kind: kind.to_string(),
            reason: reason.to_string(),
            evidence,
            ts: now,
            expires_at: now + self.config.default_expiry_secs,
            signature: SignatureBytes(Vec::new()),
            status: AccusationStatus::Pending,
            accuser_reputation: score,
            base_penalty,
            accuser_cost,
            propagation_depth: 0,
            propagated_to: Vec::new(),
        };
        accusation.signature = sign_bytes(&self.signing_key, &accusation.to_signable_bytes()?);

        {
            let mut state = self.state.write().expect("accusation state lock poisoned");
            state
                .accusations
                .insert(accusation.accusation_id.clone(), accusation.clone());
            state.index(&accusation);
        }

        if let Err(e) = self.reputation.apply_loss(&self.local, accuser_cost) {
            log::warn!("accuser cost debit failed: {e}");
        }
        metrics::ACCUSATIONS_CREATED.inc();
        log::debug!(
            "accusation {} against {accused}: penalty {base_penalty:.3}, cost {accuser_cost:.3}",
            accusation.accusation_id
        );
        let callbacks = self.callbacks.read().expect("accusation callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_accusation_created {
            cb(&accusation);
        }
        drop(callbacks);
        self.request_save();
        Ok(accusation)
    }

    /// Plans the fan-out of a pending accusation to local neighbors,
    /// skipping the accuser and this node. The status moves to Delivered
    /// only when at least one neighbor accepted the plan.
    pub fn propagate(&self, accusation_id: &str) -> Result<Vec<NodeId>, AccusationError> {
        let now = self.time.unix_seconds();
        let targets = {
            let state = self.state.read().expect("accusation state lock poisoned");
            let accusation = state
                .accusations
                .get(accusation_id)
                .ok_or_else(|| AccusationError::UnknownAccusation(accusation_id.to_string()))?;
            if accusation.status.is_final() {
                return Err(AccusationError::AlreadyFinalized(accusation_id.to_string()));
            }
            if now >= accusation.expires_at {
                return Err(AccusationError::Expired(accusation_id.to_string()));
            }
            if accusation.propagation_depth >= self.config.max_propagation_depth {
                return Err(AccusationError::DepthExceeded {
                    depth: accusation.propagation_depth,
                    max: self.config.max_propagation_depth,
                });
            }
            let accuser = accusation.accuser;
            self.neighbors
                .neighbors(&self.local)
                .into_iter()
                .filter(|n| *n != accuser && *n != self.local)
                .filter(|n| !accusation.propagated_to.contains(n))
                .collect::<Vec<_>>()
        };

        if !targets.is_empty() {
            let mut state = self.state.write().expect("accusation state lock poisoned");
            if let Some(accusation) = state.accusations.get_mut(accusation_id) {
                accusation.propagated_to.extend(targets.iter().copied());
                if accusation.status == AccusationStatus::Pending {
                    accusation.status = AccusationStatus::Delivered;
                }
            }
            drop(state);
            self.request_save();
        }
        Ok(targets)
    }

    /// Accepts a signed accusation arriving from an upstream peer.
    pub fn receive(&self, mut accusation: Accusation) -> Result<Accusation, AccusationError> {
        let now = self.time.unix_seconds();
        if now >= accusation.expires_at {
            return Err(AccusationError::Expired(accusation.accusation_id));
        }
        if accusation.accusation_id.is_empty() {
            return Err(AccusationError::Validation("empty accusation id".into()));
        }
        if accusation.accuser == accusation.accused {
            return Err(AccusationError::Validation(
                "accuser and accused are the same node".into(),
            ));
        }
        {
            let state = self.state.read().expect("accusation state lock poisoned");
            if state.accusations.contains_key(&accusation.accusation_id) {
                return Err(AccusationError::Duplicate(accusation.accusation_id));
            }
        }

        let expected = NodeId::from_public_key_bytes(&accusation.accuser_public_key);
        if expected != accusation.accuser {
            return Err(AccusationError::BindingMismatch);
        }
        let vk = verifying_key_from_bytes(&accusation.accuser_public_key)
            .map_err(|e| AccusationError::InvalidSignature(e.to_string()))?;
        verify_bytes(&vk, &accusation.to_signable_bytes()?, &accusation.signature)
            .map_err(|e| AccusationError::InvalidSignature(e.to_string()))?;

        {
            let mut state = self.state.write().expect("accusation state lock poisoned");
            match state.tolerance.charge(
                &self.local,
                &accusation.accuser,
                accusation.base_penalty,
                now,
            ) {
                ChargeOutcome::Exceeded {
                    requested,
                    remaining,
                } => {
                    drop(state);
                    let callbacks =
                        self.callbacks.read().expect("accusation callbacks lock poisoned");
                    if let Some(cb) = &callbacks.on_tolerance_exceeded {
                        cb(&accusation.accuser, requested);
                    }
                    return Err(AccusationError::ToleranceExceeded {
                        accuser: accusation.accuser,
                        requested,
                        remaining,
                    });
                }
                ChargeOutcome::Accepted { .. } => {
                    accusation.propagation_depth += 1;
                    accusation.status = AccusationStatus::Pending;
                    accusation.propagated_to.clear();
                    state
                        .accusations
                        .insert(accusation.accusation_id.clone(), accusation.clone());
                    state.index(&accusation);
                }
            }
        }

        metrics::ACCUSATIONS_RECEIVED.inc();
        let callbacks = self.callbacks.read().expect("accusation callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_accusation_received {
            cb(&accusation);
        }
        drop(callbacks);
        self.request_save();
        Ok(accusation)
    }

    /// Records the local verdict: the penalty decayed by the hops travelled
    /// lands on the accused when accepted.
    pub fn analyze(
        &self,
        accusation_id: &str,
        accepted: bool,
        reason: &str,
    ) -> Result<AccusationAnalysis, AccusationError> {
        let now = self.time.unix_seconds();
        let (accusation, analysis) = {
            let mut guard = self.state.write().expect("accusation state lock poisoned");
            let state = &mut *guard;
            let accusation = state
                .accusations
                .get_mut(accusation_id)
                .ok_or_else(|| AccusationError::UnknownAccusation(accusation_id.to_string()))?;
            if accusation.status.is_final() {
                return Err(AccusationError::AlreadyFinalized(accusation_id.to_string()));
            }
            if now >= accusation.expires_at {
                accusation.status = AccusationStatus::Archived;
                return Err(AccusationError::Expired(accusation_id.to_string()));
            }

            let decayed = accusation.base_penalty
                * self
                    .config
                    .decay_factor
                    .powi(accusation.propagation_depth as i32);
            let mut analysis = AccusationAnalysis {
                accusation_id: accusation_id.to_string(),
                analyzer: self.local,
                ts: now,
                penalty_to_accused: if accepted { decayed } else { 0.0 },
                cost_to_accuser: accusation.accuser_cost,
                accepted,
                reason: reason.to_string(),
                signature: SignatureBytes(Vec::new()),
            };
            analysis.signature = sign_bytes(&self.signing_key, &analysis.to_signable_bytes()?);

            accusation.status = if accepted {
                AccusationStatus::Verified
            } else {
                AccusationStatus::Rejected
            };
            let accusation = accusation.clone();
            state
                .analyses
                .entry(accusation_id.to_string())
                .or_default()
                .push(analysis.clone());
            (accusation, analysis)
        };

        if accepted {
            if let Err(e) = self
                .reputation
                .apply_loss(&accusation.accused, analysis.penalty_to_accused)
            {
                log::warn!("penalty application to {} failed: {e}", accusation.accused);
            }
            metrics::ACCUSATIONS_VERIFIED.inc();
        } else {
            metrics::ACCUSATIONS_REJECTED.inc();
        }

        let callbacks = self.callbacks.read().expect("accusation callbacks lock poisoned");
        let cb = if accepted {
            &callbacks.on_accusation_verified
        } else {
            &callbacks.on_accusation_rejected
        };
        if let Some(cb) = cb {
            cb(&accusation, &analysis);
        }
        drop(callbacks);
        self.request_save();
        Ok(analysis)
    }

    /// Records an analysis produced by a remote verifier. The caller is
    /// responsible for having authenticated the analyzer (the signed
    /// envelope layer does); duplicates per (accusation, analyzer) are
    /// refused.
    pub fn record_analysis(&self, analysis: AccusationAnalysis) -> Result<(), AccusationError> {
        let mut guard = self.state.write().expect("accusation state lock poisoned");
        let state = &mut *guard;
        if !state.accusations.contains_key(&analysis.accusation_id) {
            return Err(AccusationError::UnknownAccusation(
                analysis.accusation_id.clone(),
            ));
        }
        let entries = state
            .analyses
            .entry(analysis.accusation_id.clone())
            .or_default();
        if entries.iter().any(|a| a.analyzer == analysis.analyzer) {
            return Err(AccusationError::Duplicate(analysis.accusation_id));
        }
        entries.push(analysis);
        drop(guard);
        self.request_save();
        Ok(())
    }

    pub fn accusation(&self, accusation_id: &str) -> Option<Accusation> {
        self.state
            .read()
            .expect("accusation state lock poisoned")
            .accusations
            .get(accusation_id)
            .cloned()
    }

    pub fn accusations_by_accuser(&self, accuser: &NodeId) -> Vec<Accusation> {
        let state = self.state.read().expect("accusation state lock poisoned");
        state
            .by_accuser
            .get(accuser)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.accusations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn accusations_by_accused(&self, accused: &NodeId) -> Vec<Accusation> {
        let state = self.state.read().expect("accusation state lock poisoned");
        state
            .by_accused
            .get(accused)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.accusations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn analyses(&self, accusation_id: &str) -> Vec<AccusationAnalysis> {
        self.state
            .read()
            .expect("accusation state lock poisoned")
            .analyses
            .get(accusation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tolerance(&self, accuser: &NodeId) -> Option<ToleranceRecord> {
        self.state
            .read()
            .expect("accusation state lock poisoned")
            .tolerance
            .get(&self.local, accuser)
            .cloned()
    }

    /// Administrative cap override for penalties from one accuser.
    pub fn set_tolerance_max(&self, accuser: &NodeId, new_max: f64) {
        let now = self.time.unix_seconds();
        self.state
            .write()
            .expect("accusation state lock poisoned")
            .tolerance
            .set_max(&self.local, accuser, new_max, now);
    }

    /// Administrative immediate refill for one accuser's bucket.
    pub fn reset_tolerance(&self, accuser: &NodeId) {
        let now = self.time.unix_seconds();
        self.state
            .write()
            .expect("accusation state lock poisoned")
            .tolerance
            .reset(&self.local, accuser, now);
    }

    /// Refills every tolerance bucket whose reset time has passed.
    pub fn run_tolerance_reset(&self) -> usize {
        let now = self.time.unix_seconds();
        let refilled = self
            .state
            .write()
            .expect("accusation state lock poisoned")
            .tolerance
            .reset_due(now);
        if refilled > 0 {
            self.request_save();
        }
        refilled
    }

    /// Archives expired accusations from any non-final state and deletes
    /// archived ones past the retention period. Returns (archived, deleted).
    pub fn run_cleanup(&self) -> (usize, usize) {
        let now = self.time.unix_seconds();
        let retention = self.config.archived_retention_secs;
        let (archived, deleted) = {
            let mut state = self.state.write().expect("accusation state lock poisoned");
            let mut archived = 0;
            for accusation in state.accusations.values_mut() {
                if accusation.status != AccusationStatus::Archived && now >= accusation.expires_at
                {
                    accusation.status = AccusationStatus::Archived;
                    archived += 1;
                }
            }
            let stale: Vec<Accusation> = state
                .accusations
                .values()
                .filter(|a| {
                    a.status == AccusationStatus::Archived
                        && now.saturating_sub(a.expires_at) > retention
                })
                .cloned()
                .collect();
            for accusation in &stale {
                state.accusations.remove(&accusation.accusation_id);
                state.analyses.remove(&accusation.accusation_id);
                state.unindex(accusation);
            }
            (archived, stale.len())
        };
        if archived > 0 || deleted > 0 {
            log::debug!("accusation cleanup archived {archived}, deleted {deleted}");
            self.request_save();
        }
        (archived, deleted)
    }

    /// Applies kernel natural decay to every inactive node in the local
    /// view.
    pub fn run_natural_decay(&self) -> usize {
        let now = self.time.unix_seconds();
        let events = self.reputation.decay_inactive(now);
        if events.is_empty() {
            return 0;
        }
        let callbacks = self.callbacks.read().expect("accusation callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_natural_decay {
            for event in &events {
                cb(event);
            }
        }
        events.len()
    }

    /// Serializes primary records and commits them atomically.
    pub fn save(&self) -> Result<(), CommonError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = {
            let state = self.state.read().expect("accusation state lock poisoned");
            AccusationSnapshot {
                saved_at: self.time.unix_seconds(),
                accusations: state.accusations.values().cloned().collect(),
                analyses: state.analyses.values().flatten().cloned().collect(),
                tolerances: state.tolerance.clone().into_records(),
            }
        };
        write_json_atomic(path, &snapshot)
    }

    fn request_save(&self) {
        if let Err(e) = self.save() {
            log::warn!("accusation snapshot save failed, will retry on next save: {e}");
        }
    }

    /// Spawns the tolerance sweep, TTL cleanup, and natural-decay tick.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        let mut rx = shutdown.clone();
        let interval =
            std::time::Duration::from_secs(self.config.tolerance_sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.run_tolerance_reset(); }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() { break; }
                    }
                }
            }
        }));

        let engine = Arc::clone(self);
        let mut rx = shutdown.clone();
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

        let engine = Arc::clone(self);
        let mut rx = shutdown;
        let interval = std::time::Duration::from_secs(self.config.natural_decay_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { engine.run_natural_decay(); }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() { break; }
                    }
                }
            }
        }));

        handles
    }
}
