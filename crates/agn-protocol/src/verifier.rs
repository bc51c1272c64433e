//! Replay-protected envelope verification.

use crate::envelope::SignedEnvelope;
use crate::metrics;
use agn_common::{NodeId, TimeProvider};
use agn_identity::{verify_bytes, verifying_key_from_bytes};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// How far into the future a timestamp may lie before rejection.
pub const MAX_FUTURE_SKEW_MS: u64 = 60_000;

/// Reasons an envelope fails verification. Rejections are dropped from the
/// gossip path and never propagated further.
#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope expired: age {age_ms}ms exceeds window {max_age_ms}ms")]
    Expired { age_ms: u64, max_age_ms: u64 },
    #[error("envelope timestamp {skew_ms}ms in the future")]
    FutureTimestamp { skew_ms: u64 },
    #[error("replayed message id")]
    Replay,
    #[error("replayed (sender, nonce) pair")]
    NonceReplay,
    #[error("nonce required in strict mode")]
    MissingNonce,
    #[error("sender does not match public key binding")]
    SenderKeyMismatch,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature")]
    InvalidSignature,
}

#[derive(Default)]
struct ReplayCaches {
    /// message_id -> envelope timestamp, evicted once older than max_age.
    by_id: HashMap<String, u64>,
    /// (sender, nonce) -> envelope timestamp.
    by_nonce: HashMap<(NodeId, String), u64>,
}

/// Verifies envelopes against freshness, replay, key binding, and signature.
///
/// One verifier instance owns its replay caches; every peer-facing ingress
/// path of a node should share the same instance.
pub struct EnvelopeVerifier {
    max_age_ms: u64,
    strict: bool,
    time: Arc<dyn TimeProvider>,
    caches: Mutex<ReplayCaches>,
}

impl EnvelopeVerifier {
    pub fn new(max_age_ms: u64, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            max_age_ms,
            strict: false,
            time,
            caches: Mutex::new(ReplayCaches::default()),
        }
    }

    /// Strict verifiers refuse legacy nonce-less envelopes.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verifies a single envelope, returning the authenticated sender.
    ///
    /// Checks run in a fixed order: freshness, replay by message id, replay
    /// by (sender, nonce), public-key binding, signature. Replay state is
    /// only recorded once every other check has passed, so an invalid
    /// envelope cannot poison the cache for a later valid one.
    pub fn verify(&self, envelope: &SignedEnvelope) -> Result<NodeId, EnvelopeError> {
        let result = self.verify_inner(envelope);
        match &result {
            Ok(_) => {
                metrics::ENVELOPES_ACCEPTED.inc();
            }
            Err(EnvelopeError::Replay) | Err(EnvelopeError::NonceReplay) => {
                metrics::REPLAYS_BLOCKED.inc();
                metrics::ENVELOPES_REJECTED.inc();
            }
            Err(_) => {
                metrics::ENVELOPES_REJECTED.inc();
            }
        };
        result
    }

    fn verify_inner(&self, envelope: &SignedEnvelope) -> Result<NodeId, EnvelopeError> {
        let now = self.time.unix_millis();
        if envelope.timestamp_ms > now {
            let skew_ms = envelope.timestamp_ms - now;
            if skew_ms > MAX_FUTURE_SKEW_MS {
                return Err(EnvelopeError::FutureTimestamp { skew_ms });
            }
        } else {
            let age_ms = now - envelope.timestamp_ms;
            if age_ms > self.max_age_ms {
                return Err(EnvelopeError::Expired {
                    age_ms,
                    max_age_ms: self.max_age_ms,
                });
            }
        }

        if self.strict && envelope.nonce.is_none() {
            return Err(EnvelopeError::MissingNonce);
        }

        self.check_replay(envelope)?;

        let expected = NodeId::from_public_key_bytes(&envelope.sender_public_key);
        if expected != envelope.sender {
            return Err(EnvelopeError::SenderKeyMismatch);
        }
        let vk = verifying_key_from_bytes(&envelope.sender_public_key)
            .map_err(|e| EnvelopeError::InvalidPublicKey(e.to_string()))?;
        verify_bytes(&vk, &envelope.signing_digest(), &envelope.signature)
            .map_err(|_| EnvelopeError::InvalidSignature)?;

        // Re-check and record atomically: in a batch, two copies of the same
        // valid envelope both reach this point, and only the first may win.
        self.record_replay(envelope)?;
        Ok(envelope.sender)
    }

    fn check_replay(&self, envelope: &SignedEnvelope) -> Result<(), EnvelopeError> {
        let caches = self.caches.lock().expect("replay cache lock poisoned");
        if caches.by_id.contains_key(&envelope.message_id) {
            return Err(EnvelopeError::Replay);
        }
        if let Some(nonce) = &envelope.nonce {
            if caches
                .by_nonce
                .contains_key(&(envelope.sender, nonce.clone()))
            {
                return Err(EnvelopeError::NonceReplay);
            }
        }
        Ok(())
    }

    fn record_replay(&self, envelope: &SignedEnvelope) -> Result<(), EnvelopeError> {
        let mut caches = self.caches.lock().expect("replay cache lock poisoned");
        if caches.by_id.contains_key(&envelope.message_id) {
            return Err(EnvelopeError::Replay);
        }
        if let Some(nonce) = &envelope.nonce {
            let key = (envelope.sender, nonce.clone());
            if caches.by_nonce.contains_key(&key) {
                return Err(EnvelopeError::NonceReplay);
            }
            caches.by_nonce.insert(key, envelope.timestamp_ms);
        }
        caches
            .by_id
            .insert(envelope.message_id.clone(), envelope.timestamp_ms);
        Ok(())
    }

    /// Verifies a batch on `workers` threads; results come back in input
    /// order, and duplicates inside one batch reject all but the first.
    pub fn verify_batch(
        &self,
        envelopes: &[SignedEnvelope],
        workers: usize,
    ) -> Vec<Result<NodeId, EnvelopeError>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build();
        match pool {
            Ok(pool) => {
                pool.install(|| envelopes.par_iter().map(|e| self.verify(e)).collect())
            }
            Err(e) => {
                log::warn!("batch verify falling back to sequential: {e}");
                envelopes.iter().map(|e| self.verify(e)).collect()
            }
        }
    }

    /// Evicts replay entries older than the freshness window; returns how
    /// many were dropped. A replayed envelope older than the window is
    /// already rejected by the freshness check, so eviction never reopens a
    /// replay hole.
    pub fn sweep(&self) -> usize {
        let cutoff = self.time.unix_millis().saturating_sub(self.max_age_ms);
        let mut caches = self.caches.lock().expect("replay cache lock poisoned");
        let before = caches.by_id.len() + caches.by_nonce.len();
        caches.by_id.retain(|_, ts| *ts >= cutoff);
        caches.by_nonce.retain(|_, ts| *ts >= cutoff);
        let evicted = before - (caches.by_id.len() + caches.by_nonce.len());
        if evicted > 0 {
            log::debug!("replay cache sweep evicted {evicted} entries");
        }
        evicted
    }

    /// Current number of tracked message ids, for stats surfaces.
    pub fn cache_len(&self) -> usize {
        self.caches.lock().expect("replay cache lock poisoned").by_id.len()
    }
}
