//! Per-(target, source) token buckets with periodic full refill.
//!
//! Used identically by the incentive engine (capping inbound reputation
//! credit from one origin) and by the accusation engine (capping inbound
//! penalty attributable to one accuser): single-source flooding is
//! neutralized symmetrically whether it is praise or blame.

use crate::metrics;
use agn_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One directed (target <- source) cap. Invariant:
/// `total_received + remaining == max_tolerance` within float noise, and
/// `remaining >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceRecord {
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub total_received: f64,
    pub max_tolerance: f64,
    pub remaining: f64,
    pub last_reset: u64,
    pub next_reset: u64,
}

/// Result of charging a bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Accepted { remaining: f64 },
    Exceeded { requested: f64, remaining: f64 },
}

impl ChargeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ChargeOutcome::Accepted { .. })
    }
}

/// The bucket book. Not internally synchronized; each engine embeds one
/// behind its own state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceBook {
    default_max: f64,
    reset_period_secs: u64,
    records: HashMap<String, ToleranceRecord>,
}

fn pair_key(target: &NodeId, source: &NodeId) -> String {
    format!("{target}:{source}")
}

impl ToleranceBook {
    pub fn new(default_max: f64, reset_period_secs: u64) -> Self {
        Self {
            default_max,
            reset_period_secs,
            records: HashMap::new(),
        }
    }

    fn entry(&mut self, target: &NodeId, source: &NodeId, now: u64) -> &mut ToleranceRecord {
        let key = pair_key(target, source);
        let default_max = self.default_max;
        let period = self.reset_period_secs;
        self.records.entry(key).or_insert_with(|| ToleranceRecord {
            source_node: *source,
            target_node: *target,
            total_received: 0.0,
            max_tolerance: default_max,
            remaining: default_max,
            last_reset: now,
            next_reset: now + period,
        })
    }

    /// Charges `amount` against the (target, source) bucket. A refused
    /// charge does not decrement anything. A bucket past its reset time is
    /// refilled before the charge is evaluated.
    pub fn charge(
        &mut self,
        target: &NodeId,
        source: &NodeId,
        amount: f64,
        now: u64,
    ) -> ChargeOutcome {
        let period = self.reset_period_secs;
        let record = self.entry(target, source, now);
        if now >= record.next_reset {
            refill(record, now, period);
        }
        if record.remaining >= amount {
            record.remaining -= amount;
            record.total_received += amount;
            ChargeOutcome::Accepted {
                remaining: record.remaining,
            }
        } else {
            metrics::TOLERANCE_EXCEEDED.inc();
            ChargeOutcome::Exceeded {
                requested: amount,
                remaining: record.remaining,
            }
        }
    }

    /// Refills every bucket whose reset time has passed; returns how many
    /// were refilled. Invoked by the scheduler sweep.
    pub fn reset_due(&mut self, now: u64) -> usize {
        let period = self.reset_period_secs;
        let mut refilled = 0;
        for record in self.records.values_mut() {
            if now >= record.next_reset {
                refill(record, now, period);
                refilled += 1;
            }
        }
        refilled
    }

    /// Administrative: raises or lowers the cap for one pair. Remaining
    /// budget is adjusted by the same delta, floored at zero.
    pub fn set_max(&mut self, target: &NodeId, source: &NodeId, new_max: f64, now: u64) {
        let record = self.entry(target, source, now);
        let delta = new_max - record.max_tolerance;
        record.max_tolerance = new_max;
        record.remaining = (record.remaining + delta).max(0.0);
        record.total_received = record.max_tolerance - record.remaining;
    }

    /// Administrative: immediate refill of one pair.
    pub fn reset(&mut self, target: &NodeId, source: &NodeId, now: u64) {
        let period = self.reset_period_secs;
        let record = self.entry(target, source, now);
        refill(record, now, period);
    }

    pub fn get(&self, target: &NodeId, source: &NodeId) -> Option<&ToleranceRecord> {
        self.records.get(&pair_key(target, source))
    }

    pub fn records(&self) -> impl Iterator<Item = &ToleranceRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rebuilds a book from snapshot records.
    pub fn from_records(
        records: Vec<ToleranceRecord>,
        default_max: f64,
        reset_period_secs: u64,
    ) -> Self {
        let mut book = Self::new(default_max, reset_period_secs);
        for record in records {
            let key = pair_key(&record.target_node, &record.source_node);
            book.records.insert(key, record);
        }
        book
    }

    pub fn into_records(self) -> Vec<ToleranceRecord> {
        self.records.into_values().collect()
    }
}

fn refill(record: &mut ToleranceRecord, now: u64, period: u64) {
    record.remaining = record.max_tolerance;
    record.total_received = 0.0;
    record.last_reset = now;
    record.next_reset = now + period;
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-3;

    fn nodes() -> (NodeId, NodeId) {
        (
            NodeId::from_public_key_bytes(b"target"),
            NodeId::from_public_key_bytes(b"source"),
        )
    }

    #[test]
    fn charge_until_exceeded() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(30.0, 3600);
        assert_eq!(
            book.charge(&target, &source, 12.0, 0),
            ChargeOutcome::Accepted { remaining: 18.0 }
        );
        assert_eq!(
            book.charge(&target, &source, 12.0, 1),
            ChargeOutcome::Accepted { remaining: 6.0 }
        );
        let third = book.charge(&target, &source, 12.0, 2);
        assert_eq!(
            third,
            ChargeOutcome::Exceeded {
                requested: 12.0,
                remaining: 6.0
            }
        );
        let record = book.get(&target, &source).unwrap();
        assert!((record.total_received - 24.0).abs() < EPS);
    }

    #[test]
    fn conservation_holds_under_arbitrary_charges() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(100.0, 3600);
        let amounts = [3.7, 12.25, 0.003, 41.9, 55.0, 7.77, 100.0];
        for (i, amount) in amounts.iter().enumerate() {
            book.charge(&target, &source, *amount, i as u64);
            let record = book.get(&target, &source).unwrap();
            let sum = record.total_received + record.remaining;
            assert!(
                (sum - record.max_tolerance).abs() / record.max_tolerance < EPS,
                "conservation broken: {sum} vs {}",
                record.max_tolerance
            );
            assert!(record.remaining >= 0.0);
        }
    }

    #[test]
    fn reset_due_refills_expired_buckets() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(50.0, 100);
        book.charge(&target, &source, 50.0, 0);
        assert!(!book.charge(&target, &source, 1.0, 10).is_accepted());
        assert_eq!(book.reset_due(50), 0);
        assert_eq!(book.reset_due(100), 1);
        assert!(book.charge(&target, &source, 50.0, 101).is_accepted());
    }

    #[test]
    fn lazy_refill_on_charge() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(50.0, 100);
        book.charge(&target, &source, 50.0, 0);
        // No sweep ran, but the period elapsed before this charge.
        assert!(book.charge(&target, &source, 10.0, 200).is_accepted());
    }

    #[test]
    fn set_max_keeps_conservation() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(30.0, 3600);
        book.charge(&target, &source, 20.0, 0);
        book.set_max(&target, &source, 60.0, 1);
        let record = book.get(&target, &source).unwrap();
        assert!((record.remaining - 40.0).abs() < EPS);
        assert!(
            (record.total_received + record.remaining - record.max_tolerance).abs() < EPS
        );
    }

    #[test]
    fn separate_pairs_do_not_interfere() {
        let (target, source) = nodes();
        let other = NodeId::from_public_key_bytes(b"other");
        let mut book = ToleranceBook::new(10.0, 3600);
        book.charge(&target, &source, 10.0, 0);
        assert!(book.charge(&target, &other, 10.0, 0).is_accepted());
        assert!(!book.charge(&target, &source, 1.0, 0).is_accepted());
    }

    #[test]
    fn snapshot_records_round_trip() {
        let (target, source) = nodes();
        let mut book = ToleranceBook::new(30.0, 3600);
        book.charge(&target, &source, 12.0, 5);
        let records = book.clone().into_records();
        let restored = ToleranceBook::from_records(records, 30.0, 3600);
        let record = restored.get(&target, &source).unwrap();
        assert!((record.remaining - 18.0).abs() < EPS);
        assert_eq!(record.last_reset, 5);
    }
}
