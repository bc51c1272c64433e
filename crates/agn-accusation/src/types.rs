//! Accusation records, analyses, and the status machine.

use agn_common::{CommonError, NodeId, Signable};
use agn_identity::SignatureBytes;
use serde::{Deserialize, Serialize};

/// One-way status machine:
/// `Pending -> Delivered -> {Verified | Rejected}`, with `Archived`
/// reachable from any state on TTL expiry. There is no un-archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccusationStatus {
    Pending,
    Delivered,
    Verified,
    Rejected,
    Archived,
}

impl AccusationStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            AccusationStatus::Verified | AccusationStatus::Rejected | AccusationStatus::Archived
        )
    }
}

/// A signed, propagatable, decayable claim that a node misbehaved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accusation {
    pub accusation_id: String,
    pub accuser: NodeId,
    #[serde(with = "hex::serde")]
    pub accuser_public_key: Vec<u8>,
    pub accused: NodeId,
    pub kind: String,
    pub reason: String,
    pub evidence: Vec<String>,
    pub ts: u64,
    pub expires_at: u64,
    pub signature: SignatureBytes,
    pub status: AccusationStatus,
    /// Accuser's reputation at creation, on the kernel 0-1000 band.
    pub accuser_reputation: f64,
    pub base_penalty: f64,
    pub accuser_cost: f64,
    /// Hops travelled so far; incremented by every receiver.
    pub propagation_depth: u32,
    pub propagated_to: Vec<NodeId>,
}

impl Signable for Accusation {
    fn to_signable_bytes(&self) -> Result<Vec<u8>, CommonError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.accusation_id.as_bytes());
        bytes.push(b'\0');
        bytes.extend_from_slice(self.accuser.as_bytes());
        bytes.extend_from_slice(self.accused.as_bytes());
        bytes.extend_from_slice(self.kind.as_bytes());
        bytes.push(b'\0');
        bytes.extend_from_slice(self.reason.as_bytes());
        bytes.push(b'\0');
        for item in &self.evidence {
            bytes.extend_from_slice(item.as_bytes());
            bytes.push(b'\0');
        }
        bytes.extend_from_slice(&self.ts.to_le_bytes());
        bytes.extend_from_slice(&self.expires_at.to_le_bytes());
        bytes.extend_from_slice(&self.base_penalty.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.accuser_cost.to_bits().to_le_bytes());
        Ok(bytes)
    }
}

/// Per-verifier record attached to an accusation, signed so downstream
/// nodes can audit the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccusationAnalysis {
    pub accusation_id: String,
    pub analyzer: NodeId,
    pub ts: u64,
    pub penalty_to_accused: f64,
    pub cost_to_accuser: f64,
    pub accepted: bool,
    pub reason: String,
    pub signature: SignatureBytes,
}

impl Signable for AccusationAnalysis {
    fn to_signable_bytes(&self) -> Result<Vec<u8>, CommonError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.accusation_id.as_bytes());
        bytes.push(b'\0');
        bytes.extend_from_slice(self.analyzer.as_bytes());
        bytes.extend_from_slice(&self.ts.to_le_bytes());
        bytes.extend_from_slice(&self.penalty_to_accused.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.cost_to_accuser.to_bits().to_le_bytes());
        bytes.push(self.accepted as u8);
        bytes.extend_from_slice(self.reason.as_bytes());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signable_bytes_distinguish_evidence_splits() {
        let base = Accusation {
            accusation_id: "a1".into(),
            accuser: NodeId::from_public_key_bytes(b"accuser"),
            accuser_public_key: vec![0u8; 32],
            accused: NodeId::from_public_key_bytes(b"accused"),
            kind: "spam".into(),
            reason: "flooding".into(),
            evidence: vec!["ab".into(), "c".into()],
            ts: 1,
            expires_at: 2,
            signature: SignatureBytes(Vec::new()),
            status: AccusationStatus::Pending,
            accuser_reputation: 100.0,
            base_penalty: 10.0,
            accuser_cost: 2.0,
            propagation_depth: 0,
            propagated_to: Vec::new(),
        };
        let mut other = base.clone();
        other.evidence = vec!["a".into(), "bc".into()];
        assert_ne!(
            base.to_signable_bytes().unwrap(),
            other.to_signable_bytes().unwrap()
        );
    }

    #[test]
    fn final_states_are_final() {
        assert!(!AccusationStatus::Pending.is_final());
        assert!(!AccusationStatus::Delivered.is_final());
        assert!(AccusationStatus::Verified.is_final());
        assert!(AccusationStatus::Rejected.is_final());
        assert!(AccusationStatus::Archived.is_final());
    }
}
