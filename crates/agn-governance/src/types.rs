//! Proposals, votes, and the node trust registry entries.

use agn_common::{CommonError, NodeId, Signable};
use agn_identity::SignatureBytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Suspended,
    Removed,
    Pending,
}

/// The voting engine's view of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTrust {
    pub node_id: NodeId,
    pub reputation: f64,
    pub stake: f64,
    pub status: NodeStatus,
    pub joined_at: u64,
    pub last_active: u64,
    pub vote_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Kick,
    Restore,
    Promote,
    Demote,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Passed,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

/// One weighted, signed ballot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub proposal_id: String,
    pub voter: NodeId,
    #[serde(with = "hex::serde")]
    pub voter_public_key: Vec<u8>,
    pub choice: VoteChoice,
    pub weight: f64,
    pub ts: u64,
    pub reason: String,
    pub signature: SignatureBytes,
}

impl Signable for Vote {
    fn to_signable_bytes(&self) -> Result<Vec<u8>, CommonError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.push(b'\0');
        bytes.extend_from_slice(self.proposal_id.as_bytes());
        bytes.push(b'\0');
        bytes.extend_from_slice(self.voter.as_bytes());
        bytes.push(match self.choice {
            VoteChoice::Yes => 1,
            VoteChoice::No => 2,
            VoteChoice::Abstain => 3,
        });
        bytes.extend_from_slice(&self.weight.to_bits().to_le_bytes());
        bytes.extend_from_slice(&self.ts.to_le_bytes());
        bytes.extend_from_slice(self.reason.as_bytes());
        Ok(bytes)
    }
}

/// Weight totals at the moment of finalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyResult {
    pub yes_weight: f64,
    pub no_weight: f64,
    pub abstain_weight: f64,
    pub total_weight: f64,
    pub total_possible_weight: f64,
    pub quorum: f64,
    pub yes_ratio: f64,
}

/// A governance proposal with its recorded ballots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub kind: ProposalKind,
    pub target: NodeId,
    pub proposer: NodeId,
    pub reason: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub votes: HashMap<NodeId, Vote>,
    pub status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TallyResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_signable_bytes_cover_choice() {
        let vote = Vote {
            id: "v1".into(),
            proposal_id: "p1".into(),
            voter: NodeId::from_public_key_bytes(b"voter"),
            voter_public_key: vec![0u8; 32],
            choice: VoteChoice::Yes,
            weight: 44.0,
            ts: 1,
            reason: String::new(),
            signature: SignatureBytes(Vec::new()),
        };
        let mut flipped = vote.clone();
        flipped.choice = VoteChoice::No;
        assert_ne!(
            vote.to_signable_bytes().unwrap(),
            flipped.to_signable_bytes().unwrap()
        );
    }
}
