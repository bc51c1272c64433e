//! Envelope construction and the domain-separated signing digest.

use agn_common::{CommonError, NodeId, TimeProvider};
use agn_identity::{sign_bytes, SignatureBytes, SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Domain tag mixed into every nonce-bearing envelope digest.
pub const ENVELOPE_DOMAIN: &[u8] = b"agn.envelope.v1";

/// Closed set of payload schemas an envelope can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskReward,
    RewardPropagation,
    Accusation,
    AccusationAnalysis,
    Proposal,
    Vote,
    Heartbeat,
}

impl MessageKind {
    /// Stable tag fed into the signing digest; never reorder or rename.
    pub fn as_tag(&self) -> &'static str {
        match self {
            MessageKind::TaskReward => "task_reward",
            MessageKind::RewardPropagation => "reward_propagation",
            MessageKind::Accusation => "accusation",
            MessageKind::AccusationAnalysis => "accusation_analysis",
            MessageKind::Proposal => "proposal",
            MessageKind::Vote => "vote",
            MessageKind::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Outer, signed, replay-protected wrapper for every gossiped event.
///
/// All binary fields are lowercase hex on the wire. Envelopes produced by
/// this crate always carry a nonce; nonce-less envelopes are accepted only
/// for backward compatibility and use the legacy digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Content-derived digest, 32 hex chars.
    pub message_id: String,
    pub kind: MessageKind,
    pub sender: NodeId,
    #[serde(with = "hex::serde")]
    pub sender_public_key: Vec<u8>,
    pub timestamp_ms: u64,
    /// 128-bit random value, 32 hex chars. Absent on legacy envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub signature: SignatureBytes,
}

impl SignedEnvelope {
    /// Digest the signature covers: `H(domain || payload || kind || ts ||
    /// nonce || sender)`, or the pre-nonce legacy form without domain tag
    /// when no nonce is present.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match &self.nonce {
            Some(nonce) => {
                hasher.update(ENVELOPE_DOMAIN);
                hasher.update(&self.payload);
                hasher.update(self.kind.as_tag().as_bytes());
                hasher.update(self.timestamp_ms.to_be_bytes());
                hasher.update(nonce.as_bytes());
                hasher.update(self.sender.as_bytes());
            }
            None => {
                hasher.update(&self.payload);
                hasher.update(self.kind.as_tag().as_bytes());
                hasher.update(self.timestamp_ms.to_be_bytes());
                hasher.update(self.sender.as_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// Recomputes the content-derived message id.
    pub fn compute_message_id(
        sender: &NodeId,
        timestamp_ms: u64,
        nonce: Option<&str>,
        payload: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(timestamp_ms.to_be_bytes());
        if let Some(nonce) = nonce {
            hasher.update(nonce.as_bytes());
        }
        hasher.update(payload);
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    /// Deserializes the payload into its typed schema.
    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, CommonError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            CommonError::DeserializationError(format!(
                "payload of {} envelope {}: {e}",
                self.kind, self.message_id
            ))
        })
    }
}

/// Produces envelopes under one node identity.
pub struct EnvelopeSigner {
    signing_key: SigningKey,
    public_key: Vec<u8>,
    node_id: NodeId,
    time: Arc<dyn TimeProvider>,
}

impl EnvelopeSigner {
    pub fn new(signing_key: SigningKey, time: Arc<dyn TimeProvider>) -> Self {
        let vk: VerifyingKey = signing_key.verifying_key();
        let node_id = agn_identity::node_id_from_verifying_key(&vk);
        Self {
            signing_key,
            public_key: vk.as_bytes().to_vec(),
            node_id,
            time,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Wraps raw payload bytes into a fresh, signed envelope.
    pub fn sign(&self, kind: MessageKind, payload: Vec<u8>) -> SignedEnvelope {
        let timestamp_ms = self.time.unix_millis();
        let mut nonce_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let message_id = SignedEnvelope::compute_message_id(
            &self.node_id,
            timestamp_ms,
            Some(&nonce),
            &payload,
        );
        let mut envelope = SignedEnvelope {
            message_id,
            kind,
            sender: self.node_id,
            sender_public_key: self.public_key.clone(),
            timestamp_ms,
            nonce: Some(nonce),
            payload,
            signature: SignatureBytes(Vec::new()),
        };
        envelope.signature = sign_bytes(&self.signing_key, &envelope.signing_digest());
        envelope
    }

    /// Serializes a typed payload and wraps it.
    pub fn sign_payload<P: Serialize>(
        &self,
        kind: MessageKind,
        payload: &P,
    ) -> Result<SignedEnvelope, CommonError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| CommonError::SerializationError(format!("{kind} payload: {e}")))?;
        Ok(self.sign(kind, bytes))
    }
}
