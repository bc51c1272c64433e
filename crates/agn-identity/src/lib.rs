#![doc = include_str!("../README.md")]

//! # AGN Identity Crate
//! This crate manages the signing identities of AGN nodes: ed25519 keypairs,
//! the binding between a verifying key and its [`NodeId`], and the sign/verify
//! services consumed by the signed-message layer and the engines.

use agn_common::{CommonError, NodeId};
use ed25519_dalek::{Signature, Signer, Verifier};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Generates a fresh ed25519 keypair from the OS entropy source.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand_core::OsRng;
    let sk = SigningKey::generate(&mut csprng);
    let vk = sk.verifying_key();
    (sk, vk)
}

/// Derives the stable node identifier bound to a verifying key.
pub fn node_id_from_verifying_key(vk: &VerifyingKey) -> NodeId {
    NodeId::from_public_key_bytes(vk.as_bytes())
}

/// Parses a verifying key from its raw 32-byte encoding.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CommonError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CommonError::InvalidInput("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CommonError::InvalidInput(format!("invalid public key: {e}")))
}

/// Detached ed25519 signature, hex-encoded on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureBytes(pub Vec<u8>);

impl SignatureBytes {
    pub fn to_signature(&self) -> Result<Signature, CommonError> {
        let bytes: [u8; 64] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CommonError::SignatureError("signature must be 64 bytes".into()))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(&self.0))
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        Ok(SignatureBytes(bytes))
    }
}

/// Signs `bytes` with the node's secret key.
pub fn sign_bytes(sk: &SigningKey, bytes: &[u8]) -> SignatureBytes {
    SignatureBytes(sk.sign(bytes).to_bytes().to_vec())
}

/// Verifies a detached signature over `bytes`.
pub fn verify_bytes(
    vk: &VerifyingKey,
    bytes: &[u8],
    signature: &SignatureBytes,
) -> Result<(), CommonError> {
    let sig = signature.to_signature()?;
    vk.verify(bytes, &sig)
        .map_err(|e| CommonError::SignatureError(format!("verification failed: {e}")))
}
