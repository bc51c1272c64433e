#![doc = include_str!("../README.md")]

//! # AGN Common Crate
//! This crate provides common data structures, types, utilities, and error
//! definitions shared across multiple AGN core crates. It aims to reduce code
//! duplication, ensure consistency, and simplify dependencies.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

pub mod fsutil;

pub const AGN_CORE_VERSION: &str = "0.2.0";

/// Number of bytes in a [`NodeId`]; 32 hex characters on the wire.
pub const NODE_ID_LEN: usize = 16;

/// Errors shared across the AGN core crates.
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("signature error: {0}")]
    SignatureError(String),
    #[error("operation cancelled: {0}")]
    CancelledError(String),
}

/// Opaque stable identifier of a network node.
///
/// Derived as the first [`NODE_ID_LEN`] bytes of the SHA-256 digest of the
/// node's public key. Equality is by byte content; the wire and display form
/// is 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derives the identifier from raw public-key bytes.
    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes.copy_from_slice(&digest[..NODE_ID_LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| CommonError::InvalidInput(format!("invalid node id {s:?}: {e}")))?;
        let bytes: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| {
            CommonError::InvalidInput(format!("node id must be {NODE_ID_LEN} bytes, got {s:?}"))
        })?;
        Ok(Self(bytes))
    }
}

// Serialized as a hex string so NodeId can key JSON maps.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_str(&s).map_err(D::Error::custom)
    }
}

/// Types that expose a canonical byte encoding for signing.
///
/// Implementations must include every semantically relevant field, separated
/// unambiguously, so that two distinct values never produce the same bytes.
pub trait Signable {
    fn to_signable_bytes(&self) -> Result<Vec<u8>, CommonError>;
}

/// Source of the current time, injectable for deterministic tests.
pub trait TimeProvider: Send + Sync {
    fn unix_seconds(&self) -> u64;

    fn unix_millis(&self) -> u64 {
        self.unix_seconds() * 1000
    }
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn unix_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Deterministic [`TimeProvider`] whose clock only moves when told to.
#[derive(Debug, Default)]
pub struct FixedTimeProvider {
    millis: AtomicU64,
}

impl FixedTimeProvider {
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            millis: AtomicU64::new(seconds * 1000),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set_seconds(&self, seconds: u64) {
        self.millis.store(seconds * 1000, Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, seconds: u64) {
        self.millis.fetch_add(seconds * 1000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeProvider for FixedTimeProvider {
    fn unix_seconds(&self) -> u64 {
        self.millis.load(Ordering::SeqCst) / 1000
    }

    fn unix_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Supplies the neighbor set of a node.
///
/// Neighbor computation itself lives outside the core; the propagating engines
/// only consume this view.
pub trait NeighborProvider: Send + Sync {
    fn neighbors(&self, node: &NodeId) -> Vec<NodeId>;
}

/// In-memory [`NeighborProvider`] for wiring and tests.
#[derive(Debug, Default)]
pub struct StaticNeighborProvider {
    links: RwLock<HashMap<NodeId, Vec<NodeId>>>,
}

impl StaticNeighborProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_neighbors(&self, node: NodeId, neighbors: Vec<NodeId>) {
        self.links
            .write()
            .expect("neighbor map lock poisoned")
            .insert(node, neighbors);
    }

    pub fn add_link(&self, from: NodeId, to: NodeId) {
        let mut links = self.links.write().expect("neighbor map lock poisoned");
        let entry = links.entry(from).or_default();
        if !entry.contains(&to) {
            entry.push(to);
        }
    }
}

impl NeighborProvider for StaticNeighborProvider {
    fn neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        self.links
            .read()
            .expect("neighbor map lock poisoned")
            .get(node)
            .cloned()
            .unwrap_or_default()
    }
}
