#![doc = include_str!("../README.md")]

//! # AGN Protocol Crate
//! This crate defines the wire form of every gossipable event in the AGN
//! reputation fabric: the [`SignedEnvelope`] wrapper, its domain-separated
//! digest, and the replay-protected [`EnvelopeVerifier`].

pub mod envelope;
pub mod metrics;
pub mod verifier;

pub use envelope::{EnvelopeSigner, MessageKind, SignedEnvelope, ENVELOPE_DOMAIN};
pub use verifier::{EnvelopeError, EnvelopeVerifier, MAX_FUTURE_SKEW_MS};
