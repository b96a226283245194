//! Cryptographic operations for Checkflow.
//!
//! - `hash`: SHA-256 content hashing for state snapshot integrity

pub mod hash;
