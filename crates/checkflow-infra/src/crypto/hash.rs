//! SHA-256 content hashing for state snapshot integrity.
//!
//! Uses the `sha2` crate (RustCrypto ecosystem).

use sha2::{Digest, Sha256};

/// Computes lowercase hex-encoded SHA-256 digests.
///
/// Snapshot files store the digest of their serialized state and are
/// rejected on load when it no longer matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_hash(&self, content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        format!("{:x}", digest)
    }

    /// Whether `content` hashes to `expected` (case-insensitive hex).
    pub fn verify(&self, content: &str, expected: &str) -> bool {
        self.compute_hash(content).eq_ignore_ascii_case(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash_known_value() {
        let hasher = Sha256ContentHasher::new();
        // SHA-256 of empty string
        assert_eq!(
            hasher.compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_hash_is_lowercase_hex() {
        let hash = Sha256ContentHasher::new().compute_hash("{\"status\":\"idle\"}");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let hasher = Sha256ContentHasher::new();
        let hash = hasher.compute_hash("{\"currentStepIndex\":1}");
        assert!(hasher.verify("{\"currentStepIndex\":1}", &hash));
        assert!(hasher.verify("{\"currentStepIndex\":1}", &hash.to_uppercase()));
        assert!(!hasher.verify("{\"currentStepIndex\":2}", &hash));
    }
}
