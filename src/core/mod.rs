// Core types and primitives shared across the coordinator

pub mod vector_clock;

use chrono::Utc;
use sha2::{Digest, Sha256};

/// Node identifier, unique across the coordinator's lifetime
pub type NodeId = String;

/// File identifier
pub type FileId = String;

/// Version identifier (UUID string)
pub type VersionId = String;

/// Current wall-clock time in milliseconds since the epoch
pub fn current_time_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hex-encoded SHA-256 of the given bytes. Chunk and content identity
/// everywhere in the coordinator is this digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex(b"chunk"), sha256_hex(b"chunk"));
        assert_ne!(sha256_hex(b"chunk"), sha256_hex(b"chunk2"));
    }
}
