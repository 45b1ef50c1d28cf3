use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Incremental SHA-256 check of a file while it is being streamed to disk.
pub struct ChecksumVerifier {
    hasher: Sha256,
    expected: String,
}

impl ChecksumVerifier {
    /// Returns a verifier when `expected` looks like a hex SHA-256, `None` otherwise.
    pub fn for_expected(expected: &str) -> Option<Self> {
        let expected = expected.trim().to_ascii_lowercase();
        if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self { hasher: Sha256::new(), expected })
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> Result<(), IntegrityError> {
        let actual = format!("{:x}", self.hasher.finalize());
        if actual == self.expected {
            Ok(())
        } else {
            Err(IntegrityError::Mismatch { expected: self.expected, actual })
        }
    }
}
