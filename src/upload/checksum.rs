//! SHA-256 helpers for chunk and artifact verification

use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data as lowercase hex
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify hash matches data
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash)
}

/// A well-formed digest is 64 hex characters
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lowercase a client-supplied digest so stored values compare byte-for-byte
pub fn normalize_digest(digest: &str) -> String {
    digest.trim().to_ascii_lowercase()
}

/// Running SHA-256 over a sequence of byte ranges
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hash a stream of byte ranges without holding more than one range at a time
pub async fn digest_stream<S, B, E>(mut stream: S) -> Result<(String, u64), E>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut digest = StreamingDigest::new();
    while let Some(part) = stream.next().await {
        digest.update(part?.as_ref());
    }
    let bytes = digest.bytes();
    Ok((digest.finalize(), bytes))
}
