//! Digest collaborator used for checksum-based resync and online verify.

use std::fmt::Debug;
use std::sync::Arc;

use sha2::{Digest as _, Sha256};

/// Hash function over a sequence of byte ranges.
pub trait Digest: Send + Sync + Debug {
    /// Algorithm name as negotiated with the peer.
    fn name(&self) -> &'static str;

    /// Output length in bytes.
    fn size(&self) -> usize;

    /// Hash the concatenation of `chunks`.
    fn compute(&self, chunks: &[&[u8]]) -> Vec<u8>;
}

/// SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn size(&self) -> usize {
        32
    }

    fn compute(&self, chunks: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        hasher.finalize().to_vec()
    }
}

/// BLAKE3 (256-bit output).
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Digest;

impl Digest for Blake3Digest {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn size(&self) -> usize {
        blake3::OUT_LEN
    }

    fn compute(&self, chunks: &[&[u8]]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

/// Look up a digest implementation by its negotiated name.
pub fn digest_by_name(name: &str) -> Option<Arc<dyn Digest>> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" => Some(Arc::new(Sha256Digest)),
        "blake3" => Some(Arc::new(Blake3Digest)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let d = Sha256Digest.compute(&[b"abc"]);
        assert_eq!(d.len(), 32);
        assert_eq!(d[0], 0xba);
        assert_eq!(d[31], 0xad);
    }

    #[test]
    fn test_chunks_equal_concatenation() {
        for digest in [digest_by_name("sha256"), digest_by_name("blake3")] {
            let digest = digest.unwrap();
            let whole = digest.compute(&[b"hello world"]);
            let split = digest.compute(&[b"hello", b" ", b"world"]);
            assert_eq!(whole, split);
            assert_eq!(whole.len(), digest.size());
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(digest_by_name("SHA256").unwrap().name(), "sha256");
        assert_eq!(digest_by_name("blake3").unwrap().name(), "blake3");
        assert!(digest_by_name("md5").is_none());
    }
}
