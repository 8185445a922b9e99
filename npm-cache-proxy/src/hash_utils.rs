//! Digests for cache addressing and subresource-integrity verification

use base64::{engine::general_purpose, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Calculate SHA256 hash of data as lowercase hex.
///
/// ```
/// # use npm_cache_proxy::hash_utils::sha256_hash;
/// assert_eq!(sha256_hash(b"hello world").len(), 64);
/// ```
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash algorithms accepted in `dist.integrity`, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Algorithm::Sha1),
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

/// One `<algorithm>-<base64>` entry of an integrity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: Algorithm,
    pub digest: String,
}

impl Integrity {
    /// Pick the strongest supported hash from a space-separated SRI string.
    pub fn parse(sri: &str) -> Option<Self> {
        sri.split_whitespace()
            .filter_map(|item| {
                let (algorithm, rest) = item.split_once('-')?;
                let algorithm = Algorithm::parse(algorithm)?;
                // options after '?' are not part of the digest
                let digest = rest.split('?').next().unwrap_or(rest);
                Some(Integrity {
                    algorithm,
                    digest: digest.to_string(),
                })
            })
            .max_by_key(|i| i.algorithm)
    }
}

impl std::fmt::Display for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), self.digest)
    }
}

/// Incremental hasher for a single algorithm.
#[derive(Clone)]
pub enum IntegrityHasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl IntegrityHasher {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha1 => IntegrityHasher::Sha1(Sha1::new()),
            Algorithm::Sha256 => IntegrityHasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => IntegrityHasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            IntegrityHasher::Sha1(h) => h.update(chunk),
            IntegrityHasher::Sha256(h) => h.update(chunk),
            IntegrityHasher::Sha512(h) => h.update(chunk),
        }
    }

    pub fn finish(self) -> Integrity {
        let (algorithm, raw) = match self {
            IntegrityHasher::Sha1(h) => (Algorithm::Sha1, h.finalize().to_vec()),
            IntegrityHasher::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
            IntegrityHasher::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
        };
        Integrity {
            algorithm,
            digest: general_purpose::STANDARD.encode(raw),
        }
    }
}
