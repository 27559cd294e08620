//! Content digest parsing, computation, and verification.
//!
//! Digests are `<algorithm>:<hex>` strings. Everything content-addressed
//! in a pull (manifests, config, layers) is checked through this module.

use sha2::{Digest as _, Sha256, Sha512};
use wharf_core::error::{PullError, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Look up an algorithm by its registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    /// Registry name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Fixed hex-encoded output length.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

/// A parsed, validated content digest.
///
/// The hex component is normalized to lowercase, so equality between two
/// parsed digests is case-insensitive with respect to the input strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse a `<algorithm>:<hex>` digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (name, hex) = s.split_once(':').ok_or_else(|| PullError::MalformedDigest {
            digest: s.to_string(),
            message: "expected <algorithm>:<hex>".to_string(),
        })?;

        let algorithm = Algorithm::from_name(name).ok_or_else(|| PullError::MalformedDigest {
            digest: s.to_string(),
            message: format!("unknown algorithm '{}'", name),
        })?;

        if hex.len() != algorithm.hex_len() {
            return Err(PullError::MalformedDigest {
                digest: s.to_string(),
                message: format!("hex length {}, expected {}", hex.len(), algorithm.hex_len()),
            });
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PullError::MalformedDigest {
                digest: s.to_string(),
                message: "non-hex character in digest".to_string(),
            });
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Compute the sha256 digest of a byte buffer.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Lowercase hex component.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check a byte buffer against this digest.
    ///
    /// True iff hashing the full buffer under this digest's algorithm
    /// reproduces the hex component. A truncated buffer hashes to a
    /// different value, so partial content never verifies.
    pub fn verify_bytes(&self, bytes: &[u8]) -> bool {
        let mut hasher = DigestHasher::new(self.algorithm);
        hasher.update(bytes);
        hasher.finalize() == *self
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

/// Incremental hasher producing a [`Digest`].
///
/// Used by the blob fetcher to hash while streaming, so blobs are never
/// buffered whole just to be verified.
pub struct DigestHasher {
    inner: HasherInner,
}

enum HasherInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::Sha256 => HasherInner::Sha256(Sha256::new()),
            Algorithm::Sha512 => HasherInner::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(bytes),
            HasherInner::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.inner {
            HasherInner::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            HasherInner::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}
