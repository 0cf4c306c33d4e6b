//! Content hashing
//!
//! A store picks one [`HashAlgorithm`] at creation time and keeps it for its
//! whole lifetime, so every [`ContentHash`] in a store has the same length and
//! can be compared directly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Digest algorithm used for object bodies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3 (32 bytes)
    #[default]
    Blake3,
    /// SHA-256 (32 bytes)
    Sha256,
    /// MD5 (16 bytes), for stores that must match S3-style ETags
    Md5,
}

impl HashAlgorithm {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    /// Length of the digest in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Blake3 | Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }

    /// Hash a complete body
    pub fn digest(&self, data: &[u8]) -> ContentHash {
        let mut hasher = ContentHasher::new(*self);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(Self::Blake3),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unknown hash algorithm: {}", other)),
        }
    }
}

/// Digest of an object body, tagged with its algorithm.
///
/// Textual form is `<algorithm>:<lowercase hex>`, e.g. `blake3:af13...`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

impl ContentHash {
    /// Wrap a raw digest, checking its length against the algorithm
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Result<Self, String> {
        if digest.len() != algorithm.digest_len() {
            return Err(format!(
                "{} digest must be {} bytes, got {}",
                algorithm,
                algorithm.digest_len(),
                digest.len()
            ));
        }
        Ok(Self { algorithm, digest })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex of the digest, without the algorithm prefix
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Check `data` against this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == *self
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex_digest) = s
            .split_once(':')
            .ok_or_else(|| format!("content hash {:?} lacks an algorithm prefix", s))?;
        let algorithm: HashAlgorithm = algorithm.parse()?;
        let digest = hex::decode(hex_digest).map_err(|e| format!("invalid digest hex: {}", e))?;
        Self::new(algorithm, digest)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

/// Incremental hasher for streamed bodies
#[derive(Clone)]
pub enum ContentHasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
    Md5(md5::Md5),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Md5 => Self::Md5(md5::Md5::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Blake3(h) => {
                h.update(data);
            }
            Self::Sha256(h) => h.update(data),
            Self::Md5(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ContentHash {
        let (algorithm, digest) = match self {
            Self::Blake3(h) => (HashAlgorithm::Blake3, h.finalize().as_bytes().to_vec()),
            Self::Sha256(h) => (HashAlgorithm::Sha256, h.finalize().to_vec()),
            Self::Md5(h) => (HashAlgorithm::Md5, h.finalize().to_vec()),
        };
        ContentHash { algorithm, digest }
    }
}
