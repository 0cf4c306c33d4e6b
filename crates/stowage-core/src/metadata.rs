//! Object metadata and its persisted envelope

use crate::{ContentHash, HashAlgorithm, Result, StorageError, StorageKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current version of the persisted descriptor format
pub const ENVELOPE_VERSION: u32 = 1;

/// User-defined tags attached to an object
pub type Tags = BTreeMap<String, String>;

/// Metadata describing one stored object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// Normalized key of the object
    pub key: StorageKey,

    /// Body length in bytes
    pub size_bytes: u64,

    /// Digest of the body as last written
    pub content_hash: ContentHash,

    /// Time of the last successful write
    pub last_modified: DateTime<Utc>,

    /// User-defined tags
    #[serde(default)]
    pub tags: Tags,
}

impl ObjectMetadata {
    /// Describe `body` as it is about to be written under `key`
    pub fn for_body(key: StorageKey, body: &[u8], algorithm: HashAlgorithm, tags: Tags) -> Self {
        Self::from_parts(key, body.len() as u64, algorithm.digest(body), tags)
    }

    /// Assemble metadata from an already-computed size and hash
    pub fn from_parts(
        key: StorageKey,
        size_bytes: u64,
        content_hash: ContentHash,
        tags: Tags,
    ) -> Self {
        Self {
            key,
            size_bytes,
            content_hash,
            last_modified: Utc::now(),
            tags,
        }
    }

    /// Size formatted for people, e.g. `"1.5 KB"`
    pub fn human_readable_size(&self) -> String {
        human_readable_size(self.size_bytes)
    }
}

/// Format a byte count with binary units
pub fn human_readable_size(size: u64) -> String {
    const UNITS: [&str; 6] = ["bytes", "KB", "MB", "GB", "TB", "PB"];
    if size < 1024 {
        return format!("{} bytes", size);
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Versioned descriptor persisted next to (or alongside) an object body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEnvelope {
    pub version: u32,
    #[serde(flatten)]
    pub metadata: ObjectMetadata,
}

impl MetadataEnvelope {
    pub fn new(metadata: ObjectMetadata) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            metadata,
        }
    }

    /// Encode as JSON
    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StorageError::Corrupt(format!("failed to encode descriptor: {}", e)))
    }

    /// Decode a descriptor, rejecting unknown versions
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Corrupt(format!("unreadable descriptor: {}", e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::Corrupt(format!(
                "descriptor version {} is not supported (expected {})",
                envelope.version, ENVELOPE_VERSION
            )));
        }
        Ok(envelope)
    }
}
