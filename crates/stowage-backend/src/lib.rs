//! # Stowage Backends
//!
//! Concrete object stores behind one [`Backend`] trait.
//!
//! This crate provides:
//! - **MemoryBackend**: Arena-backed store for deterministic tests, with fault injection
//! - **LocalDiskBackend**: Directory tree with staged, atomically renamed writes
//! - **RemoteBackend**: HTTP object service client with bearer credentials
//!
//! Every adapter maps its native failures into [`StorageError`] before
//! returning; nothing backend-specific crosses this boundary.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stowage_backend::{Backend, MemoryBackend, Precondition};
//!
//! let backend = MemoryBackend::new();
//! let key = StorageKey::normalize("a/b/c.txt")?;
//! let meta = backend
//!     .write_full(&key, Bytes::from("hello"), Tags::new(), Precondition::None)
//!     .await?;
//! let body = backend.read(&key).await?.read_to_end().await?;
//! ```

pub mod handle;
pub mod local;
pub mod memory;
pub mod remote;

pub use handle::{ChunkStream, ObjectReader, WriteSession};
pub use local::{map_io_error, LocalDiskBackend};
pub use memory::{MemoryBackend, Operation};
pub use remote::{map_status, map_transport_error, Credential, RemoteBackend, RemoteConfig};

pub use stowage_core::{
    ContentHash, ErrorKind, HashAlgorithm, ObjectMetadata, Result, StorageError, StorageKey, Tags,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Read chunk size for streamed bodies (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Objects returned per listing page unless an adapter is configured otherwise
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Condition a write must satisfy against the object's current state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional overwrite
    #[default]
    None,
    /// Only create; fail with `AlreadyExists` if the key is present
    IfAbsent,
    /// Only replace an object whose current hash matches; fail with `Conflict` otherwise
    IfHashMatches(ContentHash),
}

impl Precondition {
    /// Evaluate against the current metadata (`None` when the key is absent)
    pub fn check(&self, key: &StorageKey, current: Option<&ObjectMetadata>) -> Result<()> {
        match (self, current) {
            (Self::None, _) => Ok(()),
            (Self::IfAbsent, None) => Ok(()),
            (Self::IfAbsent, Some(_)) => Err(StorageError::AlreadyExists(key.to_string())),
            (Self::IfHashMatches(expected), None) => Err(StorageError::Conflict(format!(
                "{}: expected hash {} but object is absent",
                key, expected
            ))),
            (Self::IfHashMatches(expected), Some(meta)) if meta.content_hash != *expected => {
                Err(StorageError::Conflict(format!(
                    "{}: expected hash {}, found {}",
                    key, expected, meta.content_hash
                )))
            }
            (Self::IfHashMatches(_), Some(_)) => Ok(()),
        }
    }

    /// Whether evaluating this precondition needs the current object state
    pub fn needs_current(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Opaque position in a listing
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

impl ContinuationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a listing, in key order
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMetadata>,
    /// Present when more objects follow
    pub next: Option<ContinuationToken>,
}

/// Trait for object storage backends.
///
/// Implementations must be safe to share across concurrent callers: `read`,
/// `write_full`, `stat`, and `delete` may be invoked concurrently without
/// external locking. Atomicity is per call; nothing spans calls.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short adapter name for logs
    fn name(&self) -> &str;

    /// Digest used for every object in this store
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Open an object for streaming read
    async fn read(&self, key: &StorageKey) -> Result<ObjectReader>;

    /// Replace an object's body and metadata in one atomic step
    async fn write_full(
        &self,
        key: &StorageKey,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata>;

    /// Start an incremental write that becomes visible only on commit
    async fn write_stream(&self, key: &StorageKey, tags: Tags) -> Result<Box<dyn WriteSession>>;

    /// Get metadata without the body
    async fn stat(&self, key: &StorageKey) -> Result<ObjectMetadata>;

    /// List objects under `prefix` (all objects when `None`), resuming after `token`
    async fn list(
        &self,
        prefix: Option<&StorageKey>,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage>;

    /// Remove an object, reporting `NotFound` if it is absent
    async fn delete(&self, key: &StorageKey) -> Result<()>;

    /// Write only if the current content hash equals `expected`
    async fn conditional_write(
        &self,
        key: &StorageKey,
        body: Bytes,
        expected: &ContentHash,
        tags: Tags,
    ) -> Result<ObjectMetadata> {
        self.write_full(key, body, tags, Precondition::IfHashMatches(expected.clone()))
            .await
    }
}
