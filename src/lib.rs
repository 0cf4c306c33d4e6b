//! # Stowage
//!
//! One object storage interface over interchangeable backends.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  StorageClient / StorageManager              │  stowage-client
//! │  normalize key → retry + deadline → verify   │
//! ├──────────────────────────────────────────────┤
//! │  Backend trait                               │  stowage-backend
//! │  MemoryBackend │ LocalDiskBackend │ Remote   │
//! ├──────────────────────────────────────────────┤
//! │  StorageKey, ObjectMetadata, StorageError    │  stowage-core
//! └──────────────────────────────────────────────┘
//! ```

pub use stowage_backend::{
    Backend, Credential, LocalDiskBackend, MemoryBackend, Precondition, RemoteBackend,
    RemoteConfig,
};
pub use stowage_client::{Object, RetryPolicy, StorageClient, StorageManager};
pub use stowage_core::{
    ContentHash, ErrorKind, HashAlgorithm, ObjectMetadata, Result, StorageError, StorageKey,
    StoreConfig, Tags,
};

use std::sync::Arc;

/// Open a local store at `config.root_path` and wrap it in a client
pub async fn open_local(config: &StoreConfig) -> Result<StorageClient> {
    let backend = LocalDiskBackend::open(config).await?;
    Ok(StorageClient::new(Arc::new(backend), config))
}
