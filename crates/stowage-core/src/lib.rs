//! # Stowage Core
//!
//! Backend-neutral object model for the Stowage storage abstraction layer.
//!
//! This crate provides:
//! - **Keys**: Canonical, traversal-free hierarchical object names
//! - **Metadata**: The envelope (size, content hash, timestamp, tags) stored with every object
//! - **Hashing**: Store-wide content digests (BLAKE3, SHA-256, MD5)
//! - **Errors**: The single failure vocabulary every backend maps into
//! - **Configuration**: Retry, timeout, and hashing settings for a store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        StorageClient (facade)           │
//! ├─────────────────────────────────────────┤
//! │     Retry / Backoff Policy Engine       │
//! ├─────────────────────────────────────────┤
//! │            Backend Trait                │
//! ├─────────────┬─────────────┬─────────────┤
//! │   Memory    │ Local Disk  │   Remote    │
//! ├─────────────┴─────────────┴─────────────┤
//! │   stowage-core: keys, metadata, errors  │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod hash;
pub mod key;
pub mod metadata;

pub use config::{ConfigError, StoreConfig};
pub use error::{ErrorKind, Result, StorageError};
pub use hash::{ContentHash, ContentHasher, HashAlgorithm};
pub use key::{StorageKey, MAX_KEY_LEN, SEPARATOR};
pub use metadata::{MetadataEnvelope, ObjectMetadata, Tags, ENVELOPE_VERSION};
