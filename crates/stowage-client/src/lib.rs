//! # Stowage Client
//!
//! The application-facing side of Stowage:
//!
//! - [`StorageClient`]: get/put/delete/list over any [`Backend`], with key
//!   normalization, retries, deadlines and hash verification
//! - [`RetryPolicy`]: exponential backoff with jitter for transient failures
//! - [`StorageManager`]: registry of named backends
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stowage_client::StorageClient;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let client = StorageClient::new(backend, &StoreConfig::default());
//!
//! let meta = client.put("reports/2024/q1.csv", "a,b,c").await?;
//! let object = client.get("reports/2024/q1.csv").await?;
//! client.put_if_match("reports/2024/q1.csv", "a,b,c,d", &meta.content_hash).await?;
//! ```

pub mod client;
pub mod manager;
pub mod retry;

pub use client::{Object, ObjectStream, ObjectWriter, StorageClient};
pub use manager::StorageManager;
pub use retry::{RetryPolicy, RetryState};

pub use stowage_backend::{Backend, ContinuationToken, ListPage};
pub use stowage_core::{ErrorKind, ObjectMetadata, Result, StorageError, StorageKey, Tags};
