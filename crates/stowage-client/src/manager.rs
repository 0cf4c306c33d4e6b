//! Named backend registry

use crate::client::StorageClient;
use crate::retry::RetryPolicy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use stowage_backend::Backend;
use stowage_core::{Result, StorageError, StoreConfig};

/// Holds configured backends by name and hands out clients for them
pub struct StorageManager {
    backends: DashMap<String, Arc<dyn Backend>>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

impl StorageManager {
    /// Clients created by this manager use the retry and timeout settings of `config`
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            backends: DashMap::new(),
            retry: RetryPolicy::from_config(config),
            timeout: config.operation_timeout(),
        }
    }

    /// Add a backend under `name`; names are unique
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<()> {
        match self.backends.entry(name.into()) {
            Entry::Occupied(entry) => Err(StorageError::AlreadyExists(format!(
                "backend {} is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                tracing::info!(name = %entry.key(), backend = backend.name(), "registered backend");
                entry.insert(backend);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.remove(name).map(|(_, backend)| backend)
    }

    /// Client for the backend registered under `name`
    pub fn client(&self, name: &str) -> Result<StorageClient> {
        let backend = self
            .backends
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(format!("no backend named {}", name)))?;
        Ok(StorageClient::with_policy(backend, self.retry, self.timeout))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
