//! Store configuration

use crate::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides, e.g. `STOWAGE_MAX_RETRIES=5`
pub const ENV_PREFIX: &str = "STOWAGE";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// File or environment source could not be read
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Settings recognized at backend and client construction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of a local store, or namespace label of an in-memory one
    #[serde(alias = "rootPath", alias = "rootpath")]
    pub root_path: PathBuf,
    /// Retries after the first attempt of a transient failure
    #[serde(alias = "maxRetries", alias = "maxretries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(alias = "baseBackoffMs", alias = "basebackoffms")]
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(alias = "maxBackoffMs", alias = "maxbackoffms")]
    pub max_backoff_ms: u64,
    /// Bound on a single backend attempt
    #[serde(alias = "requestTimeoutMs", alias = "requesttimeoutms")]
    pub request_timeout_ms: u64,
    /// Default bound on a whole facade call, retries included
    #[serde(alias = "operationTimeoutMs", alias = "operationtimeoutms")]
    pub operation_timeout_ms: u64,
    /// Extra random delay as a fraction of each backoff step
    #[serde(alias = "jitterRatio", alias = "jitterratio")]
    pub jitter_ratio: f64,
    /// Content digest, fixed for the store's lifetime
    #[serde(alias = "hashAlgorithm", alias = "hashalgorithm")]
    pub hash_algorithm: HashAlgorithm,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("./stowage-data"),
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            request_timeout_ms: 30_000,
            operation_timeout_ms: 120_000,
            jitter_ratio: 0.1,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl StoreConfig {
    /// Create a config rooted at `root_path`
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            ..Default::default()
        }
    }

    /// Load defaults, then an optional file (TOML/JSON/YAML by extension), then
    /// `STOWAGE_*` environment variables, and validate the result
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_ms ({}) must be >= base_backoff_ms ({})",
                self.max_backoff_ms, self.base_backoff_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".into()));
        }
        if self.operation_timeout_ms < self.request_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "operation_timeout_ms ({}) must be >= request_timeout_ms ({})",
                self.operation_timeout_ms, self.request_timeout_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "jitter_ratio ({}) must be within 0.0..=1.0",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// Set retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set backoff bounds
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff_ms = base.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Set per-attempt timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set default whole-call timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set jitter ratio
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Set hash algorithm
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
