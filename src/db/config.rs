use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::primitives::kv::{KvStore, MemKv};
use crate::stats::CorrectorConfig;

/// Options supplied when creating or opening a [`super::Database`].
#[derive(Clone)]
pub struct DatabaseOptions {
    /// Store backend holding all data, counters and bookkeeping.
    pub store: Arc<dyn KvStore>,
    /// How long closing waits for the statistics corrector to drain.
    pub corrector_shutdown_timeout: Duration,
    /// How long a schema session waits for write transactions to finish.
    pub schema_lock_timeout: Duration,
    /// Bound of the statistics correction queue.
    pub correction_queue_capacity: usize,
}

impl DatabaseOptions {
    /// Creates options over `store` with default settings.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            corrector_shutdown_timeout: Duration::from_secs(60),
            schema_lock_timeout: Duration::from_secs(5),
            correction_queue_capacity: 16,
        }
    }

    /// Options over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemKv::new()))
    }

    /// Sets the corrector shutdown timeout.
    pub fn corrector_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.corrector_shutdown_timeout = timeout;
        self
    }

    /// Sets the schema lock timeout.
    pub fn schema_lock_timeout(mut self, timeout: Duration) -> Self {
        self.schema_lock_timeout = timeout;
        self
    }

    /// Sets the correction queue bound.
    pub fn correction_queue_capacity(mut self, capacity: usize) -> Self {
        self.correction_queue_capacity = capacity;
        self
    }

    /// Applies the settings found in a TOML document, keeping `store`.
    ///
    /// ```toml
    /// [database]
    /// schema_lock_timeout_ms = 2000
    ///
    /// [statistics]
    /// corrector_shutdown_timeout_ms = 30000
    /// queue_capacity = 8
    /// ```
    pub fn from_toml_str(store: Arc<dyn KvStore>, contents: &str) -> Result<Self, ConfigError> {
        let raw: RawOptions = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        Self::new(store).apply(raw)
    }

    /// Reads settings from the TOML file at `path`.
    pub fn load(store: Arc<dyn KvStore>, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawOptions = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        Self::new(store).apply(raw)
    }

    fn apply(mut self, raw: RawOptions) -> Result<Self, ConfigError> {
        if let Some(ms) = raw.database.schema_lock_timeout_ms {
            self.schema_lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.statistics.corrector_shutdown_timeout_ms {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    field: "statistics.corrector_shutdown_timeout_ms",
                    reason: "must be positive",
                });
            }
            self.corrector_shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = raw.statistics.queue_capacity {
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    field: "statistics.queue_capacity",
                    reason: "must be positive",
                });
            }
            self.correction_queue_capacity = capacity;
        }
        Ok(self)
    }

    pub(crate) fn corrector_config(&self) -> CorrectorConfig {
        CorrectorConfig {
            shutdown_timeout: self.corrector_shutdown_timeout,
            queue_capacity: self.correction_queue_capacity,
        }
    }
}

impl fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("corrector_shutdown_timeout", &self.corrector_shutdown_timeout)
            .field("schema_lock_timeout", &self.schema_lock_timeout)
            .field("correction_queue_capacity", &self.correction_queue_capacity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    statistics: StatisticsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatabaseSection {
    schema_lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatisticsSection {
    corrector_shutdown_timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

/// Failure to load [`DatabaseOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document is not valid TOML or has unknown keys.
    #[error("failed to parse config: {source}")]
    Parse {
        /// File path, when loaded from a file.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("config value {field} {reason}")]
    Invalid {
        /// Dotted key.
        field: &'static str,
        /// What is wrong.
        reason: &'static str,
    },
}
