//! Executor tuning knobs, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do when a query outlives its deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStrategy {
    /// Fail the query with a timeout error.
    #[default]
    Exception,
    /// Stop and deliver what was produced so far.
    Return,
}

/// Executor configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Extra rows the ORDER BY buffer may hold beyond `limit + skip` before
    /// it is re-sorted and truncated.
    pub partial_sort_slack: usize,
    /// Minimum record count before a scan may run in parallel.
    pub parallel_min_records: u64,
    /// Capacity of the shared parallel result queue.
    pub parallel_queue_capacity: usize,
    /// Deadline applied when the query does not set one.
    pub default_timeout_ms: Option<u64>,
    /// Strategy for the default deadline.
    pub timeout_strategy: TimeoutStrategy,
    /// Unlimited queries returning more rows than this log a hint.
    pub tip_limit_threshold: usize,
    /// Whether range pairs are folded into BETWEEN before analysis.
    pub between_rewrite: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            partial_sort_slack: 10_000,
            parallel_min_records: 300_000,
            parallel_queue_capacity: 20_000,
            default_timeout_ms: None,
            timeout_strategy: TimeoutStrategy::Exception,
            tip_limit_threshold: 10_000,
            between_rewrite: true,
        }
    }
}

impl ExecutorOptions {
    /// Parses options from TOML text; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, OptionsError> {
        toml::from_str(text).map_err(|source| OptionsError::Parse { source })
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| OptionsError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default deadline as a duration.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Failure loading [`ExecutorOptions`].
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The file could not be read.
    #[error("failed to read executor options {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// TOML text was malformed or had a wrong type.
    #[error("failed to parse executor options: {source}")]
    Parse {
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A TOML file was malformed or had a wrong type.
    #[error("failed to parse executor options {path}: {source}")]
    ParseFile {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}
