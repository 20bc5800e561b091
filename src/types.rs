#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type.

use std::fmt;
use std::str::FromStr;

use crate::query::errors::QueryError;

/// Physical partition identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ClusterId(pub u32);

/// Stable record identifier: owning cluster plus position inside it.
///
/// Ordering is cluster-major, so iterating clusters in ascending id order and
/// positions in ascending order yields records in ascending RID order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rid {
    /// Cluster holding the record.
    pub cluster: ClusterId,
    /// Position inside the cluster.
    pub position: u64,
}

impl Rid {
    /// Builds a RID from raw parts.
    pub const fn new(cluster: u32, position: u64) -> Self {
        Self {
            cluster: ClusterId(cluster),
            position,
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster.0, self.position)
    }
}

impl FromStr for Rid {
    type Err = SombraError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.strip_prefix('#').unwrap_or(s);
        let (cluster, position) = body
            .split_once(':')
            .ok_or(SombraError::Invalid("rid must look like #cluster:position"))?;
        let cluster = cluster
            .parse::<u32>()
            .map_err(|_| SombraError::Invalid("rid cluster must be an unsigned integer"))?;
        let position = position
            .parse::<u64>()
            .map_err(|_| SombraError::Invalid("rid position must be an unsigned integer"))?;
        Ok(Rid::new(cluster, position))
    }
}

impl From<u32> for ClusterId {
    fn from(value: u32) -> Self {
        ClusterId(value)
    }
}

/// Errors surfaced by planning and execution.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Storage returned data that violates its own invariants.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// The query was rejected before execution.
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),
    /// An index failed while being probed or streamed.
    #[error("index '{index}' failed: {message}")]
    Index {
        /// Name of the failing index.
        index: String,
        /// Failure description reported by the index.
        message: String,
    },
    /// The execution deadline expired.
    #[error("query timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        /// Milliseconds elapsed when the expiry was observed.
        elapsed_ms: u64,
        /// Configured budget in milliseconds.
        limit_ms: u64,
    },
    /// Execution was cancelled through the context token.
    #[error("query cancelled")]
    Cancelled,
    /// A mutation was attempted on a read-only index view.
    #[error("operation '{operation}' is not supported by read-only index view '{view}'")]
    UnsupportedForView {
        /// Name of the view.
        view: String,
        /// Rejected operation.
        operation: &'static str,
    },
    /// A parallel worker terminated abnormally.
    #[error("parallel task failed: {0}")]
    Task(String),
}

impl SombraError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            SombraError::Io(_) => "Io",
            SombraError::Corruption(_) => "Corruption",
            SombraError::Invalid(_) => "Invalid",
            SombraError::NotFound => "NotFound",
            SombraError::Query(err) => err.code(),
            SombraError::Index { .. } => "IndexFailure",
            SombraError::Timeout { .. } => "Timeout",
            SombraError::Cancelled => "Cancelled",
            SombraError::UnsupportedForView { .. } => "UnsupportedForView",
            SombraError::Task(_) => "TaskFailure",
        }
    }
}

/// Crate result alias.
pub type Result<T> = std::result::Result<T, SombraError>;
