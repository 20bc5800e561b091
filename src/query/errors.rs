#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Structured rejections raised before a query starts executing.
///
/// Planning ambiguity never lands here: non-indexable predicates silently
/// degrade to a scan. These errors describe queries that cannot run at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// LIMIT must be -1 (unbounded) or strictly positive.
    #[error("LIMIT must be -1 or greater than 0 (got {limit})")]
    InvalidLimit { limit: i64 },
    /// SKIP cannot be negative.
    #[error("SKIP must not be negative (got {skip})")]
    InvalidSkip { skip: i64 },
    /// Target class is unknown to the schema.
    #[error("unknown class '{class}'")]
    UnknownClass { class: String },
    /// Target cluster is unknown to the storage layer.
    #[error("unknown cluster {cluster}")]
    UnknownCluster { cluster: u32 },
    /// Target index is unknown to the catalog.
    #[error("unknown index '{index}'")]
    UnknownIndex { index: String },
    /// Context variable used as a target is not bound.
    #[error("target variable '${name}' is not defined")]
    UnknownVariable { name: String },
    /// EXPAND must be the only projection.
    #[error("expand() cannot be combined with other projections")]
    ExpandWithProjections,
    /// Index targets can only be filtered on `key`.
    #[error("index '{index}' can only be filtered on 'key' ({clause})")]
    UnsupportedIndexFilter { index: String, clause: String },
    /// Index targets can only be ordered by `key`.
    #[error("index '{index}' can only be ordered by 'key' (got '{field}')")]
    UnsupportedIndexOrder { index: String, field: String },
    /// Chained index requested for a chain shorter than two hops.
    #[error("field chain '{chain}' needs at least two hops for a chained index")]
    ChainTooShort { chain: String },
    /// Malformed operand for an operator (BETWEEN needs two bounds, IN a list).
    #[error("operator {operator} expects {expected}")]
    OperandShape {
        operator: &'static str,
        expected: &'static str,
    },
}

impl QueryError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidLimit { .. } => "InvalidLimit",
            QueryError::InvalidSkip { .. } => "InvalidSkip",
            QueryError::UnknownClass { .. } => "UnknownClass",
            QueryError::UnknownCluster { .. } => "UnknownCluster",
            QueryError::UnknownIndex { .. } => "UnknownIndex",
            QueryError::UnknownVariable { .. } => "UnknownVariable",
            QueryError::ExpandWithProjections => "ExpandWithProjections",
            QueryError::UnsupportedIndexFilter { .. } => "UnsupportedIndexFilter",
            QueryError::UnsupportedIndexOrder { .. } => "UnsupportedIndexOrder",
            QueryError::ChainTooShort { .. } => "ChainTooShort",
            QueryError::OperandShape { .. } => "OperandShape",
        }
    }
}

/// Convenience wrapper that formats query errors with their codes.
pub struct QueryErrorWithCode<'a>(pub &'a QueryError);

impl fmt::Display for QueryErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_code_prefixes_variant_code() {
        let err = QueryError::InvalidSkip { skip: -3 };
        assert_eq!(
            QueryErrorWithCode(&err).to_string(),
            "[InvalidSkip] SKIP must not be negative (got -3)"
        );
    }
}
