#![forbid(unsafe_code)]

//! SELECT read path: filter analysis, index selection, and result delivery.
//!
//! A [`SelectQuery`] is planned against the schema, index and record store
//! collaborators into a [`planner::QueryPlan`], then executed by the
//! [`Executor`] into a [`storage::ResultSink`].

/// Parsed SELECT statement model.
///
/// Targets, projections, ordering, grouping, paging and the builder API used
/// to assemble queries programmatically.
pub mod ast;

/// Decomposes a WHERE clause into per-branch indexable field sets.
pub mod analyzer;

/// Multi-hop link chains resolved through a sequence of indexes.
pub mod chained;

/// Conditions, operators and field chains.
///
/// Evaluation against a record, reuse classification and the small operator
/// algebra the analyzer relies on.
pub mod condition;

/// Per-query execution state and metrics.
pub mod context;

/// Query-level error catalog.
pub mod errors;

/// Query execution engine.
///
/// Opens the planned source, filters, and streams rows through the result
/// pipeline. Falls back to a class scan when an index cannot be used.
pub mod executor;

/// Index abstraction consumed by the planner and the executor.
pub mod index;

/// Merge algebra for equality/range sub-conditions.
pub mod index_search;

/// In-memory catalog and record store.
///
/// Implements every collaborator trait; used by the test suites, the benches
/// and embedders that want a self-contained engine.
pub mod memory;

/// Schema and index catalog traits.
pub mod metadata;

/// Executor tunables and their TOML loader.
pub mod options;

mod parallel;
mod pipeline;

/// Query plan generation and explain output.
///
/// Ranks candidate indexes per OR branch, decides ORDER BY satisfaction,
/// and fingerprints every plan.
pub mod planner;

/// Performance profiling for query operations.
///
/// Collects timing statistics when `SOMBRA_PROFILE` is set.
pub mod profile;

/// Records and result rows.
pub mod record;

/// Range rewrites applied before planning.
pub mod rewrite;

/// Record store and result sink traits.
pub mod storage;

/// Dynamically typed field values.
pub mod value;

pub use ast::{Direction, Projection, SelectQuery, Target};
pub use condition::{ConditionNode, FieldChain, Operand, Operator};
pub use context::{ExecutionContext, QueryStats};
pub use errors::{QueryError, QueryErrorWithCode};
pub use executor::{Executor, QueryOutcome};
pub use memory::MemoryDatabase;
pub use options::{ExecutorOptions, TimeoutStrategy};
pub use pipeline::EXPAND_VALUE;
pub use record::{Record, Row};
pub use storage::{CollectingSink, ResultSink};
pub use value::Value;

/// Execution plan output with explanation capabilities.
pub use planner::{PlanExplain, PlannerOutput};
