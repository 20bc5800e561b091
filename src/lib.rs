//! Sombra SQL read path: SELECT planning and execution over a pluggable
//! schema catalog, index catalog and record store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod query;
pub mod types;

pub use query::{ConditionNode, ExecutionContext, Executor, ExecutorOptions, SelectQuery};
pub use types::{ClusterId, Result, Rid, SombraError};
