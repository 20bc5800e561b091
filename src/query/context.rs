//! Per-query execution state: variables, deadline, cancellation and metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::trace;

use crate::query::options::TimeoutStrategy;
use crate::query::value::Value;
use crate::types::{Result, SombraError};

/// Stage a query has reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPhase {
    /// Nothing has run yet.
    Unstarted,
    /// The target has been validated and its clusters or indexes resolved.
    TargetResolved,
    /// Rows are coming from index cursors.
    IndexStream,
    /// Rows are coming from a storage scan.
    Scan,
    /// Every source row has been filtered.
    Filtered,
    /// GROUP BY buckets have been finalized.
    Grouped,
    /// Buffered rows have been sorted.
    Sorted,
    /// SKIP and LIMIT have been applied.
    Limited,
    /// The sink has received every row.
    Delivered,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::Unstarted => "unstarted",
            QueryPhase::TargetResolved => "target_resolved",
            QueryPhase::IndexStream => "index_stream",
            QueryPhase::Scan => "scan",
            QueryPhase::Filtered => "filtered",
            QueryPhase::Grouped => "grouped",
            QueryPhase::Sorted => "sorted",
            QueryPhase::Limited => "limited",
            QueryPhase::Delivered => "delivered",
        };
        f.write_str(name)
    }
}

/// Metrics gathered while a query runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    /// Names of every index the plan read from.
    pub involved_indexes: BTreeSet<String>,
    /// The source stream already satisfied ORDER BY.
    pub fully_sorted_by_index: bool,
    /// Some index was chosen partly because it matches ORDER BY.
    pub index_is_used_in_order_by: bool,
    /// Lookups served by composite indexes.
    pub composite_index_used: u64,
    /// Range pairs folded into BETWEEN.
    pub range_query_converted_in_between: u64,
    /// Records loaded from storage.
    pub document_reads: u64,
    /// Loaded records whose class matched the target.
    pub document_analyzed: u64,
    /// Parallel scan tasks spawned.
    pub parallel_tasks: u64,
    /// The parallel result queue filled up at least once.
    pub queue_full_tip: bool,
}

impl QueryStats {
    /// Folds a worker's counters into these.
    pub fn merge(&mut self, other: &QueryStats) {
        self.involved_indexes
            .extend(other.involved_indexes.iter().cloned());
        self.fully_sorted_by_index |= other.fully_sorted_by_index;
        self.index_is_used_in_order_by |= other.index_is_used_in_order_by;
        self.composite_index_used += other.composite_index_used;
        self.range_query_converted_in_between += other.range_query_converted_in_between;
        self.document_reads += other.document_reads;
        self.document_analyzed += other.document_analyzed;
        self.parallel_tasks += other.parallel_tasks;
        self.queue_full_tip |= other.queue_full_tip;
    }
}

#[derive(Clone, Copy, Debug)]
struct Deadline {
    limit: Duration,
    strategy: TimeoutStrategy,
    started: Option<Instant>,
}

/// Execution context for one query.
///
/// Parallel workers receive a [`fork`](Self::fork) sharing the deadline and
/// the cancel token but with fresh metrics; the orchestrator folds them back
/// with [`merge`](Self::merge).
#[derive(Debug)]
pub struct ExecutionContext {
    variables: BTreeMap<String, Value>,
    deadline: Option<Deadline>,
    in_transaction: bool,
    cancel_token: Option<Arc<AtomicBool>>,
    timed_out: bool,
    phase: QueryPhase,
    /// Metrics for this query.
    pub stats: QueryStats,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Empty context without deadline or transaction.
    pub fn new() -> Self {
        Self {
            variables: BTreeMap::new(),
            deadline: None,
            in_transaction: false,
            cancel_token: None,
            timed_out: false,
            phase: QueryPhase::Unstarted,
            stats: QueryStats::default(),
        }
    }

    /// Binds a context variable visible as `$name`.
    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_variable(name, value);
        self
    }

    /// Binds a context variable visible as `$name`.
    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.variables
            .insert(name.trim_start_matches('$').to_owned(), value.into());
    }

    /// Attaches a deadline. The clock starts when execution begins.
    pub fn with_timeout(mut self, limit: Duration, strategy: TimeoutStrategy) -> Self {
        self.deadline = Some(Deadline {
            limit,
            strategy,
            started: None,
        });
        self
    }

    /// Marks the query as running inside a transaction.
    pub fn with_transaction(mut self, active: bool) -> Self {
        self.in_transaction = active;
        self
    }

    /// Attaches a cancel token; setting it fails the query with `Cancelled`.
    pub fn with_cancel_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Context variables.
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Whether a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether the deadline expired under the `Return` strategy.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Current phase.
    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: QueryPhase) {
        if self.phase != phase {
            trace!(from = %self.phase, to = %phase, "query phase");
            self.phase = phase;
        }
    }

    pub(crate) fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Installs a deadline unless one is already set.
    pub(crate) fn default_timeout(&mut self, limit: Duration, strategy: TimeoutStrategy) {
        if self.deadline.is_none() {
            self.deadline = Some(Deadline {
                limit,
                strategy,
                started: None,
            });
        }
    }

    pub(crate) fn start_clock(&mut self) {
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.started.get_or_insert_with(Instant::now);
        }
    }

    /// Cooperative deadline and cancellation check.
    ///
    /// Returns `Ok(true)` to keep going and `Ok(false)` when the deadline
    /// expired under [`TimeoutStrategy::Return`].
    pub fn check_timeout(&mut self) -> Result<bool> {
        if let Some(token) = &self.cancel_token {
            if token.load(Ordering::SeqCst) {
                return Err(SombraError::Cancelled);
            }
        }
        if self.timed_out {
            return Ok(false);
        }
        let Some(deadline) = self.deadline else {
            return Ok(true);
        };
        let Some(started) = deadline.started else {
            return Ok(true);
        };
        let elapsed = started.elapsed();
        if elapsed <= deadline.limit {
            return Ok(true);
        }
        match deadline.strategy {
            TimeoutStrategy::Exception => Err(SombraError::Timeout {
                elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
                limit_ms: deadline.limit.as_millis().min(u64::MAX as u128) as u64,
            }),
            TimeoutStrategy::Return => {
                self.timed_out = true;
                Ok(false)
            }
        }
    }

    /// Copy for a parallel worker: same variables, deadline and token,
    /// fresh metrics.
    pub fn fork(&self) -> ExecutionContext {
        ExecutionContext {
            variables: self.variables.clone(),
            deadline: self.deadline,
            in_transaction: self.in_transaction,
            cancel_token: self.cancel_token.clone(),
            timed_out: false,
            phase: self.phase,
            stats: QueryStats::default(),
        }
    }

    /// Folds a worker context back into this one.
    pub fn merge(&mut self, child: ExecutionContext) {
        self.stats.merge(&child.stats);
        self.timed_out |= child.timed_out;
    }
}
