//! Drives planned SELECTs: opens the chosen record source, applies LET and the
//! filter to each record, and hands survivors to the result pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, warn};

use crate::query::ast::{OrderItem, SelectQuery};
use crate::query::condition::{resolve_chain, ConditionNode, EvalScope};
use crate::query::context::{ExecutionContext, QueryPhase, QueryStats};
use crate::query::errors::QueryErrorWithCode;
use crate::query::index::{Index, IndexCursor, IndexEntry};
use crate::query::metadata::{IndexCatalog, SchemaCatalog};
use crate::query::options::ExecutorOptions;
use crate::query::parallel::ParallelScan;
use crate::query::pipeline::{compare_keys, ResultPipeline};
use crate::query::planner::{
    ClassFilter, KeyFilter, PlanExplain, Planner, PlannerConfig, PlannerOutput, QueryPlan, ScanPlan,
    SourcePlan, INDEX_KEY, INDEX_RID,
};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::record::{Record, Row};
use crate::query::storage::{CollectingSink, RecordCursor, RecordStore, ResultSink};
use crate::query::value::Value;
use crate::types::{ClusterId, Result, Rid, SombraError};

/// LET bindings computed for one record.
pub type LetBindings = BTreeMap<String, Value>;

/// Summary of one executed query.
#[derive(Clone, Debug, Serialize)]
pub struct QueryOutcome {
    /// Metrics gathered while running.
    pub stats: QueryStats,
    /// Explain tree of the executed plan.
    pub explain: PlanExplain,
    /// The deadline expired and partial results were returned.
    pub timed_out: bool,
    /// Rows pushed to the sink.
    pub rows_delivered: usize,
}

trait RecordStream {
    fn try_next(&mut self) -> Result<Option<Record>>;
}

type BoxRecordStream<'a> = Box<dyn RecordStream + 'a>;

type SharedRids = Arc<Mutex<FxHashSet<Rid>>>;

/// Per-record LET evaluation, class check and filter shared by serial and
/// parallel execution.
pub(crate) struct RecordEvaluator<'a> {
    query: &'a SelectQuery,
    filter: Option<&'a ConditionNode>,
    class_filter: Option<&'a ClassFilter>,
    schema: &'a dyn SchemaCatalog,
}

impl<'a> RecordEvaluator<'a> {
    #[cfg(test)]
    pub(crate) fn for_tests(query: &'a SelectQuery, schema: &'a dyn SchemaCatalog) -> Self {
        Self {
            query,
            filter: query.filter.as_ref(),
            class_filter: None,
            schema,
        }
    }

    /// LET bindings when the record qualifies, `None` otherwise.
    pub(crate) fn evaluate(
        &self,
        record: &Record,
        scope: &EvalScope<'_>,
        stats: &mut QueryStats,
    ) -> Result<Option<LetBindings>> {
        stats.document_reads += 1;
        if let Some(class_filter) = self.class_filter {
            let matches = if class_filter.polymorphic {
                self.schema.is_subclass_of(&record.class, &class_filter.class)
            } else {
                record.class == class_filter.class
            };
            if !matches {
                return Ok(None);
            }
        }
        stats.document_analyzed += 1;

        let mut lets = LetBindings::new();
        for (name, operand) in &self.query.lets {
            let value = {
                let scoped = EvalScope {
                    store: scope.store,
                    variables: scope.variables,
                    lets: Some(&lets),
                };
                operand.resolve(record, &scoped)?
            };
            lets.insert(name.clone(), value);
        }
        let Some(filter) = self.filter else {
            return Ok(Some(lets));
        };
        let timer = profile_timer();
        let keep = {
            let scoped = EvalScope {
                store: scope.store,
                variables: scope.variables,
                lets: Some(&lets),
            };
            filter.evaluate(record, &scoped)?
        };
        record_profile_timer(QueryProfileKind::Filter, timer);
        Ok(keep.then_some(lets))
    }
}

enum Opened<'p> {
    Stream { stream: BoxRecordStream<'p>, sorted: bool },
    Unavailable(SombraError),
}

/// Executes SELECT queries against a schema, index catalog and record store.
pub struct Executor {
    options: ExecutorOptions,
    planner: Planner,
    schema: Arc<dyn SchemaCatalog>,
    store: Arc<dyn RecordStore>,
}

impl Executor {
    /// Creates an executor over the given collaborators.
    pub fn new(
        schema: Arc<dyn SchemaCatalog>,
        indexes: Arc<dyn IndexCatalog>,
        store: Arc<dyn RecordStore>,
        options: ExecutorOptions,
    ) -> Self {
        let config = PlannerConfig {
            between_rewrite: options.between_rewrite,
            parallel_min_records: options.parallel_min_records,
        };
        let planner = Planner::new(config, Arc::clone(&schema), indexes, Arc::clone(&store));
        Self {
            options,
            planner,
            schema,
            store,
        }
    }

    /// Creates an executor over one object implementing every collaborator.
    pub fn for_database<D>(db: Arc<D>, options: ExecutorOptions) -> Self
    where
        D: SchemaCatalog + IndexCatalog + RecordStore + 'static,
    {
        Self::new(
            Arc::clone(&db) as Arc<dyn SchemaCatalog>,
            Arc::clone(&db) as Arc<dyn IndexCatalog>,
            db as Arc<dyn RecordStore>,
            options,
        )
    }

    /// Executor configuration.
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Plans without executing.
    pub fn plan(&self, query: &SelectQuery, ctx: &ExecutionContext) -> Result<PlannerOutput> {
        self.planner.plan(query, ctx)
    }

    /// Runs `query`, pushing result rows into `sink`.
    pub fn execute(
        &self,
        query: &SelectQuery,
        ctx: &mut ExecutionContext,
        sink: &mut dyn ResultSink,
    ) -> Result<QueryOutcome> {
        let PlannerOutput { plan, explain, .. } = self.planner.plan(query, ctx)?;
        ctx.set_phase(QueryPhase::TargetResolved);
        if let Some((limit, strategy)) = query.timeout {
            ctx.default_timeout(limit, strategy);
        }
        if let Some(limit) = self.options.default_timeout() {
            ctx.default_timeout(limit, self.options.timeout_strategy);
        }
        ctx.start_clock();
        ctx.stats.range_query_converted_in_between += plan.range_query_converted_in_between as u64;
        ctx.stats.fully_sorted_by_index = plan.fully_sorted_by_index;
        ctx.stats.index_is_used_in_order_by = plan.index_is_used_in_order_by;

        let rows_delivered = match &plan.source {
            SourcePlan::Count { clusters, alias } => self.deliver_count(query, clusters, alias, ctx, sink)?,
            SourcePlan::Scan(scan) if plan.parallel => self.run_parallel(query, &plan, scan, ctx, sink)?,
            _ => self.run_serial(query, &plan, ctx, sink)?,
        };
        sink.finish(&ctx.stats);
        debug!(
            rows = rows_delivered,
            reads = ctx.stats.document_reads,
            analyzed = ctx.stats.document_analyzed,
            timed_out = ctx.timed_out(),
            "select finished"
        );
        Ok(QueryOutcome {
            stats: ctx.stats.clone(),
            explain,
            timed_out: ctx.timed_out(),
            rows_delivered,
        })
    }

    /// Runs `query` and returns every row.
    pub fn collect(&self, query: &SelectQuery, ctx: &mut ExecutionContext) -> Result<Vec<Row>> {
        let mut sink = CollectingSink::new();
        self.execute(query, ctx, &mut sink)?;
        Ok(sink.rows)
    }

    fn evaluator<'a>(&'a self, query: &'a SelectQuery, plan: &'a QueryPlan) -> RecordEvaluator<'a> {
        RecordEvaluator {
            query,
            filter: plan.filter.as_ref(),
            class_filter: plan.class_filter.as_ref(),
            schema: self.schema.as_ref(),
        }
    }

    fn deliver_count(
        &self,
        query: &SelectQuery,
        clusters: &[ClusterId],
        alias: &str,
        ctx: &mut ExecutionContext,
        sink: &mut dyn ResultSink,
    ) -> Result<usize> {
        ctx.set_phase(QueryPhase::Scan);
        let timer = profile_timer();
        let count = self.store.count(clusters)?;
        record_profile_timer(QueryProfileKind::Scan, timer);
        ctx.set_phase(QueryPhase::Grouped);
        let mut fields = BTreeMap::new();
        fields.insert(alias.to_owned(), Value::Int(count.min(i64::MAX as u64) as i64));
        ctx.set_phase(QueryPhase::Limited);
        let delivered = if query.skip_count() == 0 {
            sink.push(Row::computed(fields));
            1
        } else {
            0
        };
        ctx.set_phase(QueryPhase::Delivered);
        Ok(delivered)
    }

    fn run_serial(
        &self,
        query: &SelectQuery,
        plan: &QueryPlan,
        ctx: &mut ExecutionContext,
        sink: &mut dyn ResultSink,
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let seen: SharedRids = Arc::default();
        let (mut stream, order_satisfied) =
            match self.open_source(&plan.source, query, plan.order_satisfied, ctx, &seen)? {
                Opened::Stream { stream, sorted } => {
                    if !sorted {
                        ctx.stats.fully_sorted_by_index = false;
                    }
                    (stream, plan.order_satisfied && (sorted || !plan.fully_sorted_by_index))
                }
                Opened::Unavailable(err) => {
                    let Some(fallback) = &plan.fallback else {
                        return Err(err);
                    };
                    debug!(
                        clusters = fallback.clusters.len(),
                        "index unavailable, falling back to cluster scan"
                    );
                    ctx.stats.fully_sorted_by_index = false;
                    let order_satisfied = query.order_by.is_empty();
                    (self.open_scan(fallback, ctx)?, order_satisfied)
                }
            };

        let evaluator = self.evaluator(query, plan);
        let mut pipeline = ResultPipeline::new(query, order_satisfied, &self.options);
        let variables = ctx.variables().clone();
        let scope = EvalScope::new(store, &variables);
        while ctx.check_timeout()? {
            let Some(record) = stream.try_next()? else {
                break;
            };
            let Some(lets) = evaluator.evaluate(&record, &scope, &mut ctx.stats)? else {
                continue;
            };
            let scoped = EvalScope {
                store,
                variables: &variables,
                lets: Some(&lets),
            };
            if !pipeline.accept(record, &scoped, sink)? {
                debug!(streaming = pipeline.is_streaming(), "result pipeline requested stop");
                break;
            }
        }
        pipeline.finish(ctx, store, sink)
    }

    fn run_parallel(
        &self,
        query: &SelectQuery,
        plan: &QueryPlan,
        scan: &ScanPlan,
        ctx: &mut ExecutionContext,
        sink: &mut dyn ResultSink,
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let evaluator = self.evaluator(query, plan);
        let mut pipeline = ResultPipeline::new(query, plan.order_satisfied, &self.options);
        let variables = ctx.variables().clone();
        ctx.set_phase(QueryPhase::Scan);
        let parallel = ParallelScan::new(store, scan, self.options.parallel_queue_capacity);
        parallel.run(ctx, &evaluator, |record, lets, ctx| {
            if !ctx.check_timeout()? {
                return Ok(false);
            }
            let scoped = EvalScope {
                store,
                variables: &variables,
                lets: Some(&lets),
            };
            pipeline.accept(record, &scoped, sink)
        })?;
        pipeline.finish(ctx, store, sink)
    }

    fn open_scan<'p>(&'p self, scan: &'p ScanPlan, ctx: &mut ExecutionContext) -> Result<BoxRecordStream<'p>> {
        ctx.set_phase(QueryPhase::Scan);
        let timer = profile_timer();
        let cursor = self
            .store
            .scan_clusters(&scan.clusters, scan.direction, &scan.range)?;
        Ok(Box::new(ScanStream {
            cursor,
            timer,
        }))
    }

    fn open_source<'p>(
        &'p self,
        source: &'p SourcePlan,
        query: &'p SelectQuery,
        order_satisfied: bool,
        ctx: &mut ExecutionContext,
        seen: &SharedRids,
    ) -> Result<Opened<'p>> {
        let store = self.store.as_ref();
        match source {
            SourcePlan::Records(rids) => {
                ctx.set_phase(QueryPhase::Scan);
                Ok(Opened::Stream {
                    stream: Box::new(RidListStream {
                        rids: rids.iter(),
                        store,
                        seen: FxHashSet::default(),
                    }),
                    sorted: false,
                })
            }
            SourcePlan::Scan(scan) => Ok(Opened::Stream {
                stream: self.open_scan(scan, ctx)?,
                sorted: true,
            }),
            SourcePlan::IndexUnion(branches) => {
                ctx.set_phase(QueryPhase::IndexStream);
                let mut cursors = Vec::with_capacity(branches.len());
                let mut sorted = branches.len() == 1;
                for branch in branches {
                    let mut last_err = None;
                    let mut opened = None;
                    for candidate in &branch.candidates {
                        match probe(candidate.index.as_ref(), ctx, |index| {
                            index.query(&candidate.query, candidate.ascending)
                        }) {
                            Ok(cursor) => {
                                sorted &= candidate.sorted;
                                opened = Some(cursor);
                                break;
                            }
                            Err(err) => {
                                log_probe_failure(candidate.index.as_ref(), &candidate.query.to_string(), &err);
                                last_err = Some(err);
                            }
                        }
                    }
                    match opened {
                        Some(cursor) => cursors.push(cursor),
                        None => {
                            return Ok(Opened::Unavailable(last_err.unwrap_or(SombraError::NotFound)));
                        }
                    }
                }
                Ok(Opened::Stream {
                    stream: Box::new(IndexUnionStream {
                        cursors,
                        current: 0,
                        store,
                        seen: Arc::clone(seen),
                    }),
                    sorted,
                })
            }
            SourcePlan::SortedIndex { index, ascending } => {
                ctx.set_phase(QueryPhase::IndexStream);
                let include_nulls = !index.definition().ignore_nulls;
                let cursor = probe(index.as_ref(), ctx, |index| {
                    ordered_stream(index, *ascending, include_nulls)
                });
                match cursor {
                    Ok(cursor) => Ok(Opened::Stream {
                        stream: Box::new(IndexUnionStream {
                            cursors: vec![cursor],
                            current: 0,
                            store,
                            seen: Arc::clone(seen),
                        }),
                        sorted: true,
                    }),
                    Err(err) => {
                        log_probe_failure(index.as_ref(), "full stream", &err);
                        Ok(Opened::Unavailable(err))
                    }
                }
            }
            SourcePlan::Polymorphic(children) => {
                let mut streams = Vec::with_capacity(children.len());
                let mut sorted = true;
                for child in children {
                    match self.open_source(child, query, order_satisfied, ctx, seen)? {
                        Opened::Stream { stream, sorted: child_sorted } => {
                            sorted &= child_sorted;
                            streams.push(stream);
                        }
                        unavailable @ Opened::Unavailable(_) => return Ok(unavailable),
                    }
                }
                let merge = order_satisfied && !query.order_by.is_empty();
                debug!(children = streams.len(), merge, "polymorphic fan-out opened");
                let stream: BoxRecordStream<'p> = if merge {
                    Box::new(MergeStream::new(streams, &query.order_by, store))
                } else {
                    Box::new(ConcatStream {
                        inputs: streams,
                        current: 0,
                    })
                };
                Ok(Opened::Stream { stream, sorted })
            }
            SourcePlan::IndexTarget {
                index,
                query: lookup,
                keys,
                ascending,
            } => {
                ctx.set_phase(QueryPhase::IndexStream);
                let cursor = probe(index.as_ref(), ctx, |index| match lookup {
                    Some(lookup) => index.query(lookup, *ascending),
                    None => ordered_stream(index, *ascending, !index.definition().ignore_nulls),
                })?;
                Ok(Opened::Stream {
                    stream: Box::new(IndexEntryStream {
                        cursor,
                        keys,
                        composite: index.definition().is_composite(),
                    }),
                    sorted: true,
                })
            }
            SourcePlan::Count { .. } => Err(SombraError::Invalid("count plans are not streamed")),
        }
    }
}

/// Opens a cursor on `index`, recording the probe in the query metrics.
fn probe<'i, F>(index: &'i dyn Index, ctx: &mut ExecutionContext, open: F) -> Result<IndexCursor<'i>>
where
    F: FnOnce(&'i dyn Index) -> Result<IndexCursor<'i>>,
{
    let timer = profile_timer();
    let cursor = open(index)?;
    record_profile_timer(QueryProfileKind::IndexProbe, timer);
    ctx.stats.involved_indexes.insert(index.name().to_owned());
    if index.definition().is_composite() {
        ctx.stats.composite_index_used += 1;
    }
    Ok(cursor)
}

fn log_probe_failure(index: &dyn Index, clause: &str, err: &SombraError) {
    match err {
        SombraError::Query(query_err) => warn!(
            index = index.name(),
            clause,
            error = %QueryErrorWithCode(query_err),
            "index probe rejected"
        ),
        other => warn!(
            index = index.name(),
            clause,
            code = other.code(),
            error = %other,
            "index probe failed"
        ),
    }
}

/// Whole-index walk with null keys first when ascending and last otherwise.
fn ordered_stream(index: &dyn Index, ascending: bool, include_nulls: bool) -> Result<IndexCursor<'_>> {
    let values = index.stream(ascending)?;
    if !include_nulls {
        return Ok(values);
    }
    let nulls = index.null_entries()?;
    Ok(if ascending {
        Box::new(nulls.chain(values))
    } else {
        Box::new(values.chain(nulls))
    })
}

struct ScanStream<'a> {
    cursor: RecordCursor<'a>,
    timer: Option<Instant>,
}

impl RecordStream for ScanStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        match self.cursor.next() {
            Some(record) => record.map(Some),
            None => {
                record_profile_timer(QueryProfileKind::Scan, self.timer.take());
                Ok(None)
            }
        }
    }
}

struct RidListStream<'a> {
    rids: std::slice::Iter<'a, Rid>,
    store: &'a dyn RecordStore,
    seen: FxHashSet<Rid>,
}

impl RecordStream for RidListStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        for rid in self.rids.by_ref() {
            if !self.seen.insert(*rid) {
                continue;
            }
            if let Some(record) = self.store.load(*rid)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// Branch cursors drained one after another, each RID loaded once. Records
/// deleted since they were indexed are skipped.
struct IndexUnionStream<'a> {
    cursors: Vec<IndexCursor<'a>>,
    current: usize,
    store: &'a dyn RecordStore,
    seen: SharedRids,
}

impl RecordStream for IndexUnionStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        while self.current < self.cursors.len() {
            let Some(entry) = self.cursors[self.current].next() else {
                self.current += 1;
                continue;
            };
            let IndexEntry { rid, .. } = entry?;
            if !self.seen.lock().insert(rid) {
                continue;
            }
            if let Some(record) = self.store.load(rid)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

struct ConcatStream<'a> {
    inputs: Vec<BoxRecordStream<'a>>,
    current: usize,
}

impl RecordStream for ConcatStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        while self.current < self.inputs.len() {
            match self.inputs[self.current].try_next()? {
                Some(record) => return Ok(Some(record)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}

/// K-way merge of individually ordered streams by ORDER BY key. Ties go to
/// the earlier input.
struct MergeStream<'a> {
    inputs: Vec<BoxRecordStream<'a>>,
    heads: Vec<Option<(Vec<Value>, Record)>>,
    primed: bool,
    order: &'a [OrderItem],
    store: &'a dyn RecordStore,
    timer: Option<Instant>,
}

impl<'a> MergeStream<'a> {
    fn new(inputs: Vec<BoxRecordStream<'a>>, order: &'a [OrderItem], store: &'a dyn RecordStore) -> Self {
        let heads = inputs.iter().map(|_| None).collect();
        Self {
            inputs,
            heads,
            primed: false,
            order,
            store,
            timer: profile_timer(),
        }
    }

    fn refill(&mut self, idx: usize) -> Result<()> {
        self.heads[idx] = match self.inputs[idx].try_next()? {
            Some(record) => {
                let mut key = Vec::with_capacity(self.order.len());
                for item in self.order {
                    key.push(resolve_chain(&record, &item.field, self.store)?);
                }
                Some((key, record))
            }
            None => None,
        };
        Ok(())
    }
}

impl RecordStream for MergeStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        if !self.primed {
            for idx in 0..self.inputs.len() {
                self.refill(idx)?;
            }
            self.primed = true;
        }
        let mut best: Option<usize> = None;
        for (idx, head) in self.heads.iter().enumerate() {
            let Some((key, _)) = head else {
                continue;
            };
            let better = match best.and_then(|b| self.heads[b].as_ref()) {
                Some((best_key, _)) => compare_keys(self.order, key, best_key).is_lt(),
                None => true,
            };
            if better {
                best = Some(idx);
            }
        }
        let Some(idx) = best else {
            record_profile_timer(QueryProfileKind::Merge, self.timer.take());
            return Ok(None);
        };
        let head = self.heads[idx].take();
        self.refill(idx)?;
        Ok(head.map(|(_, record)| record))
    }
}

/// Index target entries exposed as `{key, rid}` records.
struct IndexEntryStream<'a> {
    cursor: IndexCursor<'a>,
    keys: &'a KeyFilter,
    composite: bool,
}

impl RecordStream for IndexEntryStream<'_> {
    fn try_next(&mut self) -> Result<Option<Record>> {
        let IndexEntry { key, rid } = loop {
            let Some(entry) = self.cursor.next() else {
                return Ok(None);
            };
            let entry = entry?;
            if self.keys.matches(&entry.key) {
                break entry;
            }
        };
        let key = if self.composite {
            Value::List(key.into_vec())
        } else {
            key.into_iter().next().unwrap_or(Value::Null)
        };
        Ok(Some(
            Record::new(rid, String::new())
                .with(INDEX_KEY, key)
                .with(INDEX_RID, Value::Link(rid)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Direction, Projection};
    use crate::query::index::{IndexDefinition, IndexKind};
    use crate::query::memory::MemoryDatabase;
    use crate::query::options::TimeoutStrategy;
    use std::time::Duration;

    fn executor(db: &Arc<MemoryDatabase>) -> Executor {
        Executor::for_database(Arc::clone(db), ExecutorOptions::default())
    }

    fn people() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new();
        db.create_class("Person", None).unwrap();
        db.create_index(
            "Person.name",
            IndexKind::NotUnique,
            IndexDefinition::new("Person", ["name"]),
        )
        .unwrap();
        for (name, age) in [("Ann", 31i64), ("Bob", 25), ("Cid", 47), ("Dee", 25)] {
            db.insert("Person", |r| r.with("name", name).with("age", age))
                .unwrap();
        }
        Arc::new(db)
    }

    #[test]
    fn index_lookup_reads_only_matching_records() {
        let db = people();
        let mut ctx = ExecutionContext::new();
        let query = SelectQuery::from_class("Person").filter(ConditionNode::eq("name", "Cid"));
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("age"), Value::Int(47));
        assert_eq!(ctx.stats.document_reads, 1);
        assert!(ctx.stats.involved_indexes.contains("Person.name"));
    }

    #[test]
    fn failing_index_falls_back_to_scan() {
        let db = people();
        db.memory_index("Person.name").unwrap().set_failing(true);
        let mut ctx = ExecutionContext::new();
        let query = SelectQuery::from_class("Person").filter(ConditionNode::eq("name", "Cid"));
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(ctx.stats.document_reads, 4);
        assert!(ctx.stats.involved_indexes.is_empty());
    }

    #[test]
    fn sorted_index_walk_orders_and_limits() {
        let db = people();
        let mut ctx = ExecutionContext::new();
        let query = SelectQuery::from_class("Person")
            .order_by("name", Direction::Desc)
            .limit(2);
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        let names: Vec<Value> = rows.iter().map(|r| r.get("name")).collect();
        assert_eq!(names, vec![Value::from("Dee"), Value::from("Cid")]);
        assert!(ctx.stats.fully_sorted_by_index);
        assert_eq!(ctx.stats.document_reads, 2);
    }

    #[test]
    fn let_bindings_feed_filter_and_projection() {
        let db = people();
        let mut ctx = ExecutionContext::new().with_variable("min", 30i64);
        let query = SelectQuery::from_class("Person")
            .let_var("$years", crate::query::condition::Operand::field("age"))
            .filter(ConditionNode::compare(
                crate::query::condition::Operand::variable("$years"),
                crate::query::condition::Operator::GreaterOrEquals,
                crate::query::condition::Operand::variable("$min"),
            ))
            .project(Projection::aliased(
                crate::query::condition::Operand::variable("$years"),
                "y",
            ))
            .order_by("y", Direction::Asc);
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        let years: Vec<Value> = rows.iter().map(|r| r.get("y")).collect();
        assert_eq!(years, vec![Value::Int(31), Value::Int(47)]);
    }

    #[test]
    fn index_target_rows_are_key_rid_pairs() {
        let db = people();
        let mut ctx = ExecutionContext::new();
        let query = SelectQuery::from_index("Person.name")
            .filter(ConditionNode::ge("key", "Bob"))
            .order_by("key", Direction::Asc);
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        let keys: Vec<Value> = rows.iter().map(|r| r.get(INDEX_KEY)).collect();
        assert_eq!(keys, vec![Value::from("Bob"), Value::from("Cid"), Value::from("Dee")]);
        assert!(rows.iter().all(|r| r.rid.is_none()));
        assert!(matches!(rows[0].get(INDEX_RID), Value::Link(_)));
    }

    #[test]
    fn composite_index_target_answers_key_ranges() {
        let db = people();
        db.create_index(
            "Person.name_age",
            IndexKind::NotUnique,
            IndexDefinition::new("Person", ["name", "age"]),
        )
        .unwrap();
        let exec = executor(&db);
        let pair = |name: &str, age: i64| Value::List(vec![Value::from(name), Value::Int(age)]);
        let keys = |filter: ConditionNode| -> Vec<Value> {
            let query = SelectQuery::from_index("Person.name_age")
                .filter(filter)
                .order_by("key", Direction::Asc);
            let rows = exec.collect(&query, &mut ExecutionContext::new()).unwrap();
            rows.iter().map(|r| r.get(INDEX_KEY)).collect()
        };

        assert_eq!(
            keys(ConditionNode::ge("key", "Bob")),
            vec![pair("Bob", 25), pair("Cid", 47), pair("Dee", 25)]
        );
        assert_eq!(
            keys(ConditionNode::ge("key", pair("Cid", 47))),
            vec![pair("Cid", 47), pair("Dee", 25)]
        );
        assert_eq!(keys(ConditionNode::lt("key", "Bob")), vec![pair("Ann", 31)]);
        assert_eq!(
            keys(ConditionNode::and(
                ConditionNode::gt("key", pair("Bob", 25)),
                ConditionNode::le("key", "Cid"),
            )),
            vec![pair("Cid", 47)]
        );
        assert_eq!(
            keys(ConditionNode::between("key", pair("Ann", 40), pair("Cid", 47))),
            vec![pair("Bob", 25), pair("Cid", 47)]
        );
        assert_eq!(keys(ConditionNode::eq("key", pair("Bob", 25))), vec![pair("Bob", 25)]);
        assert!(keys(ConditionNode::and(
            ConditionNode::eq("key", "Bob"),
            ConditionNode::lt("key", pair("Bob", 20)),
        ))
        .is_empty());
    }

    #[test]
    fn zero_deadline_with_return_strategy_ends_without_rows() {
        let db = people();
        let query = SelectQuery::from_class("Person");
        let mut ctx = ExecutionContext::new().with_timeout(Duration::ZERO, TimeoutStrategy::Return);
        let mut sink = CollectingSink::new();
        let outcome = executor(&db).execute(&query, &mut ctx, &mut sink).unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.rows_delivered, 0);
        assert!(sink.rows.is_empty());

        let query = SelectQuery::from_class("Person").timeout(Duration::ZERO, TimeoutStrategy::Exception);
        let mut ctx = ExecutionContext::new();
        let mut slow = SlowSink::default();
        let err = executor(&db).execute(&query, &mut ctx, &mut slow).unwrap_err();
        assert_eq!(err.code(), "Timeout");
    }

    #[derive(Default)]
    struct SlowSink;

    impl ResultSink for SlowSink {
        fn push(&mut self, _row: Row) -> bool {
            std::thread::sleep(Duration::from_millis(2));
            true
        }
    }

    #[test]
    fn count_star_skips_record_reads() {
        let db = people();
        let mut ctx = ExecutionContext::new();
        let query = SelectQuery::from_class("Person").project(Projection::count_all());
        let rows = executor(&db).collect(&query, &mut ctx).unwrap();
        assert_eq!(rows[0].get("count"), Value::Int(4));
        assert_eq!(ctx.stats.document_reads, 0);
    }

    #[test]
    fn record_targets_skip_missing_and_duplicate_rids() {
        let db = people();
        let rid = Rid::new(db.clusters("Person")[0].0, 0);
        let query = SelectQuery::from_records([rid, Rid::new(999, 0), rid]);
        let rows = executor(&db)
            .collect(&query, &mut ExecutionContext::new())
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
