//! Result pipeline: projection, GROUP BY, ORDER BY buffering, EXPAND, UNWIND,
//! SKIP and LIMIT.
//!
//! Rows are streamed straight to the sink when nothing downstream needs the
//! full result set (no pending sort, no aggregation, no EXPAND or UNWIND).
//! Otherwise they are buffered and delivered by [`ResultPipeline::finish`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::query::ast::{AggregateFn, Direction, OrderItem, Projection, SelectQuery, Target};
use crate::query::condition::{resolve_chain, EvalScope, FieldChain};
use crate::query::context::{ExecutionContext, QueryPhase};
use crate::query::options::ExecutorOptions;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::record::{Record, Row};
use crate::query::storage::{RecordStore, ResultSink};
use crate::query::value::Value;
use crate::types::Result;

/// Column name of non-record values produced by EXPAND.
pub const EXPAND_VALUE: &str = "value";

enum Payload {
    Row(Row),
    Expand(Value),
}

struct Pending {
    key: Vec<Value>,
    payload: Payload,
}

pub(crate) struct ResultPipeline<'q> {
    query: &'q SelectQuery,
    streaming: bool,
    sort_pending: bool,
    limit: Option<usize>,
    skip: usize,
    skipped: usize,
    delivered: usize,
    buffer: Vec<Pending>,
    partial_sort: Option<(usize, usize)>,
    grouping: Option<Grouping>,
    tip_threshold: usize,
    tip_logged: bool,
}

impl<'q> ResultPipeline<'q> {
    pub(crate) fn new(query: &'q SelectQuery, order_satisfied: bool, options: &ExecutorOptions) -> Self {
        let sort_pending = !query.order_by.is_empty() && !order_satisfied;
        let grouping = query.is_grouping();
        let reshapes = query.expand.is_some() || !query.unwind.is_empty();
        let streaming = !sort_pending && !grouping && !reshapes;
        let limit = query.limit_count();
        let skip = query.skip_count();
        let partial_sort = match limit {
            Some(limit) if sort_pending && !grouping && !reshapes => {
                let keep = limit.saturating_add(1).saturating_add(skip);
                Some((keep.saturating_add(options.partial_sort_slack), keep))
            }
            _ => None,
        };
        debug!(streaming, sort_pending, grouping, "result pipeline mode");
        Self {
            query,
            streaming,
            sort_pending,
            limit,
            skip,
            skipped: 0,
            delivered: 0,
            buffer: Vec::new(),
            partial_sort,
            grouping: grouping.then(|| Grouping::new(query)),
            tip_threshold: options.tip_limit_threshold,
            tip_logged: false,
        }
    }

    /// Whether rows go to the sink as soon as they are accepted.
    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Takes one record that passed the filter. Returns `Ok(false)` once no
    /// further input can change the result.
    pub(crate) fn accept(
        &mut self,
        record: Record,
        scope: &EvalScope<'_>,
        sink: &mut dyn ResultSink,
    ) -> Result<bool> {
        if let Some(grouping) = self.grouping.as_mut() {
            grouping.accept(&record, scope)?;
            return Ok(true);
        }
        if self.streaming {
            if self.skipped < self.skip {
                self.skipped += 1;
                return Ok(true);
            }
            let row = project(self.query, &record, scope)?;
            return Ok(self.deliver(row, sink));
        }

        let (payload, row) = match &self.query.expand {
            Some(chain) => (Payload::Expand(resolve_chain(&record, chain, scope.store)?), None),
            None => {
                let row = project(self.query, &record, scope)?;
                (Payload::Row(row.clone()), Some(row))
            }
        };
        let key = if self.sort_pending {
            sort_key(self.query, &record, row.as_ref(), scope.store)?
        } else {
            Vec::new()
        };
        self.buffer.push(Pending { key, payload });
        if let Some((threshold, keep)) = self.partial_sort {
            if self.buffer.len() >= threshold {
                self.sort_buffer();
                self.buffer.truncate(keep);
            }
        }
        Ok(true)
    }

    /// Delivers everything still buffered and returns the number of rows the
    /// sink received.
    pub(crate) fn finish(
        mut self,
        ctx: &mut ExecutionContext,
        store: &dyn RecordStore,
        sink: &mut dyn ResultSink,
    ) -> Result<usize> {
        ctx.set_phase(QueryPhase::Filtered);
        if self.streaming {
            ctx.set_phase(QueryPhase::Limited);
            ctx.set_phase(QueryPhase::Delivered);
            return Ok(self.delivered);
        }

        let rows = if let Some(grouping) = self.grouping.take() {
            let mut rows = grouping.finish();
            ctx.set_phase(QueryPhase::Grouped);
            if !self.query.order_by.is_empty() {
                let timer = profile_timer();
                let order = &self.query.order_by;
                rows.sort_by(|a, b| {
                    let ka: Vec<Value> = order.iter().map(|item| a.get(&item.field.to_string())).collect();
                    let kb: Vec<Value> = order.iter().map(|item| b.get(&item.field.to_string())).collect();
                    compare_keys(order, &ka, &kb)
                });
                record_profile_timer(QueryProfileKind::Sort, timer);
            }
            rows
        } else {
            if self.sort_pending {
                self.sort_buffer();
            }
            let mut rows = Vec::with_capacity(self.buffer.len());
            for pending in std::mem::take(&mut self.buffer) {
                match pending.payload {
                    Payload::Row(row) => rows.push(row),
                    Payload::Expand(value) => expand_value(value, store, &mut rows)?,
                }
            }
            rows
        };
        ctx.set_phase(QueryPhase::Sorted);

        let rows = unwind(rows, &self.query.unwind);
        let end = self
            .limit
            .map_or(usize::MAX, |limit| self.skip.saturating_add(limit));
        ctx.set_phase(QueryPhase::Limited);
        for row in rows.into_iter().take(end).skip(self.skip) {
            if !self.deliver(row, sink) {
                break;
            }
        }
        ctx.set_phase(QueryPhase::Delivered);
        Ok(self.delivered)
    }

    fn deliver(&mut self, row: Row, sink: &mut dyn ResultSink) -> bool {
        self.delivered += 1;
        if self.limit.is_none() && !self.tip_logged && self.delivered > self.tip_threshold {
            self.tip_logged = true;
            warn!(
                rows = self.delivered,
                "query returned more than {} rows without LIMIT; consider adding one", self.tip_threshold
            );
        }
        let more = sink.push(row);
        more && self.limit.map_or(true, |limit| self.delivered < limit)
    }

    fn sort_buffer(&mut self) {
        let timer = profile_timer();
        let order = &self.query.order_by;
        self.buffer.sort_by(|a, b| compare_keys(order, &a.key, &b.key));
        record_profile_timer(QueryProfileKind::Sort, timer);
    }
}

/// Row for a record under the query's plain projections. Without projections
/// the whole record is returned. Index target rows carry no identity.
fn project(query: &SelectQuery, record: &Record, scope: &EvalScope<'_>) -> Result<Row> {
    let identity = !matches!(query.target, Target::Index(_));
    if query.projections.is_empty() {
        let mut row = Row::from_record(record);
        if !identity {
            row.rid = None;
        }
        return Ok(row);
    }
    let mut fields = BTreeMap::new();
    for projection in &query.projections {
        if let Projection::Expr { expr, alias } = projection {
            fields.insert(alias.clone(), expr.resolve(record, scope)?);
        }
    }
    Ok(Row {
        rid: identity.then_some(record.rid),
        fields,
    })
}

/// ORDER BY key: a projection alias wins over a record field of the same name.
fn sort_key(
    query: &SelectQuery,
    record: &Record,
    row: Option<&Row>,
    store: &dyn RecordStore,
) -> Result<Vec<Value>> {
    let mut key = Vec::with_capacity(query.order_by.len());
    for item in &query.order_by {
        let alias = (!item.field.is_long())
            .then(|| item.field.first())
            .filter(|name| query.projections.iter().any(|p| p.output_name() == *name));
        let value = match (alias, row) {
            (Some(name), Some(row)) => row.get(name),
            _ => resolve_chain(record, &item.field, store)?,
        };
        key.push(value);
    }
    Ok(key)
}

pub(crate) fn compare_keys(order: &[OrderItem], a: &[Value], b: &[Value]) -> Ordering {
    for (i, item) in order.iter().enumerate() {
        let ord = match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        };
        let ord = match item.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn expand_value(value: Value, store: &dyn RecordStore, out: &mut Vec<Row>) -> Result<()> {
    match value {
        Value::List(items) => {
            for item in items {
                expand_one(item, store, out)?;
            }
            Ok(())
        }
        other => expand_one(other, store, out),
    }
}

fn expand_one(value: Value, store: &dyn RecordStore, out: &mut Vec<Row>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Link(rid) => {
            if let Some(record) = store.load(rid)? {
                out.push(Row::from_record(&record));
            }
        }
        other => {
            let mut fields = BTreeMap::new();
            fields.insert(EXPAND_VALUE.to_owned(), other);
            out.push(Row::computed(fields));
        }
    }
    Ok(())
}

fn unwind(mut rows: Vec<Row>, fields: &[String]) -> Vec<Row> {
    for field in fields {
        let mut next = Vec::with_capacity(rows.len());
        for mut row in rows {
            let items = match row.fields.get(field) {
                Some(Value::List(items)) => items.clone(),
                _ => {
                    next.push(row);
                    continue;
                }
            };
            if items.is_empty() {
                row.fields.insert(field.clone(), Value::Null);
                next.push(row);
                continue;
            }
            for item in items {
                let mut copy = row.clone();
                copy.fields.insert(field.clone(), item);
                next.push(copy);
            }
        }
        rows = next;
    }
    rows
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    All,
    Single(Value),
    Composite(String),
}

#[derive(Clone, Debug, Default)]
struct Accumulator {
    rows: u64,
    non_null: u64,
    numeric: u64,
    int_sum: Option<i64>,
    float_sum: f64,
    min: Option<Value>,
    max: Option<Value>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            int_sum: Some(0),
            ..Self::default()
        }
    }

    fn feed(&mut self, value: Option<Value>) {
        self.rows += 1;
        let Some(value) = value else {
            return;
        };
        if value.is_null() {
            return;
        }
        self.non_null += 1;
        if let Some(number) = value.as_f64() {
            self.numeric += 1;
            self.float_sum += number;
            self.int_sum = match (&value, self.int_sum) {
                (Value::Int(v), Some(sum)) => sum.checked_add(*v),
                _ => None,
            };
        }
        if self.min.as_ref().map_or(true, |min| value < *min) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |max| value > *max) {
            self.max = Some(value);
        }
    }

    fn result(&self, func: AggregateFn, counts_rows: bool) -> Value {
        match func {
            AggregateFn::Count if counts_rows => Value::Int(self.rows as i64),
            AggregateFn::Count => Value::Int(self.non_null as i64),
            AggregateFn::Sum if self.numeric == 0 => Value::Null,
            AggregateFn::Sum => match self.int_sum {
                Some(sum) => Value::Int(sum),
                None => Value::Float(self.float_sum),
            },
            AggregateFn::Min => self.min.clone().unwrap_or(Value::Null),
            AggregateFn::Max => self.max.clone().unwrap_or(Value::Null),
            AggregateFn::Avg if self.numeric == 0 => Value::Null,
            AggregateFn::Avg => Value::Float(self.float_sum / self.numeric as f64),
        }
    }
}

enum Slot {
    Expr(Option<Value>),
    Aggregate(Accumulator),
}

struct GroupState {
    first_row: Option<Row>,
    slots: Vec<Slot>,
}

struct Grouping {
    projections: Vec<Projection>,
    group_by: Vec<FieldChain>,
    index: BTreeMap<GroupKey, usize>,
    groups: Vec<GroupState>,
}

impl Grouping {
    fn new(query: &SelectQuery) -> Self {
        Self {
            projections: query.projections.clone(),
            group_by: query.group_by.clone(),
            index: BTreeMap::new(),
            groups: Vec::new(),
        }
    }

    fn fresh_state(&self) -> GroupState {
        GroupState {
            first_row: None,
            slots: self
                .projections
                .iter()
                .map(|projection| match projection {
                    Projection::Expr { .. } => Slot::Expr(None),
                    Projection::Aggregate { .. } => Slot::Aggregate(Accumulator::new()),
                })
                .collect(),
        }
    }

    fn key(&self, record: &Record, scope: &EvalScope<'_>) -> Result<GroupKey> {
        match self.group_by.as_slice() {
            [] => Ok(GroupKey::All),
            [single] => Ok(GroupKey::Single(resolve_chain(record, single, scope.store)?)),
            many => {
                let mut parts = Vec::with_capacity(many.len());
                for chain in many {
                    parts.push(resolve_chain(record, chain, scope.store)?.key_string());
                }
                Ok(GroupKey::Composite(parts.join(",")))
            }
        }
    }

    fn accept(&mut self, record: &Record, scope: &EvalScope<'_>) -> Result<()> {
        let key = self.key(record, scope)?;
        let slot = match self.index.get(&key) {
            Some(slot) => *slot,
            None => {
                let state = self.fresh_state();
                self.groups.push(state);
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let state = &mut self.groups[slot];
        if self.projections.is_empty() && state.first_row.is_none() {
            state.first_row = Some(Row::from_record(record));
        }
        for (projection, slot) in self.projections.iter().zip(state.slots.iter_mut()) {
            match (projection, slot) {
                (Projection::Expr { expr, .. }, Slot::Expr(value)) => {
                    if value.is_none() {
                        *value = Some(expr.resolve(record, scope)?);
                    }
                }
                (Projection::Aggregate { field, .. }, Slot::Aggregate(acc)) => {
                    let value = match field {
                        Some(chain) => Some(resolve_chain(record, chain, scope.store)?),
                        None => None,
                    };
                    acc.feed(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Vec<Row> {
        let aggregates = self.projections.iter().any(Projection::is_aggregate);
        if self.groups.is_empty() && self.group_by.is_empty() && aggregates {
            let state = self.fresh_state();
            self.groups.push(state);
        }
        let projections = self.projections;
        self.groups
            .into_iter()
            .map(|state| {
                if let Some(row) = state.first_row {
                    return row;
                }
                let fields = projections
                    .iter()
                    .zip(state.slots)
                    .map(|(projection, slot)| {
                        let value = match (projection, slot) {
                            (_, Slot::Expr(value)) => value.unwrap_or(Value::Null),
                            (Projection::Aggregate { func, field, .. }, Slot::Aggregate(acc)) => {
                                acc.result(*func, field.is_none())
                            }
                            (Projection::Expr { .. }, Slot::Aggregate(_)) => Value::Null,
                        };
                        (projection.output_name().to_owned(), value)
                    })
                    .collect();
                Row::computed(fields)
            })
            .collect()
    }
}
