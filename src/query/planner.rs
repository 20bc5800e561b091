//! Rule-based SELECT planner: index-vs-scan choice, ORDER BY satisfaction,
//! polymorphic fan-out, parallel eligibility and explain output.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::ops::Bound;
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::query::analyzer::FilterAnalyzer;
use crate::query::ast::{AggregateFn, Direction, OrderItem, Projection, SelectQuery, Target};
use crate::query::condition::{between_bounds, ConditionNode, Operand, Operator};
use crate::query::context::ExecutionContext;
use crate::query::errors::QueryError;
use crate::query::index::{
    compare_key_prefix, key_within, Index, IndexKind, IndexQuery, KeyParams, MapIndexBy,
};
use crate::query::index_search::IndexSearchResult;
use crate::query::metadata::{IndexCatalog, IndexOrder, SchemaCatalog};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::rewrite::{merge_range_conditions, rid_range};
use crate::query::storage::{RecordStore, RidRange, ScanDirection};
use crate::query::value::Value;
use crate::types::{ClusterId, Result, Rid};

/// Planner inputs that influence rule selection.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Fold range pairs into BETWEEN before analysis.
    pub between_rewrite: bool,
    /// Record count a scan must exceed to run in parallel.
    pub parallel_min_records: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            between_rewrite: true,
            parallel_min_records: 300_000,
        }
    }
}

/// Planner output containing the chosen plan and its explain tree.
#[derive(Clone, Debug)]
pub struct PlannerOutput {
    /// The plan to execute.
    pub plan: QueryPlan,
    /// Human-readable explain tree.
    pub explain: PlanExplain,
    /// Deterministic plan hash.
    pub plan_hash: u64,
}

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

impl PlanExplain {
    /// JSON rendering of the tree.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "plan_hash": format!("{:016x}", self.plan_hash),
            "root": self.root.to_json(),
        })
    }
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    pub props: Vec<ExplainProp>,
    /// Input operators
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Value of the first property named `key`.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }

    /// Depth-first search for an operator.
    pub fn find(&self, op: &str) -> Option<&ExplainNode> {
        if self.op == op {
            return Some(self);
        }
        self.inputs.iter().find_map(|input| input.find(op))
    }

    fn to_json(&self) -> serde_json::Value {
        let props: serde_json::Map<String, serde_json::Value> = self
            .props
            .iter()
            .map(|prop| (prop.key.clone(), serde_json::Value::String(prop.value.clone())))
            .collect();
        serde_json::json!({
            "op": self.op,
            "props": props,
            "inputs": self.inputs.iter().map(ExplainNode::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Restricts loaded records to the target class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassFilter {
    /// Target class.
    pub class: String,
    /// Whether subclass records qualify.
    pub polymorphic: bool,
}

/// Storage scan over a cluster set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPlan {
    /// Clusters in ascending id order.
    pub clusters: Vec<ClusterId>,
    /// Iteration order.
    pub direction: ScanDirection,
    /// RID bounds hint.
    pub range: RidRange,
}

/// One way to serve an OR-branch from an index.
#[derive(Clone, Debug)]
pub struct IndexCandidate {
    /// Index to probe.
    pub index: Arc<dyn Index>,
    /// Lookup to run.
    pub query: IndexQuery,
    /// Iterate in ascending key order.
    pub ascending: bool,
    /// Lookup emits rows in ORDER BY order.
    pub sorted: bool,
    /// Analyzer result the lookup was derived from.
    pub search: IndexSearchResult,
}

/// Ranked candidates for one OR-branch. The executor uses the first one that
/// opens without error.
#[derive(Clone, Debug)]
pub struct BranchPlan {
    /// Candidates, best first.
    pub candidates: Vec<IndexCandidate>,
}

/// Where source records come from.
#[derive(Clone, Debug)]
pub enum SourcePlan {
    /// Literal RIDs, loaded one by one.
    Records(Vec<Rid>),
    /// Storage scan.
    Scan(ScanPlan),
    /// Union of per-branch index lookups, deduplicated by RID.
    IndexUnion(Vec<BranchPlan>),
    /// Whole-index walk satisfying ORDER BY without a filter lookup.
    SortedIndex {
        /// Index to walk.
        index: Arc<dyn Index>,
        /// Walk direction.
        ascending: bool,
    },
    /// Per-subclass sources merged by ORDER BY, deduplicated by RID.
    Polymorphic(Vec<SourcePlan>),
    /// `SELECT FROM index:name`.
    IndexTarget {
        /// Index read.
        index: Arc<dyn Index>,
        /// Lookup derived from the `key` filter; `None` walks everything.
        query: Option<IndexQuery>,
        /// Every `key` constraint, checked on each entry the lookup yields.
        keys: KeyFilter,
        /// Walk direction.
        ascending: bool,
    },
    /// `count(*)` answered from cluster sizes.
    Count {
        /// Counted clusters.
        clusters: Vec<ClusterId>,
        /// Output column.
        alias: String,
    },
}

/// `key` constraints of an index-target filter. A list literal names the
/// leading components of a composite key; a scalar names the first one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyFilter {
    exact: Vec<KeyParams>,
    any_of: Vec<Vec<KeyParams>>,
    lower: Vec<Bound<KeyParams>>,
    upper: Vec<Bound<KeyParams>>,
}

impl KeyFilter {
    /// True when `key` satisfies every constraint.
    pub fn matches(&self, key: &[Value]) -> bool {
        let equal = |params: &KeyParams| compare_key_prefix(key, params) == Some(Ordering::Equal);
        self.exact.iter().all(equal)
            && self.any_of.iter().all(|keys| keys.iter().any(equal))
            && self
                .lower
                .iter()
                .all(|lower| key_within(key, lower, &Bound::Unbounded))
            && self
                .upper
                .iter()
                .all(|upper| key_within(key, &Bound::Unbounded, upper))
    }
}

/// Executable plan for one SELECT.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Record source.
    pub source: SourcePlan,
    /// Filter re-applied to every source record.
    pub filter: Option<ConditionNode>,
    /// Class restriction for index-driven sources.
    pub class_filter: Option<ClassFilter>,
    /// Scan used when an index fails to open.
    pub fallback: Option<ScanPlan>,
    /// The source emits rows in ORDER BY order.
    pub order_satisfied: bool,
    /// Order comes from an index walk rather than from RID order.
    pub fully_sorted_by_index: bool,
    /// Some chosen index also matches ORDER BY.
    pub index_is_used_in_order_by: bool,
    /// Scan runs one task per cluster.
    pub parallel: bool,
    /// Range pairs folded into BETWEEN.
    pub range_query_converted_in_between: usize,
}

/// Query planner.
pub struct Planner {
    config: PlannerConfig,
    schema: Arc<dyn SchemaCatalog>,
    indexes: Arc<dyn IndexCatalog>,
    store: Arc<dyn RecordStore>,
}

struct BranchSelection {
    branches: Vec<BranchPlan>,
    fully_sorted: bool,
    used_in_order_by: bool,
}

impl Planner {
    /// Creates a planner over the given collaborators.
    pub fn new(
        config: PlannerConfig,
        schema: Arc<dyn SchemaCatalog>,
        indexes: Arc<dyn IndexCatalog>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            config,
            schema,
            indexes,
            store,
        }
    }

    /// Validates `query` and chooses how to run it.
    pub fn plan(&self, query: &SelectQuery, ctx: &ExecutionContext) -> Result<PlannerOutput> {
        let timer = profile_timer();
        query.validate()?;
        let (filter, conversions) = match &query.filter {
            Some(filter) if self.config.between_rewrite => {
                let (rewritten, count) = merge_range_conditions(filter);
                (Some(rewritten), count)
            }
            other => (other.clone(), 0),
        };
        let mut plan = match &query.target {
            Target::Class { name, polymorphic } => {
                self.plan_class(name, *polymorphic, filter, query, ctx)?
            }
            Target::Clusters(ids) => self.plan_clusters(ids, filter, query)?,
            Target::Index(name) => self.plan_index_target(name, filter, query)?,
            Target::Records(rids) => record_plan(rids.clone(), filter, query),
            Target::Variable(name) => {
                let value = ctx
                    .variables()
                    .get(name)
                    .ok_or_else(|| QueryError::UnknownVariable { name: name.clone() })?;
                record_plan(links_of(value), filter, query)
            }
        };
        plan.range_query_converted_in_between = conversions;
        plan.parallel = self.parallel_eligible(&plan, query, ctx)?;
        let root = explain_plan(&plan, query);
        let plan_hash = compute_plan_hash(&root);
        debug!(
            query_target = %query.target,
            source = root.inputs.first().map(|n| n.op.as_str()).unwrap_or("none"),
            fully_sorted = plan.fully_sorted_by_index,
            parallel = plan.parallel,
            "select planned"
        );
        record_profile_timer(QueryProfileKind::Plan, timer);
        Ok(PlannerOutput {
            plan,
            explain: PlanExplain { root, plan_hash },
            plan_hash,
        })
    }

    fn plan_class(
        &self,
        class: &str,
        polymorphic: bool,
        filter: Option<ConditionNode>,
        query: &SelectQuery,
        ctx: &ExecutionContext,
    ) -> Result<QueryPlan> {
        if !self.schema.class_exists(class) {
            return Err(QueryError::UnknownClass {
                class: class.to_owned(),
            }
            .into());
        }
        let scan = ScanPlan {
            clusters: self.schema.target_clusters(class, polymorphic),
            direction: scan_direction(query),
            range: rid_range(filter.as_ref()),
        };
        let class_filter = Some(ClassFilter {
            class: class.to_owned(),
            polymorphic,
        });
        let mut plan = QueryPlan {
            source: SourcePlan::Scan(scan.clone()),
            filter: None,
            class_filter,
            fallback: Some(scan.clone()),
            order_satisfied: query.order_by.is_empty() || query.is_rid_only_sort(),
            fully_sorted_by_index: false,
            index_is_used_in_order_by: false,
            parallel: false,
            range_query_converted_in_between: 0,
        };

        if let Some(alias) = count_shortcut(query) {
            plan.source = SourcePlan::Count {
                clusters: scan.clusters,
                alias,
            };
            plan.order_satisfied = true;
            return Ok(plan);
        }

        if let Some(condition) = &filter {
            if let Some(selection) = self.search_for_indexes(class, condition, query, ctx) {
                plan.source = SourcePlan::IndexUnion(selection.branches);
                plan.order_satisfied = query.order_by.is_empty() || selection.fully_sorted;
                plan.fully_sorted_by_index = selection.fully_sorted;
                plan.index_is_used_in_order_by = selection.used_in_order_by;
                plan.filter = filter;
                return Ok(plan);
            }
            if polymorphic && !self.schema.subclasses(class).is_empty() {
                if let Some((children, sorted)) =
                    self.search_for_subclass_indexes(class, condition, query, ctx, scan.range)
                {
                    plan.source = SourcePlan::Polymorphic(children);
                    plan.order_satisfied = query.order_by.is_empty() || sorted;
                    plan.fully_sorted_by_index = sorted && !query.order_by.is_empty();
                    plan.filter = filter;
                    return Ok(plan);
                }
            }
        }

        if !query.order_by.is_empty() && !query.is_rid_only_sort() {
            if let Some((index, ascending)) = self.optimized_sort_index(class, query) {
                debug!(class, index = index.name(), "ORDER BY served by index walk");
                plan.source = SourcePlan::SortedIndex { index, ascending };
                plan.order_satisfied = true;
                plan.fully_sorted_by_index = true;
                plan.index_is_used_in_order_by = true;
                plan.filter = filter;
                return Ok(plan);
            }
        }

        plan.fallback = None;
        plan.class_filter = None;
        plan.filter = filter;
        Ok(plan)
    }

    fn search_for_indexes(
        &self,
        class: &str,
        filter: &ConditionNode,
        query: &SelectQuery,
        ctx: &ExecutionContext,
    ) -> Option<BranchSelection> {
        let analyzer = FilterAnalyzer::new(
            self.schema.as_ref(),
            self.indexes.as_ref(),
            ctx.variables(),
        );
        let branches = analyzer.analyze_main_condition(class, filter);
        let single_branch = branches.len() == 1;
        let mut selection = BranchSelection {
            branches: Vec::with_capacity(branches.len()),
            fully_sorted: false,
            used_in_order_by: false,
        };
        for branch in &branches {
            let mut candidates = Vec::new();
            for result in branch {
                let mut involved = analyzer.involved_indexes(class, result);
                involved.sort_by(|a, b| self.compare_indexes(a.as_ref(), b.as_ref(), &query.order_by));
                for index in involved {
                    if let Some(candidate) = self.candidate(index, result, query, single_branch) {
                        candidates.push(candidate);
                    }
                }
            }
            let Some(first) = candidates.first() else {
                debug!(class, "OR-branch has no usable index, scanning");
                return None;
            };
            if first.index.kind() != IndexKind::Proxy
                && self.can_be_used_by_order_by(first.index.as_ref(), &query.order_by)
            {
                selection.used_in_order_by = true;
            }
            selection.fully_sorted |= first.sorted;
            selection.branches.push(BranchPlan { candidates });
        }
        Some(selection)
    }

    /// Ascending declared-field count; ties go to an index that also serves
    /// ORDER BY.
    fn compare_indexes(&self, a: &dyn Index, b: &dyn Index, order: &[OrderItem]) -> Ordering {
        let usable = |index: &dyn Index| {
            index.kind() != IndexKind::Proxy && self.can_be_used_by_order_by(index, order)
        };
        a.definition()
            .param_count()
            .cmp(&b.definition().param_count())
            .then_with(|| usable(b).cmp(&usable(a)))
    }

    fn candidate(
        &self,
        index: Arc<dyn Index>,
        result: &IndexSearchResult,
        query: &SelectQuery,
        single_branch: bool,
    ) -> Option<IndexCandidate> {
        let definition = index.definition();
        if result.contains_null_values && definition.ignore_nulls {
            return None;
        }
        let fields = result.fields();
        if definition.fields.len() < fields.len() {
            return None;
        }
        let operator = result.last_operator;
        if !operator.is_equality_class() {
            let position = result.field_value_pairs().len();
            if definition.fields.get(position).map(String::as_str) != Some(result.last_field.last()) {
                return None;
            }
        }
        match operator {
            Operator::ContainsKey if definition.map_by != MapIndexBy::Key => return None,
            Operator::ContainsValue if definition.map_by != MapIndexBy::Value => return None,
            _ => {}
        }
        let params: KeyParams = definition.fields[..fields.len()]
            .iter()
            .map(|field| {
                result
                    .field_value(field)
                    .cloned()
                    .unwrap_or_else(|| result.last_value.clone())
            })
            .collect();
        let lookup = build_index_query(operator, params, &result.last_value)?;

        let order_usable = index.kind() != IndexKind::Proxy
            && self.can_be_used_by_order_by(index.as_ref(), &query.order_by);
        let sorted = order_usable
            && single_branch
            && query.expand.is_none()
            && definition.fields.len() >= query.order_by.len();
        let ascending = if order_usable {
            let wanted = query.order_by[0].direction == Direction::Asc;
            wanted == (self.indexes.declared_order(index.as_ref()) != IndexOrder::Descending)
        } else {
            true
        };
        Some(IndexCandidate {
            index,
            query: lookup,
            ascending,
            sorted,
            search: result.clone(),
        })
    }

    fn can_be_used_by_order_by(&self, index: &dyn Index, order: &[OrderItem]) -> bool {
        if order.is_empty() || !index.supports_ordered_iteration() {
            return false;
        }
        if self.indexes.declared_order(index) == IndexOrder::None {
            return false;
        }
        let direction = order[0].direction;
        let fields = &index.definition().fields;
        let n = fields.len().min(order.len());
        (0..n).all(|i| {
            order[i].direction == direction
                && !order[i].field.is_long()
                && order[i].field.first() == fields[i]
        })
    }

    fn search_for_subclass_indexes(
        &self,
        class: &str,
        filter: &ConditionNode,
        query: &SelectQuery,
        ctx: &ExecutionContext,
        range: RidRange,
    ) -> Option<(Vec<SourcePlan>, bool)> {
        let mut children = Vec::new();
        let mut sorted = !query.order_by.is_empty();
        if !self.schema.is_abstract(class) {
            children.push(SourcePlan::Scan(ScanPlan {
                clusters: self.schema.target_clusters(class, false),
                direction: ScanDirection::Ascending,
                range,
            }));
            sorted = false;
        }
        for sub in self.schema.subclasses(class) {
            if let Some(selection) = self.search_for_indexes(&sub, filter, query, ctx) {
                sorted &= selection.fully_sorted;
                children.push(SourcePlan::IndexUnion(selection.branches));
                continue;
            }
            if !self.schema.subclasses(&sub).is_empty() {
                let (nested, nested_sorted) =
                    self.search_for_subclass_indexes(&sub, filter, query, ctx, range)?;
                sorted &= nested_sorted;
                children.push(SourcePlan::Polymorphic(nested));
                continue;
            }
            if self.schema.is_abstract(&sub) {
                continue;
            }
            debug!(class, subclass = %sub, "subclass has no usable index, abandoning fan-out");
            return None;
        }
        Some((children, sorted))
    }

    fn optimized_sort_index(
        &self,
        class: &str,
        query: &SelectQuery,
    ) -> Option<(Arc<dyn Index>, bool)> {
        if query
            .order_by
            .iter()
            .any(|item| item.field.is_long() || item.field.is_attribute())
        {
            return None;
        }
        let fields: Vec<String> = query
            .order_by
            .iter()
            .map(|item| item.field.first().to_owned())
            .collect();
        let mut candidates: Vec<Arc<dyn Index>> = self
            .indexes
            .indexes_covering_fields(class, &fields)
            .into_iter()
            .filter(|index| {
                !index.definition().ignore_nulls
                    && self.can_be_used_by_order_by(index.as_ref(), &query.order_by)
            })
            .collect();
        candidates.sort_by_key(|index| index.definition().param_count());
        let index = candidates.into_iter().next()?;
        let wanted = query.order_by[0].direction == Direction::Asc;
        let ascending = wanted == (self.indexes.declared_order(index.as_ref()) != IndexOrder::Descending);
        Some((index, ascending))
    }

    fn plan_clusters(
        &self,
        ids: &[ClusterId],
        filter: Option<ConditionNode>,
        query: &SelectQuery,
    ) -> Result<QueryPlan> {
        if let Some(missing) = ids.iter().find(|id| !self.schema.cluster_exists(**id)) {
            return Err(QueryError::UnknownCluster { cluster: missing.0 }.into());
        }
        let mut clusters = ids.to_vec();
        clusters.sort_unstable();
        clusters.dedup();
        let range = rid_range(filter.as_ref());
        Ok(QueryPlan {
            source: SourcePlan::Scan(ScanPlan {
                clusters,
                direction: scan_direction(query),
                range,
            }),
            filter,
            class_filter: None,
            fallback: None,
            order_satisfied: query.order_by.is_empty() || query.is_rid_only_sort(),
            fully_sorted_by_index: false,
            index_is_used_in_order_by: false,
            parallel: false,
            range_query_converted_in_between: 0,
        })
    }

    fn plan_index_target(
        &self,
        name: &str,
        filter: Option<ConditionNode>,
        query: &SelectQuery,
    ) -> Result<QueryPlan> {
        let index = self
            .indexes
            .index_by_name(name)
            .ok_or_else(|| QueryError::UnknownIndex {
                index: name.to_owned(),
            })?;
        if let Some(item) = query
            .order_by
            .iter()
            .find(|item| item.field.is_long() || item.field.first() != INDEX_KEY)
        {
            return Err(QueryError::UnsupportedIndexOrder {
                index: name.to_owned(),
                field: item.field.to_string(),
            }
            .into());
        }
        let (lookup, keys) = match &filter {
            Some(condition) => {
                let (lookup, keys) = index_target_query(index.as_ref(), condition)?;
                (Some(lookup), keys)
            }
            None => (None, KeyFilter::default()),
        };
        let ordered = index.supports_ordered_iteration();
        let ascending = query
            .order_by
            .first()
            .map_or(true, |item| item.direction == Direction::Asc);
        Ok(QueryPlan {
            source: SourcePlan::IndexTarget {
                index,
                query: lookup,
                keys,
                ascending,
            },
            filter: None,
            class_filter: None,
            fallback: None,
            order_satisfied: query.order_by.is_empty() || ordered,
            fully_sorted_by_index: !query.order_by.is_empty() && ordered,
            index_is_used_in_order_by: !query.order_by.is_empty() && ordered,
            parallel: false,
            range_query_converted_in_between: 0,
        })
    }

    fn parallel_eligible(
        &self,
        plan: &QueryPlan,
        query: &SelectQuery,
        ctx: &ExecutionContext,
    ) -> Result<bool> {
        if !query.parallel || ctx.in_transaction() || !query.order_by.is_empty() {
            return Ok(false);
        }
        let SourcePlan::Scan(scan) = &plan.source else {
            return Ok(false);
        };
        if scan.clusters.len() < 2 {
            return Ok(false);
        }
        let records = self.store.count(&scan.clusters)?;
        Ok(records > self.config.parallel_min_records)
    }
}

/// Field name exposing the key of an index target row.
pub const INDEX_KEY: &str = "key";
/// Field name exposing the RID of an index target row.
pub const INDEX_RID: &str = "rid";

fn record_plan(rids: Vec<Rid>, filter: Option<ConditionNode>, query: &SelectQuery) -> QueryPlan {
    QueryPlan {
        source: SourcePlan::Records(rids),
        filter,
        class_filter: None,
        fallback: None,
        order_satisfied: query.order_by.is_empty(),
        fully_sorted_by_index: false,
        index_is_used_in_order_by: false,
        parallel: false,
        range_query_converted_in_between: 0,
    }
}

fn links_of(value: &Value) -> Vec<Rid> {
    match value {
        Value::Link(rid) => vec![*rid],
        Value::List(items) => items.iter().filter_map(Value::as_link).collect(),
        _ => Vec::new(),
    }
}

fn scan_direction(query: &SelectQuery) -> ScanDirection {
    if query.is_rid_only_sort() && query.order_by[0].direction == Direction::Desc {
        ScanDirection::Descending
    } else {
        ScanDirection::Ascending
    }
}

fn count_shortcut(query: &SelectQuery) -> Option<String> {
    if query.filter.is_some()
        || !query.group_by.is_empty()
        || !query.lets.is_empty()
        || !query.unwind.is_empty()
        || query.expand.is_some()
    {
        return None;
    }
    match query.projections.as_slice() {
        [Projection::Aggregate {
            func: AggregateFn::Count,
            field: None,
            alias,
        }] => Some(alias.clone()),
        _ => None,
    }
}

fn build_index_query(operator: Operator, params: KeyParams, value: &Value) -> Option<IndexQuery> {
    let prefix = || -> KeyParams { params[..params.len().saturating_sub(1)].iter().cloned().collect() };
    let range = |lower: Bound<Value>, upper: Bound<Value>| IndexQuery::Range {
        prefix: prefix(),
        lower,
        upper,
    };
    Some(match operator {
        Operator::Equals | Operator::Contains | Operator::ContainsKey | Operator::ContainsValue => {
            IndexQuery::Exact(params.clone())
        }
        Operator::In => {
            let Value::List(items) = value else {
                return None;
            };
            let base = prefix();
            IndexQuery::In(
                items
                    .iter()
                    .map(|item| {
                        let mut key = base.clone();
                        key.push(item.clone());
                        key
                    })
                    .collect(),
            )
        }
        _ if value.is_null() => return None,
        Operator::Less => range(Bound::Unbounded, Bound::Excluded(value.clone())),
        Operator::LessOrEquals => range(Bound::Unbounded, Bound::Included(value.clone())),
        Operator::Greater => range(Bound::Excluded(value.clone()), Bound::Unbounded),
        Operator::GreaterOrEquals => range(Bound::Included(value.clone()), Bound::Unbounded),
        Operator::Between {
            lower_inclusive,
            upper_inclusive,
        } => {
            let (lower, upper) = between_bounds(value).ok()?;
            if lower.is_null() || upper.is_null() {
                return None;
            }
            range(
                bound(lower, lower_inclusive),
                bound(upper, upper_inclusive),
            )
        }
        _ => return None,
    })
}

fn bound(value: &Value, inclusive: bool) -> Bound<Value> {
    if inclusive {
        Bound::Included(value.clone())
    } else {
        Bound::Excluded(value.clone())
    }
}

/// Converts an index-target filter on `key` into one lookup plus the full
/// set of key constraints. Every conjunct must compare `key` with a constant.
fn index_target_query(index: &dyn Index, filter: &ConditionNode) -> Result<(IndexQuery, KeyFilter)> {
    let unsupported = |node: &ConditionNode| QueryError::UnsupportedIndexFilter {
        index: index.name().to_owned(),
        clause: node.to_string(),
    };
    let composite = index.definition().is_composite();
    let key_params = |value: &Value| -> KeyParams {
        match value {
            Value::List(items) if composite => items.iter().cloned().collect(),
            other => SmallVec::from_elem(other.clone(), 1),
        }
    };
    let key_bound = |bound: &Bound<Value>| match bound {
        Bound::Included(value) => Bound::Included(key_params(value)),
        Bound::Excluded(value) => Bound::Excluded(key_params(value)),
        Bound::Unbounded => Bound::Unbounded,
    };
    let mut keys = KeyFilter::default();
    let mut lower = Bound::Unbounded;
    let mut upper = Bound::Unbounded;
    for conjunct in conjuncts(filter) {
        let ConditionNode::Compare(cmp) = conjunct else {
            return Err(unsupported(conjunct).into());
        };
        let cmp = cmp.field_on_left().ok_or_else(|| unsupported(conjunct))?;
        let is_key = cmp
            .left
            .as_field()
            .is_some_and(|chain| !chain.is_long() && chain.first() == INDEX_KEY);
        let Operand::Literal(value) = &cmp.right else {
            return Err(unsupported(conjunct).into());
        };
        if !is_key {
            return Err(unsupported(conjunct).into());
        }
        let (lo, hi) = match cmp.operator {
            Operator::Equals => {
                keys.exact.push(key_params(value));
                continue;
            }
            Operator::In => {
                let items = match value {
                    Value::List(items) => items.clone(),
                    other => vec![other.clone()],
                };
                keys.any_of.push(items.iter().map(key_params).collect());
                continue;
            }
            Operator::Greater => (Some(bound(value, false)), None),
            Operator::GreaterOrEquals => (Some(bound(value, true)), None),
            Operator::Less => (None, Some(bound(value, false))),
            Operator::LessOrEquals => (None, Some(bound(value, true))),
            Operator::Between {
                lower_inclusive,
                upper_inclusive,
            } => {
                let (lo, hi) = between_bounds(value)?;
                (Some(bound(lo, lower_inclusive)), Some(bound(hi, upper_inclusive)))
            }
            _ => return Err(unsupported(conjunct).into()),
        };
        if let Some(lo) = lo {
            keys.lower.push(key_bound(&lo));
            lower = tighter_lower(lower, lo);
        }
        if let Some(hi) = hi {
            keys.upper.push(key_bound(&hi));
            upper = tighter_upper(upper, hi);
        }
    }
    let lookup = if let Some(params) = keys.exact.first() {
        IndexQuery::Exact(params.clone())
    } else if let Some(any_of) = keys.any_of.first() {
        IndexQuery::In(any_of.clone())
    } else if composite {
        IndexQuery::KeyRange {
            lower: keys.lower.first().cloned().unwrap_or(Bound::Unbounded),
            upper: keys.upper.first().cloned().unwrap_or(Bound::Unbounded),
        }
    } else {
        IndexQuery::Range {
            prefix: KeyParams::new(),
            lower,
            upper,
        }
    };
    Ok((lookup, keys))
}

fn conjuncts(node: &ConditionNode) -> Vec<&ConditionNode> {
    match node {
        ConditionNode::And(left, right) => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        other => vec![other],
    }
}

fn bound_value(bound: &Bound<Value>) -> Option<&Value> {
    match bound {
        Bound::Included(v) | Bound::Excluded(v) => Some(v),
        Bound::Unbounded => None,
    }
}

fn tighter_lower(current: Bound<Value>, candidate: Bound<Value>) -> Bound<Value> {
    match (bound_value(&current), bound_value(&candidate)) {
        (None, _) => candidate,
        (_, None) => current,
        (Some(a), Some(b)) => match a.cmp(b) {
            Ordering::Less => candidate,
            Ordering::Greater => current,
            Ordering::Equal if matches!(candidate, Bound::Excluded(_)) => candidate,
            Ordering::Equal => current,
        },
    }
}

fn tighter_upper(current: Bound<Value>, candidate: Bound<Value>) -> Bound<Value> {
    match (bound_value(&current), bound_value(&candidate)) {
        (None, _) => candidate,
        (_, None) => current,
        (Some(a), Some(b)) => match a.cmp(b) {
            Ordering::Greater => candidate,
            Ordering::Less => current,
            Ordering::Equal if matches!(candidate, Bound::Excluded(_)) => candidate,
            Ordering::Equal => current,
        },
    }
}

fn explain_plan(plan: &QueryPlan, query: &SelectQuery) -> ExplainNode {
    let mut root = ExplainNode::new("Select");
    root.props.push(ExplainProp::plain("target", query.target.to_string()));
    if let Some(filter) = &plan.filter {
        root.props.push(ExplainProp::literal("filter", filter.to_string()));
    }
    if !query.order_by.is_empty() {
        let order: Vec<String> = query
            .order_by
            .iter()
            .map(|item| format!("{} {}", item.field, item.direction.as_str()))
            .collect();
        root.props.push(ExplainProp::plain("order_by", order.join(", ")));
    }
    if query.limit >= 0 {
        root.props.push(ExplainProp::plain("limit", query.limit.to_string()));
    }
    if query.skip > 0 {
        root.props.push(ExplainProp::plain("skip", query.skip.to_string()));
    }
    root.props.push(ExplainProp::plain(
        "fullySortedByIndex",
        plan.fully_sorted_by_index.to_string(),
    ));
    root.props.push(ExplainProp::plain(
        "indexIsUsedInOrderBy",
        plan.index_is_used_in_order_by.to_string(),
    ));
    if plan.range_query_converted_in_between > 0 {
        root.props.push(ExplainProp::plain(
            "rangeQueryConvertedInBetween",
            plan.range_query_converted_in_between.to_string(),
        ));
    }
    if plan.parallel {
        root.props.push(ExplainProp::plain("parallel", "true"));
    }
    root.inputs.push(explain_source(&plan.source));
    root
}

fn explain_source(source: &SourcePlan) -> ExplainNode {
    match source {
        SourcePlan::Records(rids) => {
            let mut node = ExplainNode::new("RecordList");
            node.props.push(ExplainProp::plain("count", rids.len().to_string()));
            node
        }
        SourcePlan::Scan(scan) => {
            let mut node = ExplainNode::new("ClusterScan");
            let clusters: Vec<String> = scan.clusters.iter().map(|c| c.to_string()).collect();
            node.props.push(ExplainProp::plain("clusters", clusters.join(",")));
            node.props.push(ExplainProp::plain(
                "direction",
                match scan.direction {
                    ScanDirection::Ascending => "asc",
                    ScanDirection::Descending => "desc",
                },
            ));
            if !scan.range.is_unbounded() {
                let from = scan.range.from.map(|r| r.to_string()).unwrap_or_default();
                let to = scan.range.to.map(|r| r.to_string()).unwrap_or_default();
                node.props.push(ExplainProp::literal("range", format!("{from}..{to}")));
            }
            node
        }
        SourcePlan::IndexUnion(branches) => {
            let mut node = ExplainNode::new("IndexUnion");
            node.props.push(ExplainProp::plain("branches", branches.len().to_string()));
            for branch in branches {
                let mut branch_node = ExplainNode::new("IndexBranch");
                for candidate in &branch.candidates {
                    let mut lookup = ExplainNode::new("IndexLookup");
                    lookup.props.push(ExplainProp::plain("index", candidate.index.name()));
                    lookup.props.push(ExplainProp::plain("kind", candidate.index.kind().as_str()));
                    lookup.props.push(ExplainProp::literal("query", candidate.query.to_string()));
                    lookup.props.push(ExplainProp::plain(
                        "compositeIndexUsed",
                        candidate.index.definition().is_composite().to_string(),
                    ));
                    if candidate.sorted {
                        lookup.props.push(ExplainProp::plain("sorted", "true"));
                    }
                    branch_node.inputs.push(lookup);
                }
                node.inputs.push(branch_node);
            }
            node
        }
        SourcePlan::SortedIndex { index, ascending } => {
            let mut node = ExplainNode::new("SortedIndexScan");
            node.props.push(ExplainProp::plain("index", index.name()));
            node.props.push(ExplainProp::plain(
                "direction",
                if *ascending { "asc" } else { "desc" },
            ));
            node
        }
        SourcePlan::Polymorphic(children) => {
            let mut node = ExplainNode::new("PolymorphicMerge");
            node.inputs = children.iter().map(explain_source).collect();
            node
        }
        SourcePlan::IndexTarget {
            index,
            query,
            ascending,
            ..
        } => {
            let mut node = ExplainNode::new("IndexTarget");
            node.props.push(ExplainProp::plain("index", index.name()));
            if let Some(query) = query {
                node.props.push(ExplainProp::literal("query", query.to_string()));
            }
            node.props.push(ExplainProp::plain(
                "direction",
                if *ascending { "asc" } else { "desc" },
            ));
            node
        }
        SourcePlan::Count { clusters, alias } => {
            let mut node = ExplainNode::new("CountShortcut");
            node.props.push(ExplainProp::plain("clusters", clusters.len().to_string()));
            node.props.push(ExplainProp::plain("alias", alias.clone()));
            node
        }
    }
}

fn compute_plan_hash(root: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(root, &mut hasher);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

/// Groups explain props by key, mainly for tests and tooling.
pub fn explain_props(node: &ExplainNode) -> BTreeMap<&str, &str> {
    node.props
        .iter()
        .map(|prop| (prop.key.as_str(), prop.value.as_str()))
        .collect()
}
