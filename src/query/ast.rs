//! Parsed SELECT statement handed over by the command layer.
//!
//! Nothing here parses SQL text. Callers build a [`SelectQuery`] with the
//! fluent methods below, the same way a parser front end would fill it in.

use std::fmt;
use std::time::Duration;

use crate::query::condition::{ConditionNode, FieldChain, Operand};
use crate::query::errors::QueryError;
use crate::query::options::TimeoutStrategy;
use crate::types::{ClusterId, Result, Rid};

/// Where rows come from.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// Records of a class; `polymorphic` includes every subclass.
    Class {
        /// Class name.
        name: String,
        /// Whether subclass records are included.
        polymorphic: bool,
    },
    /// Records of explicit clusters.
    Clusters(Vec<ClusterId>),
    /// Entries of a named index, delivered as `{key, rid}` rows.
    Index(String),
    /// Literal record list.
    Records(Vec<Rid>),
    /// Context variable holding a link or a list of links.
    Variable(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Class { name, polymorphic: true } => write!(f, "{name}"),
            Target::Class { name, polymorphic: false } => write!(f, "{name} (exact)"),
            Target::Clusters(ids) => {
                let ids: Vec<String> = ids.iter().map(|c| c.to_string()).collect();
                write!(f, "cluster:[{}]", ids.join(", "))
            }
            Target::Index(name) => write!(f, "index:{name}"),
            Target::Records(rids) => {
                let rids: Vec<String> = rids.iter().map(|r| r.to_string()).collect();
                write!(f, "[{}]", rids.join(", "))
            }
            Target::Variable(name) => write!(f, "${name}"),
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

impl Direction {
    /// SQL keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// One ORDER BY item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderItem {
    /// Field, attribute or projection alias.
    pub field: FieldChain,
    /// Direction.
    pub direction: Direction,
}

impl OrderItem {
    /// Order item from a dotted path.
    pub fn new(path: &str, direction: Direction) -> Self {
        Self {
            field: FieldChain::parse(path),
            direction,
        }
    }
}

/// Aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateFn {
    /// Row count, or non-null count with a field.
    Count,
    /// Numeric sum.
    Sum,
    /// Smallest non-null value.
    Min,
    /// Largest non-null value.
    Max,
    /// Mean of numeric values.
    Avg,
}

impl AggregateFn {
    /// Function name, also the default alias.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Avg => "avg",
        }
    }
}

/// One projection.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    /// Plain expression.
    Expr {
        /// Projected operand.
        expr: Operand,
        /// Output name.
        alias: String,
    },
    /// Aggregate over the group.
    Aggregate {
        /// Function.
        func: AggregateFn,
        /// Argument; `None` means `*`.
        field: Option<FieldChain>,
        /// Output name.
        alias: String,
    },
}

impl Projection {
    /// Field projection aliased by the last path segment.
    pub fn field(path: &str) -> Self {
        let chain = FieldChain::parse(path);
        let alias = chain.last().to_owned();
        Projection::Expr {
            expr: Operand::Field(chain),
            alias,
        }
    }

    /// Expression projection with an explicit alias.
    pub fn aliased(expr: Operand, alias: &str) -> Self {
        Projection::Expr {
            expr,
            alias: alias.to_owned(),
        }
    }

    /// `count(*)`
    pub fn count_all() -> Self {
        Projection::Aggregate {
            func: AggregateFn::Count,
            field: None,
            alias: AggregateFn::Count.as_str().to_owned(),
        }
    }

    /// Aggregate over a field, aliased by the function name.
    pub fn aggregate(func: AggregateFn, path: &str) -> Self {
        Projection::Aggregate {
            func,
            field: Some(FieldChain::parse(path)),
            alias: func.as_str().to_owned(),
        }
    }

    /// Replaces the output name.
    pub fn alias(mut self, name: &str) -> Self {
        match &mut self {
            Projection::Expr { alias, .. } | Projection::Aggregate { alias, .. } => {
                *alias = name.to_owned()
            }
        }
        self
    }

    /// Output name.
    pub fn output_name(&self) -> &str {
        match self {
            Projection::Expr { alias, .. } | Projection::Aggregate { alias, .. } => alias,
        }
    }

    /// Whether this is an aggregate.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Projection::Aggregate { .. })
    }
}

/// LIMIT value meaning "no limit".
pub const NO_LIMIT: i64 = -1;

/// A SELECT statement.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectQuery {
    /// Row source.
    pub target: Target,
    /// WHERE clause.
    pub filter: Option<ConditionNode>,
    /// LET bindings, evaluated per record in order.
    pub lets: Vec<(String, Operand)>,
    /// Projections; empty selects whole records.
    pub projections: Vec<Projection>,
    /// ORDER BY.
    pub order_by: Vec<OrderItem>,
    /// GROUP BY.
    pub group_by: Vec<FieldChain>,
    /// LIMIT, `-1` for none.
    pub limit: i64,
    /// SKIP.
    pub skip: i64,
    /// UNWIND fields.
    pub unwind: Vec<String>,
    /// EXPAND argument.
    pub expand: Option<FieldChain>,
    /// PARALLEL hint.
    pub parallel: bool,
    /// TIMEOUT clause.
    pub timeout: Option<(Duration, TimeoutStrategy)>,
}

impl SelectQuery {
    /// Query over a target with every clause empty.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            filter: None,
            lets: Vec::new(),
            projections: Vec::new(),
            order_by: Vec::new(),
            group_by: Vec::new(),
            limit: NO_LIMIT,
            skip: 0,
            unwind: Vec::new(),
            expand: None,
            parallel: false,
            timeout: None,
        }
    }

    /// `SELECT FROM class` including subclasses.
    pub fn from_class(name: &str) -> Self {
        Self::new(Target::Class {
            name: name.to_owned(),
            polymorphic: true,
        })
    }

    /// `SELECT FROM class` restricted to the class's own records.
    pub fn from_class_exact(name: &str) -> Self {
        Self::new(Target::Class {
            name: name.to_owned(),
            polymorphic: false,
        })
    }

    /// `SELECT FROM cluster:[..]`
    pub fn from_clusters(clusters: impl IntoIterator<Item = ClusterId>) -> Self {
        Self::new(Target::Clusters(clusters.into_iter().collect()))
    }

    /// `SELECT FROM index:name`
    pub fn from_index(name: &str) -> Self {
        Self::new(Target::Index(name.to_owned()))
    }

    /// `SELECT FROM [#c:p, ..]`
    pub fn from_records(rids: impl IntoIterator<Item = Rid>) -> Self {
        Self::new(Target::Records(rids.into_iter().collect()))
    }

    /// `SELECT FROM $name`
    pub fn from_variable(name: &str) -> Self {
        Self::new(Target::Variable(name.trim_start_matches('$').to_owned()))
    }

    /// Sets WHERE, replacing any previous filter.
    pub fn filter(mut self, condition: ConditionNode) -> Self {
        self.filter = Some(condition);
        self
    }

    /// Adds a LET binding.
    pub fn let_var(mut self, name: &str, value: Operand) -> Self {
        self.lets
            .push((name.trim_start_matches('$').to_owned(), value));
        self
    }

    /// Adds a projection.
    pub fn project(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    /// Appends an ORDER BY item.
    pub fn order_by(mut self, path: &str, direction: Direction) -> Self {
        self.order_by.push(OrderItem::new(path, direction));
        self
    }

    /// Appends a GROUP BY field.
    pub fn group_by(mut self, path: &str) -> Self {
        self.group_by.push(FieldChain::parse(path));
        self
    }

    /// Sets LIMIT.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Sets SKIP.
    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = skip;
        self
    }

    /// Appends an UNWIND field.
    pub fn unwind(mut self, field: &str) -> Self {
        self.unwind.push(field.to_owned());
        self
    }

    /// Sets EXPAND.
    pub fn expand(mut self, path: &str) -> Self {
        self.expand = Some(FieldChain::parse(path));
        self
    }

    /// Sets the PARALLEL hint.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets TIMEOUT.
    pub fn timeout(mut self, limit: Duration, strategy: TimeoutStrategy) -> Self {
        self.timeout = Some((limit, strategy));
        self
    }

    /// Whether any projection aggregates.
    pub fn has_aggregates(&self) -> bool {
        self.projections.iter().any(Projection::is_aggregate)
    }

    /// Whether rows are bucketed before delivery.
    pub fn is_grouping(&self) -> bool {
        !self.group_by.is_empty() || self.has_aggregates()
    }

    /// LIMIT as a count, `None` for unlimited.
    pub fn limit_count(&self) -> Option<usize> {
        usize::try_from(self.limit).ok()
    }

    /// SKIP as a count.
    pub fn skip_count(&self) -> usize {
        usize::try_from(self.skip).unwrap_or(0)
    }

    /// Rejects clause combinations that can never run.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit < NO_LIMIT {
            return Err(QueryError::InvalidLimit { limit: self.limit }.into());
        }
        if self.skip < 0 {
            return Err(QueryError::InvalidSkip { skip: self.skip }.into());
        }
        if self.expand.is_some() && !self.projections.is_empty() {
            return Err(QueryError::ExpandWithProjections.into());
        }
        Ok(())
    }

    /// True when ORDER BY is a single `@rid` item.
    pub fn is_rid_only_sort(&self) -> bool {
        self.order_by.len() == 1
            && !self.order_by[0].field.is_long()
            && self.order_by[0].field.first() == crate::query::record::RID_ATTR
    }
}
