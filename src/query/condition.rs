//! Predicate tree consumed by the analyzer, the planner and the row filter.
//!
//! The tree is built by the command layer and never mutated here. Each
//! operator reports its own capabilities ([`Operator::index_reuse_type`],
//! [`Operator::is_equality_class`], [`Operator::can_be_merged`]) so the
//! analyzer can dispatch on a closed enum instead of probing types.

use std::collections::BTreeMap;
use std::fmt;

use crate::query::errors::QueryError;
use crate::query::record::Record;
use crate::query::storage::RecordStore;
use crate::query::value::Value;
use crate::types::Result;

/// Dotted path of property names, e.g. `address.city.name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldChain {
    items: Vec<String>,
}

impl FieldChain {
    /// Builds a chain from its segments. Empty input yields a single empty segment.
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            items.push(String::new());
        }
        Self { items }
    }

    /// Splits a dotted path into a chain.
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('.'))
    }

    /// True when the chain crosses more than one record.
    pub fn is_long(&self) -> bool {
        self.items.len() > 1
    }

    /// Number of segments.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Segment at `idx`.
    pub fn item(&self, idx: usize) -> &str {
        &self.items[idx]
    }

    /// First segment, the field on the queried class.
    pub fn first(&self) -> &str {
        &self.items[0]
    }

    /// Last segment, the field on the final linked class.
    pub fn last(&self) -> &str {
        &self.items[self.items.len() - 1]
    }

    /// All segments.
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// True for `@rid`, `@class` and other record attributes.
    pub fn is_attribute(&self) -> bool {
        !self.is_long() && self.items[0].starts_with('@')
    }
}

impl fmt::Display for FieldChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.items.join("."))
    }
}

/// One side of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Field (or field chain) of the current record.
    Field(FieldChain),
    /// Constant.
    Literal(Value),
    /// `$name` variable bound by LET or by the execution context.
    Variable(String),
}

impl Operand {
    /// Field operand from a dotted path.
    pub fn field(path: &str) -> Self {
        Operand::Field(FieldChain::parse(path))
    }

    /// Literal operand.
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    /// Variable operand; a leading `$` is stripped.
    pub fn variable(name: &str) -> Self {
        Operand::Variable(name.trim_start_matches('$').to_owned())
    }

    /// Returns the field chain when this operand is a field reference.
    pub fn as_field(&self) -> Option<&FieldChain> {
        match self {
            Operand::Field(chain) => Some(chain),
            _ => None,
        }
    }

    /// Evaluates the operand against a record.
    pub fn resolve(&self, record: &Record, scope: &EvalScope<'_>) -> Result<Value> {
        match self {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Variable(name) => Ok(scope.variable(name)),
            Operand::Field(chain) => resolve_chain(record, chain, scope.store),
        }
    }

    /// Evaluates an operand that does not depend on the current record.
    pub fn resolve_constant(&self, variables: &BTreeMap<String, Value>) -> Option<Value> {
        match self {
            Operand::Literal(value) => Some(value.clone()),
            Operand::Variable(name) => Some(variables.get(name).cloned().unwrap_or(Value::Null)),
            Operand::Field(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Field(chain) => write!(f, "{chain}"),
            Operand::Literal(value) => write!(f, "{value}"),
            Operand::Variable(name) => write!(f, "${name}"),
        }
    }
}

/// Follows a field chain through linked records. Unresolvable hops read as null.
pub fn resolve_chain(record: &Record, chain: &FieldChain, store: &dyn RecordStore) -> Result<Value> {
    let mut current = record.get(chain.first());
    for item in &chain.items()[1..] {
        current = step(current, item, store)?;
    }
    Ok(current)
}

fn step(value: Value, item: &str, store: &dyn RecordStore) -> Result<Value> {
    Ok(match value {
        Value::Link(rid) => match store.load(rid)? {
            Some(linked) => linked.get(item),
            None => Value::Null,
        },
        Value::Map(mut entries) => entries.remove(item).unwrap_or(Value::Null),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for entry in items {
                out.push(step(entry, item, store)?);
            }
            Value::List(out)
        }
        _ => Value::Null,
    })
}

/// How a condition node can be served by indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexReuseType {
    /// AND: children may combine into one composite lookup.
    Intersection,
    /// OR: each branch needs its own lookup, results are unioned.
    Union,
    /// Field-vs-value comparison that maps to a single index lookup.
    Method,
    /// Not indexable; handled by filtering.
    None,
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Equals,
    /// `<>`
    NotEquals,
    /// `<`
    Less,
    /// `<=`
    LessOrEquals,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEquals,
    /// `BETWEEN lower AND upper`; the right operand is a two-element list.
    Between {
        /// Lower bound is inclusive.
        lower_inclusive: bool,
        /// Upper bound is inclusive.
        upper_inclusive: bool,
    },
    /// `IN [..]`
    In,
    /// `CONTAINS`
    Contains,
    /// `CONTAINSKEY`
    ContainsKey,
    /// `CONTAINSVALUE`
    ContainsValue,
    /// `LIKE` with `%` and `_` wildcards.
    Like,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl Operator {
    /// Inclusive SQL `BETWEEN`.
    pub const BETWEEN: Operator = Operator::Between {
        lower_inclusive: true,
        upper_inclusive: true,
    };

    /// SQL keyword for explain output.
    pub fn keyword(&self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "<>",
            Operator::Less => "<",
            Operator::LessOrEquals => "<=",
            Operator::Greater => ">",
            Operator::GreaterOrEquals => ">=",
            Operator::Between { .. } => "BETWEEN",
            Operator::In => "IN",
            Operator::Contains => "CONTAINS",
            Operator::ContainsKey => "CONTAINSKEY",
            Operator::ContainsValue => "CONTAINSVALUE",
            Operator::Like => "LIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Index capability of a field-vs-value comparison using this operator.
    pub fn index_reuse_type(&self) -> IndexReuseType {
        match self {
            Operator::NotEquals | Operator::Like | Operator::IsNotNull => IndexReuseType::None,
            _ => IndexReuseType::Method,
        }
    }

    /// Operators that pin a field to exact key values.
    pub fn is_equality_class(&self) -> bool {
        matches!(
            self,
            Operator::Equals | Operator::Contains | Operator::ContainsKey | Operator::ContainsValue
        )
    }

    /// Whether a search result ending in this operator may merge with another.
    pub fn can_be_merged(&self) -> bool {
        !matches!(self, Operator::Between { .. } | Operator::In)
    }

    /// Range operators that bound a key from below.
    pub fn is_lower_bound(&self) -> bool {
        matches!(self, Operator::Greater | Operator::GreaterOrEquals)
    }

    /// Range operators that bound a key from above.
    pub fn is_upper_bound(&self) -> bool {
        matches!(self, Operator::Less | Operator::LessOrEquals)
    }

    /// Operator to use once operands are swapped so the field sits on the left.
    /// `None` when the swapped form has no equivalent.
    pub fn inverted(&self) -> Option<Operator> {
        match self {
            Operator::Equals => Some(Operator::Equals),
            Operator::NotEquals => Some(Operator::NotEquals),
            Operator::Less => Some(Operator::Greater),
            Operator::LessOrEquals => Some(Operator::GreaterOrEquals),
            Operator::Greater => Some(Operator::Less),
            Operator::GreaterOrEquals => Some(Operator::LessOrEquals),
            Operator::In => Some(Operator::Contains),
            Operator::Contains => Some(Operator::In),
            _ => None,
        }
    }

    /// Applies the operator to resolved operands.
    pub fn evaluate(&self, left: &Value, right: &Value) -> Result<bool> {
        Ok(match self {
            Operator::Equals => left == right,
            Operator::NotEquals => left != right,
            Operator::Less => ordered(left, right).is_some_and(|o| o.is_lt()),
            Operator::LessOrEquals => ordered(left, right).is_some_and(|o| o.is_le()),
            Operator::Greater => ordered(left, right).is_some_and(|o| o.is_gt()),
            Operator::GreaterOrEquals => ordered(left, right).is_some_and(|o| o.is_ge()),
            Operator::Between {
                lower_inclusive,
                upper_inclusive,
            } => {
                let (lower, upper) = between_bounds(right)?;
                let above = ordered(left, lower)
                    .is_some_and(|o| if *lower_inclusive { o.is_ge() } else { o.is_gt() });
                let below = ordered(left, upper)
                    .is_some_and(|o| if *upper_inclusive { o.is_le() } else { o.is_lt() });
                above && below
            }
            Operator::In => match right {
                Value::List(items) => items.iter().any(|item| item == left),
                other => other == left,
            },
            Operator::Contains => match left {
                Value::List(items) => items.iter().any(|item| item == right),
                _ => false,
            },
            Operator::ContainsKey => match (left, right) {
                (Value::Map(entries), Value::String(key)) => entries.contains_key(key),
                _ => false,
            },
            Operator::ContainsValue => match left {
                Value::Map(entries) => entries.values().any(|v| v == right),
                _ => false,
            },
            Operator::Like => match (left, right) {
                (Value::String(text), Value::String(pattern)) => like_matches(text, pattern),
                _ => false,
            },
            Operator::IsNull => left.is_null(),
            Operator::IsNotNull => !left.is_null(),
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Ordering between two non-null values of comparable types.
fn ordered(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    let comparable = matches!(
        (left, right),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Link(_), Value::Link(_))
            | (Value::List(_), Value::List(_))
    );
    comparable.then(|| left.cmp(right))
}

/// Splits the right operand of BETWEEN into its bounds.
pub fn between_bounds(value: &Value) -> Result<(&Value, &Value)> {
    match value {
        Value::List(items) if items.len() == 2 => Ok((&items[0], &items[1])),
        _ => Err(QueryError::OperandShape {
            operator: "BETWEEN",
            expected: "a list of two bounds",
        }
        .into()),
    }
}

/// `%` matches any run of characters and `_` exactly one. A mismatch only
/// backtracks to the most recent `%`.
fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut last_wildcard: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                p += 1;
                last_wildcard = Some((p, t));
            }
            Some(&c) if c == '_' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match last_wildcard {
                Some((resume, consumed)) => {
                    p = resume;
                    t = consumed + 1;
                    last_wildcard = Some((resume, consumed + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

/// Binary comparison node.
#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    /// Left operand.
    pub left: Operand,
    /// Operator.
    pub operator: Operator,
    /// Right operand.
    pub right: Operand,
}

impl Comparison {
    /// Returns an equivalent comparison with the field operand on the left,
    /// or `None` when there is no single field side or the operator cannot be
    /// inverted.
    pub fn field_on_left(&self) -> Option<Comparison> {
        match (&self.left, &self.right) {
            (Operand::Field(_), Operand::Field(_)) => None,
            (Operand::Field(_), _) => Some(self.clone()),
            (_, Operand::Field(_)) => Some(Comparison {
                left: self.right.clone(),
                operator: self.operator.inverted()?,
                right: self.left.clone(),
            }),
            _ => None,
        }
    }

    fn evaluate(&self, record: &Record, scope: &EvalScope<'_>) -> Result<bool> {
        let left = self.left.resolve(record, scope)?;
        let right = match self.operator {
            Operator::IsNull | Operator::IsNotNull => Value::Null,
            _ => self.right.resolve(record, scope)?,
        };
        self.operator.evaluate(&left, &right)
    }
}

/// Boolean predicate tree.
#[derive(Clone, Debug, PartialEq)]
pub enum ConditionNode {
    /// Both children must hold.
    And(Box<ConditionNode>, Box<ConditionNode>),
    /// Either child must hold.
    Or(Box<ConditionNode>, Box<ConditionNode>),
    /// Child must not hold.
    Not(Box<ConditionNode>),
    /// Leaf comparison.
    Compare(Comparison),
}

impl ConditionNode {
    /// `left AND right`
    pub fn and(left: ConditionNode, right: ConditionNode) -> Self {
        ConditionNode::And(Box::new(left), Box::new(right))
    }

    /// `left OR right`
    pub fn or(left: ConditionNode, right: ConditionNode) -> Self {
        ConditionNode::Or(Box::new(left), Box::new(right))
    }

    /// `NOT inner`
    pub fn negate(inner: ConditionNode) -> Self {
        ConditionNode::Not(Box::new(inner))
    }

    /// Generic comparison leaf.
    pub fn compare(left: Operand, operator: Operator, right: Operand) -> Self {
        ConditionNode::Compare(Comparison {
            left,
            operator,
            right,
        })
    }

    fn field_op(path: &str, operator: Operator, value: Value) -> Self {
        Self::compare(Operand::field(path), operator, Operand::Literal(value))
    }

    /// `path = value`
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::Equals, value.into())
    }

    /// `path <> value`
    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::NotEquals, value.into())
    }

    /// `path < value`
    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::Less, value.into())
    }

    /// `path <= value`
    pub fn le(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::LessOrEquals, value.into())
    }

    /// `path > value`
    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::Greater, value.into())
    }

    /// `path >= value`
    pub fn ge(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::GreaterOrEquals, value.into())
    }

    /// `path BETWEEN lower AND upper`
    pub fn between(path: &str, lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Self::field_op(
            path,
            Operator::BETWEEN,
            Value::List(vec![lower.into(), upper.into()]),
        )
    }

    /// `path IN [values]`
    pub fn in_list(path: &str, values: Vec<Value>) -> Self {
        Self::field_op(path, Operator::In, Value::List(values))
    }

    /// `path CONTAINS value`
    pub fn contains(path: &str, value: impl Into<Value>) -> Self {
        Self::field_op(path, Operator::Contains, value.into())
    }

    /// `path LIKE pattern`
    pub fn like(path: &str, pattern: &str) -> Self {
        Self::field_op(path, Operator::Like, Value::from(pattern))
    }

    /// `path IS NULL`
    pub fn is_null(path: &str) -> Self {
        Self::field_op(path, Operator::IsNull, Value::Null)
    }

    /// Index capability of this node.
    pub fn index_reuse_type(&self) -> IndexReuseType {
        match self {
            ConditionNode::And(..) => IndexReuseType::Intersection,
            ConditionNode::Or(..) => IndexReuseType::Union,
            ConditionNode::Not(_) => IndexReuseType::None,
            ConditionNode::Compare(cmp) => {
                let fields = [&cmp.left, &cmp.right]
                    .iter()
                    .filter(|op| matches!(op, Operand::Field(_)))
                    .count();
                if fields != 1 {
                    return IndexReuseType::None;
                }
                if cmp
                    .left
                    .as_field()
                    .or(cmp.right.as_field())
                    .is_some_and(FieldChain::is_attribute)
                {
                    return IndexReuseType::None;
                }
                cmp.operator.index_reuse_type()
            }
        }
    }

    /// Evaluates the predicate for one record.
    pub fn evaluate(&self, record: &Record, scope: &EvalScope<'_>) -> Result<bool> {
        match self {
            ConditionNode::And(left, right) => {
                Ok(left.evaluate(record, scope)? && right.evaluate(record, scope)?)
            }
            ConditionNode::Or(left, right) => {
                Ok(left.evaluate(record, scope)? || right.evaluate(record, scope)?)
            }
            ConditionNode::Not(inner) => Ok(!inner.evaluate(record, scope)?),
            ConditionNode::Compare(cmp) => cmp.evaluate(record, scope),
        }
    }

    /// Collects every field chain referenced by the tree.
    pub fn referenced_fields(&self) -> Vec<&FieldChain> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a FieldChain>) {
        match self {
            ConditionNode::And(l, r) | ConditionNode::Or(l, r) => {
                l.collect_fields(out);
                r.collect_fields(out);
            }
            ConditionNode::Not(inner) => inner.collect_fields(out),
            ConditionNode::Compare(cmp) => {
                out.extend(cmp.left.as_field());
                out.extend(cmp.right.as_field());
            }
        }
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::And(l, r) => write!(f, "({l} AND {r})"),
            ConditionNode::Or(l, r) => write!(f, "({l} OR {r})"),
            ConditionNode::Not(inner) => write!(f, "NOT {inner}"),
            ConditionNode::Compare(cmp) => match cmp.operator {
                Operator::IsNull | Operator::IsNotNull => write!(f, "{} {}", cmp.left, cmp.operator),
                op => write!(f, "{} {} {}", cmp.left, op, cmp.right),
            },
        }
    }
}

/// Evaluation environment for one record: storage for chain hops plus the
/// visible variables (LET results shadow context variables).
pub struct EvalScope<'a> {
    /// Store used to follow links.
    pub store: &'a dyn RecordStore,
    /// Context variables.
    pub variables: &'a BTreeMap<String, Value>,
    /// Per-record LET bindings.
    pub lets: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> EvalScope<'a> {
    /// Scope without LET bindings.
    pub fn new(store: &'a dyn RecordStore, variables: &'a BTreeMap<String, Value>) -> Self {
        Self {
            store,
            variables,
            lets: None,
        }
    }

    /// Returns a copy of this scope that sees `lets`.
    pub fn with_lets(&self, lets: &'a BTreeMap<String, Value>) -> EvalScope<'a> {
        EvalScope {
            store: self.store,
            variables: self.variables,
            lets: Some(lets),
        }
    }

    fn variable(&self, name: &str) -> Value {
        self.lets
            .and_then(|lets| lets.get(name))
            .or_else(|| self.variables.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }
}
