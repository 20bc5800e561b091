//! Candidate index lookups derived from filter sub-branches.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::query::condition::{FieldChain, Operator};
use crate::query::value::Value;

/// One lookup an index could serve: equality-bound fields plus a single
/// terminal condition.
///
/// `field_value_pairs` only ever holds equality-bound fields. The terminal
/// condition (`last_field`, `last_operator`, `last_value`) may be a range,
/// an IN list, or another equality.
#[derive(Clone, Debug)]
pub struct IndexSearchResult {
    field_value_pairs: Vec<(String, Value)>,
    /// Field of the terminal condition; may be a multi-hop chain.
    pub last_field: FieldChain,
    /// Operator of the terminal condition.
    pub last_operator: Operator,
    /// Value of the terminal condition.
    pub last_value: Value,
    /// Whether any bound value is null.
    pub contains_null_values: bool,
}

impl IndexSearchResult {
    /// Result for a single comparison.
    pub fn new(operator: Operator, field: FieldChain, value: Value) -> Self {
        let contains_null_values = match (&operator, &value) {
            (Operator::In, Value::List(items)) => items.iter().any(Value::is_null),
            (Operator::Between { .. }, Value::List(items)) => items.iter().any(Value::is_null),
            _ => value.is_null(),
        };
        Self {
            field_value_pairs: Vec::new(),
            last_field: field,
            last_operator: operator,
            last_value: value,
            contains_null_values,
        }
    }

    /// Equality-bound fields in insertion order.
    pub fn field_value_pairs(&self) -> &[(String, Value)] {
        &self.field_value_pairs
    }

    /// Equality value bound to `field`, if any.
    pub fn field_value(&self, field: &str) -> Option<&Value> {
        self.field_value_pairs
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    fn bind(&mut self, field: &str, value: Value) {
        match self.field_value_pairs.iter_mut().find(|(name, _)| name == field) {
            Some(slot) => slot.1 = value,
            None => self.field_value_pairs.push((field.to_owned(), value)),
        }
    }

    /// Whether two results can fold into one composite lookup.
    pub fn can_be_merged(&self, other: &IndexSearchResult) -> bool {
        if self.last_field.is_long() || other.last_field.is_long() {
            return false;
        }
        if !self.last_operator.can_be_merged() || !other.last_operator.can_be_merged() {
            return false;
        }
        self.last_operator.is_equality_class() || other.last_operator.is_equality_class()
    }

    /// Folds the equality side into the other side's bound fields. Callers
    /// check [`can_be_merged`](Self::can_be_merged) first.
    pub fn merge(&self, other: &IndexSearchResult) -> IndexSearchResult {
        if other.last_operator == Operator::Equals {
            return Self::merge_fields(self, other);
        }
        if self.last_operator == Operator::Equals {
            return Self::merge_fields(other, self);
        }
        if other.last_operator.is_equality_class() {
            return Self::merge_fields(self, other);
        }
        Self::merge_fields(other, self)
    }

    fn merge_fields(main: &IndexSearchResult, anchor: &IndexSearchResult) -> IndexSearchResult {
        let mut result = IndexSearchResult::new(
            main.last_operator,
            main.last_field.clone(),
            main.last_value.clone(),
        );
        for (field, value) in anchor.field_value_pairs.iter().chain(&main.field_value_pairs) {
            result.bind(field, value.clone());
        }
        result.bind(anchor.last_field.first(), anchor.last_value.clone());
        result.contains_null_values = anchor.contains_null_values || main.contains_null_values;
        result
    }

    /// Bound field names followed by the terminal field's first segment. This
    /// is the composite-index prefix the result can satisfy.
    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.field_value_pairs.len() + 1);
        out.extend(self.field_value_pairs.iter().map(|(name, _)| name.clone()));
        out.push(self.last_field.first().to_owned());
        out
    }

    /// Number of fields the lookup constrains.
    pub fn field_count(&self) -> usize {
        self.field_value_pairs.len() + 1
    }
}

impl PartialEq for IndexSearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.field_value_pairs == other.field_value_pairs
            && self.last_field == other.last_field
            && self.last_operator == other.last_operator
            && self.last_value == other.last_value
            && self.contains_null_values == other.contains_null_values
    }
}

impl Eq for IndexSearchResult {}

impl Hash for IndexSearchResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (name, _) in &self.field_value_pairs {
            name.hash(state);
        }
        self.last_field.hash(state);
        self.last_operator.hash(state);
    }
}

impl fmt::Display for IndexSearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.field_value_pairs {
            write!(f, "{name} = {value}, ")?;
        }
        write!(
            f,
            "{} {} {}",
            self.last_field, self.last_operator, self.last_value
        )
    }
}
