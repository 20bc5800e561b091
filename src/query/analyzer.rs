//! Turns a filter tree into candidate index lookups.
//!
//! The top-level OR splits the filter into independent branches. Each branch
//! yields a list of [`IndexSearchResult`]s ordered most specific first; the
//! planner picks the first one some index can serve and unions the branches
//! at execution time.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::query::chained::ChainedIndexProxy;
use crate::query::condition::{Comparison, ConditionNode, IndexReuseType, Operand, Operator};
use crate::query::index::Index;
use crate::query::index_search::IndexSearchResult;
use crate::query::metadata::{IndexCatalog, SchemaCatalog};
use crate::query::value::Value;

/// Candidate lookups for one OR-branch, most specific first.
pub type BranchCandidates = Vec<IndexSearchResult>;

/// Walks a filter tree against a class's schema and indexes.
pub struct FilterAnalyzer<'a> {
    schema: &'a dyn SchemaCatalog,
    indexes: &'a dyn IndexCatalog,
    variables: &'a BTreeMap<String, Value>,
}

impl<'a> FilterAnalyzer<'a> {
    /// Analyzer resolving `$name` operands from `variables`. Names missing from
    /// the map (LET bindings among them) are treated as not indexable.
    pub fn new(
        schema: &'a dyn SchemaCatalog,
        indexes: &'a dyn IndexCatalog,
        variables: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            schema,
            indexes,
            variables,
        }
    }

    /// One candidate list per top-level OR-branch. A branch with an empty list
    /// cannot use an index, which forces the whole query onto a scan.
    pub fn analyze_main_condition(
        &self,
        class: &str,
        condition: &ConditionNode,
    ) -> Vec<BranchCandidates> {
        match condition {
            ConditionNode::Or(left, right) => {
                let mut branches = self.analyze_main_condition(class, left);
                branches.extend(self.analyze_main_condition(class, right));
                branches
            }
            other => vec![self.analyze_condition(class, other)],
        }
    }

    /// Candidates for a single OR-free branch, sorted by descending field
    /// count with ties kept in discovery order.
    pub fn analyze_condition(&self, class: &str, condition: &ConditionNode) -> BranchCandidates {
        let mut results = Vec::new();
        let last = self.analyze_filter_branch(class, condition, &mut results);
        if results.is_empty() {
            if let Some(last) = last {
                results.push(last);
            }
        }
        results.sort_by(|a, b| b.field_count().cmp(&a.field_count()));
        trace!(class, candidates = results.len(), "analyzed filter branch");
        results
    }

    fn analyze_filter_branch(
        &self,
        class: &str,
        node: &ConditionNode,
        results: &mut Vec<IndexSearchResult>,
    ) -> Option<IndexSearchResult> {
        match node.index_reuse_type() {
            IndexReuseType::Intersection => match node {
                ConditionNode::And(left, right) => {
                    self.analyze_intersection(class, left, right, results)
                }
                _ => None,
            },
            IndexReuseType::Method => match node {
                ConditionNode::Compare(cmp) => self.analyze_index_method(class, cmp, results),
                _ => None,
            },
            IndexReuseType::Union | IndexReuseType::None => None,
        }
    }

    fn analyze_intersection(
        &self,
        class: &str,
        left: &ConditionNode,
        right: &ConditionNode,
        results: &mut Vec<IndexSearchResult>,
    ) -> Option<IndexSearchResult> {
        let left = self.analyze_filter_branch(class, left, results);
        let right = self.analyze_filter_branch(class, right, results);
        let (left, right) = (left?, right?);
        if !left.can_be_merged(&right) {
            return None;
        }
        let merged = left.merge(&right);
        if self.indexes.are_indexed(class, &merged.fields()) {
            results.push(merged.clone());
        }
        Some(merged)
    }

    fn analyze_index_method(
        &self,
        class: &str,
        cmp: &Comparison,
        results: &mut Vec<IndexSearchResult>,
    ) -> Option<IndexSearchResult> {
        let cmp = cmp.field_on_left()?;
        let Operand::Field(chain) = &cmp.left else {
            return None;
        };
        if chain.is_attribute() {
            return None;
        }
        let (operator, value) = match cmp.operator {
            Operator::IsNull => (Operator::Equals, Value::Null),
            op => (op, self.constant(&cmp.right)?),
        };
        let value = match (operator, value) {
            (Operator::In, Value::List(items)) => Value::List(items),
            (Operator::In, single) => Value::List(vec![single]),
            (Operator::Between { .. }, Value::List(items)) if items.len() == 2 => {
                Value::List(items)
            }
            (Operator::Between { .. }, _) => return None,
            (Operator::Equals, Value::List(_) | Value::Map(_)) => return None,
            (_, value) => value,
        };
        let result = IndexSearchResult::new(operator, chain.clone(), value);
        if self.check_index_existence(class, &result) {
            results.push(result.clone());
        }
        Some(result)
    }

    fn constant(&self, operand: &Operand) -> Option<Value> {
        match operand {
            Operand::Literal(value) => Some(value.clone()),
            Operand::Variable(name) => self.variables.get(name).cloned(),
            Operand::Field(_) => None,
        }
    }

    fn check_index_existence(&self, class: &str, result: &IndexSearchResult) -> bool {
        if !self.indexes.are_indexed(class, &result.fields()) {
            return false;
        }
        let chain = &result.last_field;
        if !chain.is_long() {
            return true;
        }
        let mut current = class.to_owned();
        for hop in 1..chain.item_count() {
            let Some(next) = self.schema.linked_class(&current, chain.item(hop - 1)) else {
                return false;
            };
            if !self
                .indexes
                .are_indexed(&next, &[chain.item(hop).to_owned()])
            {
                return false;
            }
            current = next;
        }
        true
    }

    /// Indexes able to serve `result`: chained proxies for multi-hop fields,
    /// otherwise the class indexes covering exactly `result.fields()`.
    pub fn involved_indexes(&self, class: &str, result: &IndexSearchResult) -> Vec<Arc<dyn Index>> {
        if result.last_field.is_long() {
            ChainedIndexProxy::create_proxies(self.schema, self.indexes, class, &result.last_field)
                .into_iter()
                .map(|proxy| Arc::new(proxy) as Arc<dyn Index>)
                .collect()
        } else {
            self.indexes.indexes_covering_fields(class, &result.fields())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::FieldChain;
    use crate::query::index::{IndexDefinition, IndexKind};
    use crate::query::memory::MemoryDatabase;

    fn person_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_class("V", None).unwrap();
        db.create_class("Person", Some("V")).unwrap();
        db.create_index("Person.ssn", IndexKind::Unique, IndexDefinition::new("Person", ["ssn"]))
            .unwrap();
        db.create_index(
            "Person.lastName_age",
            IndexKind::NotUnique,
            IndexDefinition::new("Person", ["lastName", "age"]),
        )
        .unwrap();
        db
    }

    #[test]
    fn point_lookup_on_unique_field() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let branches = analyzer.analyze_main_condition("Person", &ConditionNode::eq("ssn", "123"));
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].len(), 1);
        assert_eq!(branches[0][0].fields(), vec!["ssn".to_owned()]);
        assert_eq!(analyzer.involved_indexes("Person", &branches[0][0]).len(), 1);
    }

    #[test]
    fn equality_and_range_merge_into_composite_prefix() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let filter = ConditionNode::and(
            ConditionNode::eq("lastName", "Doe"),
            ConditionNode::gt("age", 30i64),
        );
        let branches = analyzer.analyze_main_condition("Person", &filter);
        let best = &branches[0][0];
        assert_eq!(best.field_value("lastName"), Some(&Value::from("Doe")));
        assert_eq!(best.last_field, FieldChain::parse("age"));
        assert_eq!(best.last_operator, Operator::Greater);
        assert_eq!(best.field_value_pairs().len(), 1);
    }

    #[test]
    fn or_produces_one_group_per_branch() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let filter = ConditionNode::or(
            ConditionNode::eq("ssn", "1"),
            ConditionNode::or(ConditionNode::eq("ssn", "2"), ConditionNode::eq("nick", "x")),
        );
        let branches = analyzer.analyze_main_condition("Person", &filter);
        assert_eq!(branches.len(), 3);
        assert!(!branches[0].is_empty());
        assert!(!branches[1].is_empty());
        let unindexed = &branches[2];
        assert!(unindexed.iter().all(|r| analyzer.involved_indexes("Person", r).is_empty()));
    }

    #[test]
    fn field_to_field_and_negations_are_not_indexable() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let cmp = ConditionNode::compare(Operand::field("ssn"), Operator::Equals, Operand::field("nick"));
        assert!(analyzer.analyze_condition("Person", &cmp).is_empty());
        let not = ConditionNode::negate(ConditionNode::eq("ssn", "1"));
        assert!(analyzer.analyze_condition("Person", &not).is_empty());
        let ne = ConditionNode::ne("ssn", "1");
        assert!(analyzer.analyze_condition("Person", &ne).is_empty());
    }

    #[test]
    fn literal_on_left_is_normalized() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let cmp = ConditionNode::compare(Operand::literal("Doe"), Operator::Equals, Operand::field("lastName"));
        let results = analyzer.analyze_condition("Person", &cmp);
        assert_eq!(results[0].last_field.first(), "lastName");
    }

    #[test]
    fn variables_resolve_from_context_only() {
        let db = person_db();
        let mut vars = BTreeMap::new();
        vars.insert("wanted".to_owned(), Value::from("123"));
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let bound = ConditionNode::compare(Operand::field("ssn"), Operator::Equals, Operand::variable("$wanted"));
        let results = analyzer.analyze_condition("Person", &bound);
        assert_eq!(results[0].last_value, Value::from("123"));
        let unbound = ConditionNode::compare(Operand::field("ssn"), Operator::Equals, Operand::variable("$perRecord"));
        assert!(analyzer.analyze_condition("Person", &unbound).is_empty());
    }

    #[test]
    fn is_null_becomes_null_equality() {
        let db = person_db();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let results = analyzer.analyze_condition("Person", &ConditionNode::is_null("ssn"));
        assert_eq!(results[0].last_operator, Operator::Equals);
        assert!(results[0].contains_null_values);
    }

    #[test]
    fn chains_need_every_hop_indexed() {
        let db = MemoryDatabase::new();
        db.create_class("City", None).unwrap();
        db.create_class("Person", None).unwrap();
        db.link_property("Person", "city", "City").unwrap();
        db.create_index("Person.city", IndexKind::NotUnique, IndexDefinition::new("Person", ["city"]))
            .unwrap();
        let vars = BTreeMap::new();
        let analyzer = FilterAnalyzer::new(&db, &db, &vars);
        let filter = ConditionNode::eq("city.name", "Rome");
        let results = analyzer.analyze_condition("Person", &filter);
        assert_eq!(results.len(), 1);
        assert!(analyzer.involved_indexes("Person", &results[0]).is_empty());

        db.create_index("City.name", IndexKind::NotUnique, IndexDefinition::new("City", ["name"]))
            .unwrap();
        let results = analyzer.analyze_condition("Person", &filter);
        let involved = analyzer.involved_indexes("Person", &results[0]);
        assert_eq!(involved.len(), 1);
        assert_eq!(involved[0].kind(), IndexKind::Proxy);
    }
}
