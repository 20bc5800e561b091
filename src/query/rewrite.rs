//! Filter rewrites applied before index analysis.

use crate::query::condition::{Comparison, ConditionNode, Operand, Operator};
use crate::query::record::RID_ATTR;
use crate::query::storage::RidRange;
use crate::query::value::Value;

/// Folds `field > a AND field < b` style pairs into a single BETWEEN.
///
/// Conjuncts of an AND chain are paired per single-hop field: the first lower
/// bound meets the first upper bound on the same field. Bound inclusivity is
/// carried into the BETWEEN flags. Returns the rewritten tree and the number
/// of pairs converted; the input is left untouched.
pub fn merge_range_conditions(node: &ConditionNode) -> (ConditionNode, usize) {
    match node {
        ConditionNode::And(..) => {
            let mut count = 0;
            let mut conjuncts = Vec::new();
            for conjunct in flatten_and(node) {
                let (rewritten, nested) = merge_range_conditions(conjunct);
                count += nested;
                conjuncts.push(Some(rewritten));
            }
            count += pair_bounds(&mut conjuncts);
            let rebuilt = conjuncts
                .into_iter()
                .flatten()
                .reduce(ConditionNode::and)
                .unwrap_or_else(|| node.clone());
            (rebuilt, count)
        }
        ConditionNode::Or(left, right) => {
            let (left, l) = merge_range_conditions(left);
            let (right, r) = merge_range_conditions(right);
            (ConditionNode::or(left, right), l + r)
        }
        ConditionNode::Not(inner) => {
            let (inner, count) = merge_range_conditions(inner);
            (ConditionNode::negate(inner), count)
        }
        ConditionNode::Compare(_) => (node.clone(), 0),
    }
}

fn flatten_and(node: &ConditionNode) -> Vec<&ConditionNode> {
    match node {
        ConditionNode::And(left, right) => {
            let mut out = flatten_and(left);
            out.extend(flatten_and(right));
            out
        }
        other => vec![other],
    }
}

struct RangeBound {
    field: String,
    operator: Operator,
    value: Value,
}

fn range_bound(node: &ConditionNode) -> Option<RangeBound> {
    let ConditionNode::Compare(cmp) = node else {
        return None;
    };
    let cmp = cmp.field_on_left()?;
    let Operand::Field(chain) = &cmp.left else {
        return None;
    };
    if chain.is_long() || chain.is_attribute() {
        return None;
    }
    if !cmp.operator.is_lower_bound() && !cmp.operator.is_upper_bound() {
        return None;
    }
    let Operand::Literal(value) = &cmp.right else {
        return None;
    };
    if value.is_null() {
        return None;
    }
    Some(RangeBound {
        field: chain.first().to_owned(),
        operator: cmp.operator,
        value: value.clone(),
    })
}

fn pair_bounds(conjuncts: &mut [Option<ConditionNode>]) -> usize {
    let mut converted = 0;
    for i in 0..conjuncts.len() {
        let Some(first) = conjuncts[i].as_ref().and_then(range_bound) else {
            continue;
        };
        let partner = (i + 1..conjuncts.len()).find(|&j| {
            conjuncts[j]
                .as_ref()
                .and_then(range_bound)
                .is_some_and(|other| {
                    other.field == first.field
                        && other.operator.is_lower_bound() != first.operator.is_lower_bound()
                })
        });
        let Some(j) = partner else {
            continue;
        };
        let Some(second) = conjuncts[j].take().as_ref().and_then(range_bound) else {
            continue;
        };
        let (lower, upper) = if first.operator.is_lower_bound() {
            (first, second)
        } else {
            (second, first)
        };
        let operator = Operator::Between {
            lower_inclusive: lower.operator == Operator::GreaterOrEquals,
            upper_inclusive: upper.operator == Operator::LessOrEquals,
        };
        conjuncts[i] = Some(ConditionNode::Compare(Comparison {
            left: Operand::field(&lower.field),
            operator,
            right: Operand::Literal(Value::List(vec![lower.value, upper.value])),
        }));
        converted += 1;
    }
    converted
}

/// RID bounds implied by top-level `@rid` comparisons against literal RIDs.
pub fn rid_range(filter: Option<&ConditionNode>) -> RidRange {
    let mut range = RidRange::all();
    let Some(filter) = filter else {
        return range;
    };
    for conjunct in flatten_and(filter) {
        let ConditionNode::Compare(cmp) = conjunct else {
            continue;
        };
        let Some(cmp) = cmp.field_on_left() else {
            continue;
        };
        let is_rid = cmp
            .left
            .as_field()
            .is_some_and(|chain| !chain.is_long() && chain.first() == RID_ATTR);
        let (true, Operand::Literal(Value::Link(rid))) = (is_rid, &cmp.right) else {
            continue;
        };
        let rid = *rid;
        let raise_from = |range: &mut RidRange| {
            range.from = Some(range.from.map_or(rid, |from| from.max(rid)));
        };
        let lower_to = |range: &mut RidRange| {
            range.to = Some(range.to.map_or(rid, |to| to.min(rid)));
        };
        match cmp.operator {
            Operator::Equals => {
                raise_from(&mut range);
                lower_to(&mut range);
            }
            Operator::Greater | Operator::GreaterOrEquals => raise_from(&mut range),
            Operator::Less | Operator::LessOrEquals => lower_to(&mut range),
            _ => {}
        }
    }
    range
}
