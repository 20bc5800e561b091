#![allow(missing_docs)]

use std::io::Write;
use std::sync::Arc;

use sombra_sql::query::ast::AggregateFn;
use sombra_sql::query::index::{IndexDefinition, IndexKind};
use sombra_sql::query::{
    CollectingSink, ConditionNode, Direction, ExecutionContext, Executor, ExecutorOptions,
    MemoryDatabase, Operand, Projection, SelectQuery, TimeoutStrategy, Value, EXPAND_VALUE,
};
use sombra_sql::types::Result;

/// Orders with a customer link, a city, an amount and a tag list.
fn shop() -> Result<Arc<MemoryDatabase>> {
    let db = MemoryDatabase::new();
    db.create_class("Customer", None)?;
    db.create_class("Order", None)?;
    db.link_property("Order", "customer", "Customer")?;
    let ann = db.insert("Customer", |r| r.with("name", "Ann"))?;
    let bob = db.insert("Customer", |r| r.with("name", "Bob"))?;
    let orders: [(&str, i64, _, Vec<&str>); 6] = [
        ("Oslo", 10, ann, vec!["a", "b"]),
        ("Rome", 25, bob, vec![]),
        ("Oslo", 5, bob, vec!["c"]),
        ("Lima", 40, ann, vec!["a"]),
        ("Rome", 15, ann, vec!["b", "c", "d"]),
        ("Oslo", 30, bob, vec![]),
    ];
    for (city, amount, customer, tags) in orders {
        db.insert("Order", |r| {
            r.with("city", city)
                .with("amount", amount)
                .with("customer", customer)
                .with("tags", tags)
        })?;
    }
    Ok(Arc::new(db))
}

fn executor(db: &Arc<MemoryDatabase>) -> Executor {
    Executor::for_database(Arc::clone(db), ExecutorOptions::default())
}

#[test]
fn group_by_aggregates_and_orders_by_alias() -> Result<()> {
    let db = shop()?;
    let query = SelectQuery::from_class("Order")
        .project(Projection::field("city"))
        .project(Projection::count_all().alias("orders"))
        .project(Projection::aggregate(AggregateFn::Sum, "amount").alias("total"))
        .project(Projection::aggregate(AggregateFn::Max, "amount"))
        .group_by("city")
        .order_by("total", Direction::Desc);
    let rows = executor(&db).collect(&query, &mut ExecutionContext::new())?;
    let summary: Vec<(Value, Value, Value, Value)> = rows
        .iter()
        .map(|row| (row.get("city"), row.get("orders"), row.get("total"), row.get("max")))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Value::from("Oslo"), Value::Int(3), Value::Int(45), Value::Int(30)),
            (Value::from("Rome"), Value::Int(2), Value::Int(40), Value::Int(25)),
            (Value::from("Lima"), Value::Int(1), Value::Int(40), Value::Int(40)),
        ]
    );
    assert!(rows.iter().all(|row| row.rid.is_none()));
    Ok(())
}

#[test]
fn aggregates_without_group_by_cover_the_filtered_set() -> Result<()> {
    let db = shop()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Order")
        .filter(ConditionNode::eq("city", "Oslo"))
        .project(Projection::aggregate(AggregateFn::Avg, "amount"))
        .project(Projection::aggregate(AggregateFn::Min, "amount"));
    let rows = exec.collect(&query, &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("avg"), Value::Float(15.0));
    assert_eq!(rows[0].get("min"), Value::Int(5));

    let empty = SelectQuery::from_class("Order")
        .filter(ConditionNode::eq("city", "Paris"))
        .project(Projection::aggregate(AggregateFn::Sum, "amount"));
    let rows = exec.collect(&empty, &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("sum"), Value::Null);
    Ok(())
}

#[test]
fn expand_replaces_rows_with_linked_records() -> Result<()> {
    let db = shop()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Order")
        .filter(ConditionNode::ge("amount", 25i64))
        .expand("customer");
    let rows = exec.collect(&query, &mut ExecutionContext::new())?;
    let mut names: Vec<Value> = rows.iter().map(|row| row.get("name")).collect();
    names.sort();
    assert_eq!(names, vec![Value::from("Ann"), Value::from("Bob"), Value::from("Bob")]);
    assert!(rows.iter().all(|row| row.rid.is_some()));

    let values = SelectQuery::from_class("Order")
        .filter(ConditionNode::eq("city", "Lima"))
        .expand("city");
    let rows = exec.collect(&values, &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(EXPAND_VALUE), Value::from("Lima"));

    let mixed = SelectQuery::from_class("Order")
        .project(Projection::field("city"))
        .expand("customer");
    let err = exec.collect(&mixed, &mut ExecutionContext::new()).unwrap_err();
    assert_eq!(err.code(), "ExpandWithProjections");
    Ok(())
}

#[test]
fn unwind_then_page_counts_unwound_rows() -> Result<()> {
    let db = shop()?;
    let query = SelectQuery::from_class("Order")
        .project(Projection::field("amount"))
        .project(Projection::field("tags"))
        .order_by("amount", Direction::Asc)
        .unwind("tags")
        .skip(1)
        .limit(4);
    let rows = executor(&db).collect(&query, &mut ExecutionContext::new())?;
    let pairs: Vec<(Value, Value)> = rows
        .iter()
        .map(|row| (row.get("amount"), row.get("tags")))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Value::Int(10), Value::from("a")),
            (Value::Int(10), Value::from("b")),
            (Value::Int(15), Value::from("b")),
            (Value::Int(15), Value::from("c")),
        ]
    );
    Ok(())
}

#[test]
fn partial_sort_agrees_with_full_sort() -> Result<()> {
    let db = MemoryDatabase::new();
    db.create_class("Reading", None)?;
    for i in 0..500i64 {
        db.insert("Reading", |r| r.with("v", (i * 7919) % 503))?;
    }
    let db = Arc::new(db);
    let tight = ExecutorOptions {
        partial_sort_slack: 3,
        ..ExecutorOptions::default()
    };
    let query = SelectQuery::from_class("Reading")
        .project(Projection::field("v"))
        .order_by("v", Direction::Desc)
        .skip(5)
        .limit(10);
    let partial = Executor::for_database(Arc::clone(&db), tight).collect(&query, &mut ExecutionContext::new())?;
    let full = executor(&db).collect(
        &SelectQuery::from_class("Reading")
            .project(Projection::field("v"))
            .order_by("v", Direction::Desc),
        &mut ExecutionContext::new(),
    )?;
    let partial: Vec<Value> = partial.iter().map(|row| row.get("v")).collect();
    let expected: Vec<Value> = full.iter().skip(5).take(10).map(|row| row.get("v")).collect();
    assert_eq!(partial, expected);
    Ok(())
}

#[test]
fn streaming_stops_reading_once_the_sink_is_full() -> Result<()> {
    let db = shop()?;
    let exec = executor(&db);
    let mut ctx = ExecutionContext::new();
    let mut sink = CollectingSink::with_cap(2);
    let outcome = exec.execute(&SelectQuery::from_class("Order"), &mut ctx, &mut sink)?;
    assert_eq!(outcome.rows_delivered, 2);
    assert_eq!(ctx.stats.document_reads, 2);
    assert!(sink.is_finished());

    let mut ctx = ExecutionContext::new();
    let rows = exec.collect(&SelectQuery::from_class("Order").limit(3), &mut ctx)?;
    assert_eq!(rows.len(), 3);
    assert_eq!(ctx.stats.document_reads, 3);
    Ok(())
}

#[test]
fn let_variables_are_visible_to_filter_and_projection() -> Result<()> {
    let db = shop()?;
    let query = SelectQuery::from_class("Order")
        .let_var("buyer", Operand::field("customer.name"))
        .filter(ConditionNode::compare(
            Operand::variable("buyer"),
            sombra_sql::query::Operator::Equals,
            Operand::literal("Ann"),
        ))
        .project(Projection::aliased(Operand::variable("buyer"), "who"))
        .project(Projection::field("amount"))
        .order_by("amount", Direction::Asc);
    let rows = executor(&db).collect(&query, &mut ExecutionContext::new())?;
    let amounts: Vec<Value> = rows.iter().map(|row| row.get("amount")).collect();
    assert_eq!(amounts, vec![Value::Int(10), Value::Int(15), Value::Int(40)]);
    assert!(rows.iter().all(|row| row.get("who") == Value::from("Ann")));
    Ok(())
}

#[test]
fn index_order_by_skips_the_sort_buffer() -> Result<()> {
    let db = shop()?;
    db.create_index("Order.amount", IndexKind::NotUnique, IndexDefinition::new("Order", ["amount"]))?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Order")
        .order_by("amount", Direction::Desc)
        .limit(2);
    let mut ctx = ExecutionContext::new();
    let mut sink = CollectingSink::new();
    let outcome = exec.execute(&query, &mut ctx, &mut sink)?;
    assert!(outcome.stats.fully_sorted_by_index);
    assert!(outcome.stats.index_is_used_in_order_by);
    let amounts: Vec<Value> = sink.rows.iter().map(|row| row.get("amount")).collect();
    assert_eq!(amounts, vec![Value::Int(40), Value::Int(30)]);
    assert_eq!(ctx.stats.document_reads, 2);
    Ok(())
}

#[test]
fn options_file_drives_the_executor() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "tip_limit_threshold = 1\ntimeout_strategy = \"return\"")?;
    let options = ExecutorOptions::load(file.path()).expect("valid options file");
    assert_eq!(options.timeout_strategy, TimeoutStrategy::Return);
    let db = shop()?;
    let exec = Executor::for_database(Arc::clone(&db), options);
    assert_eq!(exec.options().tip_limit_threshold, 1);
    let rows = exec.collect(&SelectQuery::from_class("Order"), &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 6);
    Ok(())
}
