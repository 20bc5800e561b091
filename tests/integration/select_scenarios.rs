#![allow(missing_docs)]

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use sombra_sql::query::index::{IndexDefinition, IndexKind};
use sombra_sql::query::{
    ConditionNode, Direction, ExecutionContext, Executor, ExecutorOptions, MemoryDatabase,
    Projection, ResultSink, Row, SelectQuery, TimeoutStrategy, Value,
};
use sombra_sql::types::{Result, Rid};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_sql=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Animal with Dog and Cat subclasses; only the subclasses index `name`.
fn zoo() -> Result<Arc<MemoryDatabase>> {
    let db = MemoryDatabase::new();
    db.create_class("Animal", None)?;
    db.create_class("Dog", Some("Animal"))?;
    db.create_class("Cat", Some("Animal"))?;
    db.create_index("Dog.name", IndexKind::NotUnique, IndexDefinition::new("Dog", ["name"]))?;
    db.create_index("Cat.name", IndexKind::NotUnique, IndexDefinition::new("Cat", ["name"]))?;
    let rows: [(&str, &str, i64); 6] = [
        ("Animal", "Rex", 9),
        ("Dog", "Rex", 3),
        ("Dog", "Fido", 5),
        ("Dog", "Rex", 7),
        ("Cat", "Tom", 2),
        ("Cat", "Rex", 4),
    ];
    for (class, name, age) in rows {
        db.insert(class, |r| r.with("name", name).with("age", age))?;
    }
    Ok(Arc::new(db))
}

fn executor(db: &Arc<MemoryDatabase>) -> Executor {
    Executor::for_database(Arc::clone(db), ExecutorOptions::default())
}

fn rids(rows: &[Row]) -> Vec<Rid> {
    let mut rids: Vec<Rid> = rows.iter().filter_map(|row| row.rid).collect();
    rids.sort();
    rids
}

#[test]
fn polymorphic_fan_out_matches_a_full_scan() -> Result<()> {
    init_tracing();
    let db = zoo()?;
    let exec = executor(&db);
    let filter = ConditionNode::eq("name", "Rex");

    let query = SelectQuery::from_class("Animal").filter(filter.clone());
    let mut ctx = ExecutionContext::new();
    let mut sink = sombra_sql::query::CollectingSink::new();
    let outcome = exec.execute(&query, &mut ctx, &mut sink)?;
    assert!(outcome.explain.root.find("PolymorphicMerge").is_some());
    assert!(outcome.stats.involved_indexes.contains("Dog.name"));
    assert!(outcome.stats.involved_indexes.contains("Cat.name"));

    let scan = SelectQuery::from_clusters(db.cluster_ids()).filter(filter);
    let expected = exec.collect(&scan, &mut ExecutionContext::new())?;
    assert_eq!(rids(&sink.rows), rids(&expected));
    assert_eq!(sink.rows.len(), 4);
    Ok(())
}

#[test]
fn unindexed_subclass_abandons_fan_out() -> Result<()> {
    let db = zoo()?;
    db.create_class("Bird", Some("Animal"))?;
    db.insert("Bird", |r| r.with("name", "Rex"))?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Animal").filter(ConditionNode::eq("name", "Rex"));
    let out = exec.plan(&query, &ExecutionContext::new())?;
    assert!(out.explain.root.find("PolymorphicMerge").is_none());
    assert_eq!(out.explain.root.inputs[0].op, "ClusterScan");
    assert_eq!(exec.collect(&query, &mut ExecutionContext::new())?.len(), 5);
    Ok(())
}

#[test]
fn exact_class_target_skips_subclasses() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class_exact("Animal").filter(ConditionNode::eq("name", "Rex"));
    let rows = exec.collect(&query, &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("age"), Value::Int(9));
    Ok(())
}

#[test]
fn or_branches_on_different_indexes_deliver_each_record_once() -> Result<()> {
    let db = zoo()?;
    db.create_index("Dog.age", IndexKind::NotUnique, IndexDefinition::new("Dog", ["age"]))?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Dog").filter(ConditionNode::or(
        ConditionNode::eq("name", "Rex"),
        ConditionNode::eq("age", 3i64),
    ));
    let mut ctx = ExecutionContext::new();
    let mut sink = sombra_sql::query::CollectingSink::new();
    let outcome = exec.execute(&query, &mut ctx, &mut sink)?;
    let union = outcome
        .explain
        .root
        .find("IndexUnion")
        .expect("index union planned");
    assert_eq!(union.inputs.len(), 2);
    assert_eq!(sink.rows.len(), 2);
    let ages: Vec<Value> = {
        let mut ages: Vec<Value> = sink.rows.iter().map(|row| row.get("age")).collect();
        ages.sort();
        ages
    };
    assert_eq!(ages, vec![Value::Int(3), Value::Int(7)]);
    Ok(())
}

#[test]
fn order_skip_and_limit_page_through_results() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Dog")
        .project(Projection::field("name"))
        .order_by("age", Direction::Desc)
        .skip(1)
        .limit(1);
    let rows = exec.collect(&query, &mut ExecutionContext::new())?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Value::from("Fido"));
    Ok(())
}

#[test]
fn variable_and_record_targets_load_links() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let dogs = exec.collect(&SelectQuery::from_class("Dog"), &mut ExecutionContext::new())?;
    let links: Vec<Value> = dogs.iter().filter_map(|row| row.rid).map(Value::from).collect();

    let mut ctx = ExecutionContext::new().with_variable("pets", Value::List(links));
    let query = SelectQuery::from_variable("pets").filter(ConditionNode::eq("name", "Rex"));
    assert_eq!(exec.collect(&query, &mut ctx)?.len(), 2);

    let err = exec
        .collect(&SelectQuery::from_variable("strays"), &mut ExecutionContext::new())
        .unwrap_err();
    assert_eq!(err.code(), "UnknownVariable");

    let first = dogs[0].rid.expect("record rows carry a rid");
    let query = SelectQuery::from_records([first, first]);
    assert_eq!(exec.collect(&query, &mut ExecutionContext::new())?.len(), 1);
    Ok(())
}

#[test]
fn count_star_reads_no_records() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Animal").project(Projection::count_all().alias("total"));
    let mut ctx = ExecutionContext::new();
    let rows = exec.collect(&query, &mut ctx)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("total"), Value::Int(6));
    assert_eq!(ctx.stats.document_reads, 0);
    Ok(())
}

#[test]
fn invalid_paging_is_rejected_before_execution() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let err = exec
        .collect(&SelectQuery::from_class("Dog").limit(0), &mut ExecutionContext::new())
        .unwrap_err();
    assert_eq!(err.code(), "InvalidLimit");
    let err = exec
        .collect(&SelectQuery::from_class("Dog").skip(-1), &mut ExecutionContext::new())
        .unwrap_err();
    assert_eq!(err.code(), "InvalidSkip");
    Ok(())
}

struct SlowSink {
    rows: usize,
}

impl ResultSink for SlowSink {
    fn push(&mut self, _row: Row) -> bool {
        self.rows += 1;
        thread::sleep(Duration::from_millis(3));
        true
    }
}

#[test]
fn query_timeout_raises_by_default() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let query = SelectQuery::from_class("Animal").timeout(Duration::from_millis(1), TimeoutStrategy::Exception);
    let mut sink = SlowSink { rows: 0 };
    let err = exec
        .execute(&query, &mut ExecutionContext::new(), &mut sink)
        .unwrap_err();
    assert_eq!(err.code(), "Timeout");
    assert!(sink.rows < 6);
    Ok(())
}

#[test]
fn default_timeout_with_return_yields_partial_rows() -> Result<()> {
    let db = zoo()?;
    let options = ExecutorOptions {
        default_timeout_ms: Some(1),
        timeout_strategy: TimeoutStrategy::Return,
        ..ExecutorOptions::default()
    };
    let exec = Executor::for_database(Arc::clone(&db), options);
    let mut sink = SlowSink { rows: 0 };
    let outcome = exec.execute(&SelectQuery::from_class("Animal"), &mut ExecutionContext::new(), &mut sink)?;
    assert!(outcome.timed_out);
    assert!(outcome.rows_delivered < 6);
    assert_eq!(outcome.rows_delivered, sink.rows);
    Ok(())
}

#[test]
fn cancel_token_aborts_the_query() -> Result<()> {
    let db = zoo()?;
    let exec = executor(&db);
    let token = Arc::new(AtomicBool::new(true));
    let mut ctx = ExecutionContext::new().with_cancel_token(token);
    let err = exec.collect(&SelectQuery::from_class("Dog"), &mut ctx).unwrap_err();
    assert_eq!(err.code(), "Cancelled");
    Ok(())
}
