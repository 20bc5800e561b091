#![allow(missing_docs)]

use std::sync::Arc;

use sombra_sql::query::index::{IndexDefinition, IndexKind};
use sombra_sql::query::{
    CollectingSink, ConditionNode, ExecutionContext, Executor, ExecutorOptions, MemoryDatabase,
    Row, SelectQuery, Value,
};
use sombra_sql::types::{Result, Rid};

const CHAIN: &str = "IndexChain{Person.address, Address.city, City.name}";

struct Town {
    db: Arc<MemoryDatabase>,
    rome_people: Vec<Rid>,
}

/// Person -> Address -> City, with an index on every hop.
fn town(with_base_index: bool) -> Result<Town> {
    let db = MemoryDatabase::new();
    db.create_class("City", None)?;
    db.create_class("Address", None)?;
    db.create_class("Person", None)?;
    db.link_property("Person", "address", "Address")?;
    db.link_property("Address", "city", "City")?;
    db.create_index("City.name", IndexKind::NotUnique, IndexDefinition::new("City", ["name"]))?;
    db.create_index(
        "Address.city",
        IndexKind::NotUniqueHash,
        IndexDefinition::new("Address", ["city"]),
    )?;
    if with_base_index {
        db.create_index(
            "Person.address",
            IndexKind::NotUnique,
            IndexDefinition::new("Person", ["address"]),
        )?;
    }

    let rome = db.insert("City", |r| r.with("name", "Rome"))?;
    let oslo = db.insert("City", |r| r.with("name", "Oslo"))?;
    let lima = db.insert("City", |r| r.with("name", "Lima"))?;
    let mut rome_people = Vec::new();
    for (i, city) in [rome, oslo, rome, lima, rome].into_iter().enumerate() {
        let address = db.insert("Address", |r| r.with("city", city).with("street", i as i64))?;
        let person = db.insert("Person", |r| r.with("address", address).with("n", i as i64))?;
        if city == rome {
            rome_people.push(person);
        }
    }
    db.insert("Person", |r| r.with("n", 99i64))?;
    Ok(Town {
        db: Arc::new(db),
        rome_people,
    })
}

fn sorted_rids(rows: &[Row]) -> Vec<Rid> {
    let mut rids: Vec<Rid> = rows.iter().filter_map(|row| row.rid).collect();
    rids.sort();
    rids
}

#[test]
fn chain_equality_resolves_through_every_hop() -> Result<()> {
    let town = town(true)?;
    let exec = Executor::for_database(Arc::clone(&town.db), ExecutorOptions::default());
    let query =
        SelectQuery::from_class("Person").filter(ConditionNode::eq("address.city.name", "Rome"));

    let mut ctx = ExecutionContext::new();
    let mut sink = CollectingSink::new();
    let outcome = exec.execute(&query, &mut ctx, &mut sink)?;
    let lookup = outcome
        .explain
        .root
        .find("IndexLookup")
        .expect("chain planned as an index lookup");
    assert_eq!(lookup.prop("index"), Some(CHAIN));
    assert_eq!(lookup.prop("kind"), Some("PROXY"));
    assert!(outcome.stats.involved_indexes.contains(CHAIN));

    let mut expected = town.rome_people.clone();
    expected.sort();
    assert_eq!(sorted_rids(&sink.rows), expected);
    assert_eq!(ctx.stats.document_reads, 3);
    Ok(())
}

#[test]
fn chain_range_matches_a_scan() -> Result<()> {
    let town = town(true)?;
    let exec = Executor::for_database(Arc::clone(&town.db), ExecutorOptions::default());
    let filter = ConditionNode::gt("address.city.name", "M");
    let indexed = exec.collect(
        &SelectQuery::from_class("Person").filter(filter.clone()),
        &mut ExecutionContext::new(),
    )?;
    let scanned = exec.collect(
        &SelectQuery::from_clusters(town.db.cluster_ids()).filter(filter),
        &mut ExecutionContext::new(),
    )?;
    assert_eq!(sorted_rids(&indexed), sorted_rids(&scanned));
    assert_eq!(indexed.len(), 4);
    Ok(())
}

#[test]
fn missing_hop_index_falls_back_to_scan() -> Result<()> {
    let town = town(false)?;
    let exec = Executor::for_database(Arc::clone(&town.db), ExecutorOptions::default());
    let query =
        SelectQuery::from_class("Person").filter(ConditionNode::eq("address.city.name", "Rome"));
    let out = exec.plan(&query, &ExecutionContext::new())?;
    assert!(out.explain.root.find("IndexLookup").is_none());

    let mut ctx = ExecutionContext::new();
    let rows = exec.collect(&query, &mut ctx)?;
    let mut expected = town.rome_people.clone();
    expected.sort();
    assert_eq!(sorted_rids(&rows), expected);
    assert_eq!(ctx.stats.document_reads, 6);
    Ok(())
}

#[test]
fn unmatched_chain_value_returns_nothing() -> Result<()> {
    let town = town(true)?;
    let exec = Executor::for_database(Arc::clone(&town.db), ExecutorOptions::default());
    let query =
        SelectQuery::from_class("Person").filter(ConditionNode::eq("address.city.name", "Paris"));
    let mut ctx = ExecutionContext::new();
    assert!(exec.collect(&query, &mut ctx)?.is_empty());
    assert_eq!(ctx.stats.document_reads, 0);
    Ok(())
}

#[test]
fn projected_chain_follows_links() -> Result<()> {
    let town = town(true)?;
    let exec = Executor::for_database(Arc::clone(&town.db), ExecutorOptions::default());
    let query = SelectQuery::from_records(town.rome_people.iter().copied().take(1))
        .project(sombra_sql::query::Projection::field("address.city.name"));
    let rows = exec.collect(&query, &mut ExecutionContext::new())?;
    assert_eq!(rows[0].get("name"), Value::from("Rome"));
    Ok(())
}
