#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_sql::query::index::{IndexDefinition, IndexKind};
use sombra_sql::query::{
    ConditionNode, Direction, ExecutionContext, Executor, ExecutorOptions, MemoryDatabase,
    Projection, SelectQuery,
};

const RECORD_COUNT: usize = 16_384;
const VALUE_DOMAIN: i64 = 10_000;

fn planner(c: &mut Criterion) {
    let harness = SelectHarness::new(RECORD_COUNT, VALUE_DOMAIN);
    let mut group = c.benchmark_group("query/select");
    group.sample_size(40);

    let eq = harness.query_eq(4_242);
    group.bench_function("plan_eq", |b| {
        b.iter(|| black_box(harness.exec.plan(&eq, &ExecutionContext::new())));
    });

    let conjunction = SelectQuery::from_class("Reading")
        .filter(ConditionNode::and(
            ConditionNode::eq("sensor", 3i64),
            ConditionNode::and(
                ConditionNode::gt("score", 100i64),
                ConditionNode::ne("score", 500i64),
            ),
        ))
        .order_by("score", Direction::Desc);
    group.bench_function("plan_conjunction", |b| {
        b.iter(|| black_box(harness.exec.plan(&conjunction, &ExecutionContext::new())));
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("execute_eq_lookup", |b| {
        b.iter(|| black_box(harness.exec.collect(&eq, &mut ExecutionContext::new())));
    });

    group.throughput(Throughput::Elements(64));
    let top = SelectQuery::from_class("Reading")
        .order_by("score", Direction::Desc)
        .limit(64);
    group.bench_function("execute_index_order_limit", |b| {
        b.iter(|| black_box(harness.exec.collect(&top, &mut ExecutionContext::new())));
    });

    group.throughput(Throughput::Elements(RECORD_COUNT as u64));
    let grouped = SelectQuery::from_class("Reading")
        .project(Projection::field("sensor"))
        .project(Projection::count_all())
        .group_by("sensor");
    group.bench_function("execute_group_by_scan", |b| {
        b.iter(|| black_box(harness.exec.collect(&grouped, &mut ExecutionContext::new())));
    });

    let unindexed = SelectQuery::from_class("Reading")
        .filter(ConditionNode::eq("payload", 7i64))
        .parallel(true);
    group.bench_function("execute_parallel_scan", |b| {
        b.iter(|| black_box(harness.parallel.collect(&unindexed, &mut ExecutionContext::new())));
    });

    group.finish();
}

struct SelectHarness {
    exec: Executor,
    parallel: Executor,
}

impl SelectHarness {
    fn new(record_count: usize, domain: i64) -> Self {
        let db = MemoryDatabase::new();
        db.create_class_with("Reading", None, 4, false).expect("class");
        db.create_index(
            "Reading.score",
            IndexKind::NotUnique,
            IndexDefinition::new("Reading", ["score"]),
        )
        .expect("score index");
        db.create_index(
            "Reading.sensor_score",
            IndexKind::NotUnique,
            IndexDefinition::new("Reading", ["sensor", "score"]),
        )
        .expect("composite index");
        let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
        for _ in 0..record_count {
            let score = rng.gen_range(0..domain);
            let sensor = rng.gen_range(0..16i64);
            let payload = rng.gen_range(0..64i64);
            db.insert("Reading", |r| {
                r.with("score", score)
                    .with("sensor", sensor)
                    .with("payload", payload)
            })
            .expect("insert");
        }
        let db = Arc::new(db);
        let parallel_options = ExecutorOptions {
            parallel_min_records: 1_000,
            ..ExecutorOptions::default()
        };
        Self {
            exec: Executor::for_database(Arc::clone(&db), ExecutorOptions::default()),
            parallel: Executor::for_database(db, parallel_options),
        }
    }

    fn query_eq(&self, score: i64) -> SelectQuery {
        SelectQuery::from_class("Reading").filter(ConditionNode::eq("score", score))
    }
}

criterion_group!(benches, planner);
criterion_main!(benches);
