//! Benchmarks for pipeline push/fetch throughput, the in-process
//! equivalent of the teacher's refresh-duration benchmarks (which require
//! a live Postgres instance and so are out of scope here).

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::cell::RefCell;
use std::collections::BTreeMap;
use zero_ivm::ast::SimpleOp;
use zero_ivm::config::EngineConfig;
use zero_ivm::error::ZeroError;
use zero_ivm::ivm::builder::BuilderDelegate;
use zero_ivm::lifecycle::{QueryLifecycleManager, Ttl};
use zero_ivm::query::Query;
use zero_ivm::row::{PrimaryKey, Row};
use zero_ivm::source::{Source, SourceChange, SourceSchema};
use zero_ivm::storage::{MemStorage, Storage};
use zero_ivm::value::Value;

struct BenchDelegate {
    sources: RefCell<BTreeMap<String, Source>>,
}

impl BenchDelegate {
    fn new() -> Self {
        BenchDelegate { sources: RefCell::new(BTreeMap::new()) }
    }

    fn register(&self, source: Source) {
        self.sources.borrow_mut().insert(source.schema().table.clone(), source);
    }
}

impl BuilderDelegate for BenchDelegate {
    fn get_source(&self, _schema: Option<&str>, table: &str) -> Result<Source, ZeroError> {
        self.sources.borrow().get(table).cloned().ok_or_else(|| ZeroError::UnknownTable(table.to_string()))
    }

    fn create_storage(&self) -> Box<dyn Storage> {
        Box::new(MemStorage::new())
    }
}

fn schema() -> SourceSchema {
    SourceSchema { table: "issue".into(), columns: vec!["id".into(), "n".into()], primary_key: PrimaryKey::new(vec!["id".into()]) }
}

fn row(id: i64, n: i64) -> Row {
    let mut r = Row::new();
    r.insert("id".into(), Value::Number(id as f64));
    r.insert("n".into(), Value::Number(n as f64));
    r
}

fn bench_source_push_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("source_push");
    for n in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let src = Source::new(schema());
                for i in 0..n {
                    src.push(SourceChange::Add { row: row(i, i % 7) }).unwrap();
                }
                black_box(&src);
            });
        });
    }
    group.finish();
}

fn bench_filtered_view_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialized_view_push");
    for n in [100, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let delegate = BenchDelegate::new();
                let src = Source::new(schema());
                delegate.register(src.clone());

                let query = Query::new("issue").filter("n", SimpleOp::Eq, Value::Number(0.0));
                let manager = QueryLifecycleManager::new(EngineConfig::local_only());
                let materialized = manager.materialize(&query, Ttl::Forever, &delegate).unwrap();

                for i in 0..n {
                    src.push(SourceChange::Add { row: row(i, i % 7) }).unwrap();
                }
                black_box(materialized.view.data());
            });
        });
    }
    group.finish();
}

fn bench_materialize_from_prepopulated_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("materialize_initial_fetch");
    for n in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let delegate = BenchDelegate::new();
                let src = Source::new(schema());
                for i in 0..n {
                    src.push(SourceChange::Add { row: row(i, i % 7) }).unwrap();
                }
                delegate.register(src);

                let query = Query::new("issue").order_by("n", zero_ivm::row::SortDir::Asc);
                let manager = QueryLifecycleManager::new(EngineConfig::local_only());
                let materialized = manager.materialize(&query, Ttl::Forever, &delegate).unwrap();
                black_box(materialized.view.data());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_source_push_throughput,
    bench_filtered_view_incremental_update,
    bench_materialize_from_prepopulated_source,
);
criterion_main!(benches);
