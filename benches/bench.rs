//! Criterion benchmarks for the strata write path.
//!
//! Covers the main costs of indexing:
//! - text analysis
//! - buffering and flushing documents
//! - resolving buffered deletes
//! - merging segments

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::analysis::analyzer::Analyzer;
use strata::analysis::analyzer::standard::StandardAnalyzer;
use strata::document::Document;
use strata::index::merge::{NoMergePolicy, SerialMergeScheduler};
use strata::index::{IndexWriter, IndexWriterConfig, Term};
use strata::storage::memory::MemoryStorage;

const WORDS: &[&str] = &[
    "segment", "merge", "flush", "delete", "update", "commit", "buffer", "posting", "term",
    "field", "norm", "value", "ticket", "generation", "reader", "writer", "policy", "scheduler",
    "stall", "queue",
];

/// Generate test documents for benchmarking.
fn generate_documents(count: usize, seed: u64) -> Vec<Document> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let body: Vec<&str> = (0..40)
                .map(|_| WORDS[rng.random_range(0..WORDS.len())])
                .collect();
            Document::builder()
                .add_keyword("id", format!("doc-{i}"))
                .add_text("body", body.join(" "))
                .add_numeric("rank", rng.random_range(0..1000))
                .build()
        })
        .collect()
}

fn serial_config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()))
}

fn bench_analysis(c: &mut Criterion) {
    let analyzer = StandardAnalyzer::new();
    let text = WORDS.join(" ").repeat(10);

    let mut group = c.benchmark_group("analysis");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("standard_analyzer", |b| {
        b.iter(|| {
            let tokens = analyzer.analyze(black_box(&text)).unwrap();
            black_box(tokens.count())
        })
    });
    group.finish();
}

fn bench_indexing(c: &mut Criterion) {
    let docs = generate_documents(1000, 42);

    let mut group = c.benchmark_group("indexing");
    group.sample_size(20);
    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("add_and_flush_1000", |b| {
        b.iter_batched(
            || IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap(),
            |writer| {
                for doc in &docs {
                    writer.add_document(doc).unwrap();
                }
                writer.flush().unwrap();
                writer.rollback().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_deletes(c: &mut Criterion) {
    let docs = generate_documents(1000, 7);

    let mut group = c.benchmark_group("deletes");
    group.sample_size(20);
    group.bench_function("apply_100_term_deletes", |b| {
        b.iter_batched(
            || {
                let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), serial_config()).unwrap();
                for chunk in docs.chunks(250) {
                    writer.add_documents(chunk).unwrap();
                    writer.flush().unwrap();
                }
                writer
            },
            |writer| {
                let terms = (0..100)
                    .map(|i| Term::new("id", format!("doc-{}", i * 10)))
                    .collect();
                writer.delete_terms(terms).unwrap();
                writer.flush().unwrap();
                writer.rollback().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let docs = generate_documents(1000, 99);

    let mut group = c.benchmark_group("merge");
    group.sample_size(10);
    group.bench_function("force_merge_4_segments", |b| {
        b.iter_batched(
            || {
                let config = IndexWriterConfig::default()
                    .with_merge_scheduler(Arc::new(SerialMergeScheduler::new()));
                let writer = IndexWriter::open(Arc::new(MemoryStorage::new()), config).unwrap();
                for chunk in docs.chunks(250) {
                    writer.add_documents(chunk).unwrap();
                    writer.flush().unwrap();
                }
                writer
            },
            |writer| {
                writer.force_merge(1, true).unwrap();
                writer.rollback().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_analysis,
    bench_indexing,
    bench_deletes,
    bench_merge
);
criterion_main!(benches);
