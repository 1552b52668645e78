mod datasets;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use strand::align::align;
use strand::consolidate::consolidate_series;
use strand::pattern::GlobPattern;
use strand::search::IndexSearcher;
use strand::{Expr, Finder, MemoryFinder, QueryEngine};

use std::sync::Arc;

fn load_finder(name: &str, metrics: &[datasets::Metric], batch_tag: Option<&str>) -> Arc<dyn Finder> {
    let builder = MemoryFinder::builder(name);
    let finder = match batch_tag {
        Some(tag) => builder.batch_tag(tag).build(),
        None => builder.build(),
    };
    for m in metrics {
        finder.insert_series(&m.path, 0, m.step, &m.values).unwrap();
    }
    Arc::new(finder)
}

fn bench_glob_matching(c: &mut Criterion) {
    let metrics = datasets::generate_metrics(datasets::DEFAULT_SEED, 8, 128, 1, 60, 0.0);
    let paths: Vec<&str> = metrics.iter().map(|m| m.path.as_str()).collect();

    let mut group = c.benchmark_group("glob");
    for pattern in ["dc3.host1*.cpu", "dc{1,5}.host?.cpu", "*.*.cpu", "dc[0-3].host100.cpu"] {
        let compiled = GlobPattern::compile(pattern).unwrap();
        group.bench_function(pattern, |b| {
            b.iter(|| paths.iter().filter(|p| compiled.matches(black_box(p))).count())
        });
    }
    group.finish();
}

fn bench_consolidate_and_align(c: &mut Criterion) {
    let mut group = c.benchmark_group("series");

    let fine = datasets::to_series(&datasets::generate_metrics(datasets::DEFAULT_SEED, 1, 64, 8_640, 10, 0.05));
    group.bench_function("consolidate_64x8640_to_800", |b| {
        b.iter(|| {
            fine.iter()
                .cloned()
                .map(|s| consolidate_series(s, black_box(800)))
                .count()
        })
    });

    let mut mixed = datasets::to_series(&datasets::generate_metrics(datasets::DEFAULT_SEED, 1, 32, 8_640, 10, 0.05));
    mixed.extend(datasets::to_series(&datasets::generate_metrics(
        datasets::DEFAULT_SEED + 1,
        1,
        32,
        1_440,
        60,
        0.05,
    )));
    group.bench_function("align_64_mixed_steps", |b| {
        b.iter(|| align(black_box(mixed.clone()), 86_400).len())
    });
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let metrics = datasets::generate_metrics(datasets::DEFAULT_SEED, 4, 64, 1_440, 60, 0.02);
    let (first, second) = metrics.split_at(metrics.len() / 2);

    let mut group = c.benchmark_group("render");
    for (name, tag) in [("per_leaf_fetch", None), ("batched_fetch", Some("bench"))] {
        let engine = QueryEngine::new(vec![
            load_finder("primary", first, tag),
            load_finder("secondary", second, tag),
        ])
        .unwrap();
        let targets = [
            Expr::call("sumSeries", vec![Expr::path("dc*.host*.cpu")]),
            Expr::call(
                "groupByNode",
                vec![Expr::path("dc*.host*.cpu"), Expr::number(0.0), Expr::string("averageSeries")],
            ),
        ];
        group.bench_function(name, |b| {
            b.iter(|| {
                engine
                    .resolve_and_evaluate(black_box(&targets), 0, 86_400, Some(800))
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let metrics = datasets::generate_metrics(datasets::DEFAULT_SEED, 16, 256, 1, 60, 0.0);
    let dir = TempDir::new().expect("tempdir");
    let index = dir.path().join("metrics.idx");
    let lines: Vec<&str> = metrics.iter().map(|m| m.path.as_str()).collect();
    std::fs::write(&index, lines.join("\n")).unwrap();
    let searcher = IndexSearcher::open(&index).unwrap();

    let mut group = c.benchmark_group("search");
    group.bench_function("index_4096_wildcard", |b| {
        b.iter(|| searcher.search(black_box("dc1*.host2*"), Some(100)).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_glob_matching,
    bench_consolidate_and_align,
    bench_render,
    bench_search
);
criterion_main!(benches);
