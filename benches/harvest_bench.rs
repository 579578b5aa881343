// Harvest and dispatch benchmarks

use criterion::async_executor::AsyncExecutor;
use criterion::{Criterion, criterion_group, criterion_main};
use secretdig::analyze::run_analysis;
use secretdig::config::RoutingConfig;
use secretdig::dispatch::{CustomRuleScanner, Dispatcher, Routing, ScannerBackend};
use secretdig::harvest::{HarvestOptions, Harvester, NoopProgress};
use secretdig::model::RepoId;
use secretdig::sink::FsSink;
use std::hint::black_box;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

mod common;

struct TokioExecutor(Runtime);

impl AsyncExecutor for TokioExecutor {
    fn block_on<T>(&self, future: impl std::future::Future<Output = T>) -> T {
        self.0.block_on(future)
    }
}

fn bench_harvest(c: &mut Criterion) {
    let mut group = c.benchmark_group("harvest");
    group.sample_size(10); // Fewer samples for slower benchmarks

    let (_small_dir, small) = common::generate_history(200, 50);
    group.bench_function("50_commits_200_files", |b| {
        b.iter(|| black_box(Harvester::new(&small, HarvestOptions::default()).collect().unwrap()));
    });

    let (_medium_dir, medium) = common::generate_history(500, 200);
    group.bench_function("200_commits_500_files", |b| {
        b.iter(|| black_box(Harvester::new(&medium, HarvestOptions::default()).collect().unwrap()));
    });

    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    group.sample_size(10);

    let (_dir, repo_path) = common::generate_history(200, 100);
    let routing = Routing::new(&RoutingConfig::default());

    group.bench_function("builtin_rules_100_commits", |b| {
        b.to_async(TokioExecutor(Runtime::new().unwrap())).iter(|| async {
            // Fresh output root for each iteration
            let out = TempDir::new().unwrap();
            let backends: Vec<Arc<dyn ScannerBackend>> = vec![Arc::new(CustomRuleScanner::builtin())];
            let dispatcher = Dispatcher::new(
                RepoId::new("bench", "history"),
                backends,
                routing.clone(),
                Arc::new(FsSink::new(out.path())),
            );
            black_box(
                run_analysis(&repo_path, dispatcher, HarvestOptions::default(), Box::new(NoopProgress), 64)
                    .await
                    .unwrap(),
            )
        });
    });

    group.finish();
}

fn bench_rules(c: &mut Criterion) {
    let scanner = CustomRuleScanner::builtin();
    let mut text = String::new();
    for i in 0..2_000 {
        text.push_str(&format!("let value_{i} = compute({i});\n"));
        if i % 250 == 0 {
            text.push_str(&format!("password = \"hunter{i:08}\"\n"));
        }
    }

    c.bench_function("builtin_rules_64k_text", |b| {
        b.iter(|| black_box(scanner.scan_bytes(black_box(text.as_bytes()), Some("src/app.py"))));
    });
}

criterion_group!(benches, bench_harvest, bench_analysis, bench_rules);
criterion_main!(benches);
