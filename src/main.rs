use anyhow::{Context, Result, bail};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use secretdig::analyze::{AnalyzeHandler, run_analysis};
use secretdig::clock::{Clock, SystemClock};
use secretdig::config::Settings;
use secretdig::crawl::{CrawlCoordinator, GitFetcher, GitHubApi};
use secretdig::dispatch::{Dispatcher, Routing, backends_from_config};
use secretdig::harvest::{HarvestOptions, IndicatifProgress};
use secretdig::model::{Lane, RepoId};
use secretdig::queue::SqliteBroker;
use secretdig::ratelimit::{RateBudget, SqliteRateBudget};
use secretdig::sink::{FsSink, Layout};
use secretdig::util::format_size;
use secretdig::worker::{PoolOptions, WorkerPool};
use secretdig::{feed, logging};

const USAGE: &str = "usage: secretdig worker [config]    (SIGHUP resumes halted workers)
       secretdig submit <file|-> [config]
       secretdig scan <repo-path> [config]
       secretdig status [config]";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("secretdig=info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_arg = |i: usize| args.get(i).map(PathBuf::from);

    match args.first().map(String::as_str) {
        Some("worker") => run_workers(load_settings(config_arg(1))?).await,
        Some("submit") => {
            let source = args.get(1).context(USAGE)?;
            run_submit(source, load_settings(config_arg(2))?).await
        }
        Some("scan") => {
            let path = args.get(1).context(USAGE)?;
            run_scan(Path::new(path), load_settings(config_arg(2))?).await
        }
        Some("status") => run_status(load_settings(config_arg(1))?).await,
        _ => bail!(USAGE),
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    Settings::load(path.as_deref())
}

async fn open_broker(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Arc<SqliteBroker>> {
    let broker = SqliteBroker::open(&settings.broker.path, &settings.retry, clock)
        .await
        .with_context(|| format!("Could not open queue at {}", settings.broker.path.display()))?;
    Ok(Arc::new(broker))
}

/// Host part of the API base URL, the key of the shared request budget
fn api_host(api_base: &str) -> &str {
    let rest = api_base.split_once("://").map_or(api_base, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

async fn run_workers(settings: Settings) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = open_broker(&settings, clock.clone()).await?;

    let budget: Arc<dyn RateBudget> = Arc::new(
        SqliteRateBudget::new(
            broker.pool().clone(),
            clock.clone(),
            api_host(&settings.crawl.api_base),
            &settings.rate_limit,
        )
        .await
        .context("Could not prepare rate budget")?,
    );
    let host = Arc::new(GitHubApi::new(&settings.crawl, budget.clone())?);
    let fetcher = Arc::new(GitFetcher::new(&settings.crawl));
    let backends = backends_from_config(&settings.backends).context("Invalid custom rule")?;
    let sink = Arc::new(FsSink::new(settings.output.root.clone()));

    let crawl = CrawlCoordinator::new(
        broker.clone(),
        host,
        fetcher,
        budget,
        Layout::new(settings.output.root.clone()),
        settings.crawl.clone(),
    );
    let analyze = AnalyzeHandler::new(
        broker.clone(),
        sink,
        backends,
        Routing::new(&settings.routing),
        settings.harvest.clone(),
    )
    .keep_clones(settings.output.keep_clones);

    let mut pool = WorkerPool::new(broker.clone(), PoolOptions::from_settings(&settings));
    pool.spawn(Arc::new(crawl), settings.workers.crawl);
    pool.spawn(Arc::new(analyze), settings.workers.analyze);

    wait_for_shutdown(&pool).await?;
    info!("shutdown requested, draining workers");
    let drained = pool
        .shutdown(Duration::from_secs(settings.workers.shutdown_grace_secs))
        .await;
    broker.close().await;
    if !drained {
        eprintln!("Some jobs were still running; their leases will expire and be redelivered");
    }
    Ok(())
}

/// Block until Ctrl-C. A SIGHUP in the meantime resumes workers halted by
/// a fatal error, once the operator has fixed its cause.
#[cfg(unix)]
async fn wait_for_shutdown(pool: &WorkerPool) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Could not listen for SIGHUP")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return res.context("Could not listen for shutdown signal"),
            _ = hangup.recv() => {
                let resumed = pool.resume_halted();
                info!(resumed, "hangup received, halted workers resumed");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_pool: &WorkerPool) -> Result<()> {
    tokio::signal::ctrl_c().await.context("Could not listen for shutdown signal")
}

async fn run_submit(source: &str, settings: Settings) -> Result<()> {
    let broker = open_broker(&settings, Arc::new(SystemClock)).await?;
    let report = if source == "-" {
        feed::submit(&broker, std::io::stdin().lock()).await?
    } else {
        let file = std::fs::File::open(source).with_context(|| format!("Could not open {source}"))?;
        feed::submit(&broker, BufReader::new(file)).await?
    };
    broker.close().await;

    eprintln!(
        "Queued {} repositories ({} already queued, {} invalid)",
        report.queued, report.duplicates, report.invalid
    );
    Ok(())
}

async fn run_scan(path: &Path, settings: Settings) -> Result<()> {
    let abs = std::fs::canonicalize(path).with_context(|| format!("Could not resolve path: {}", path.display()))?;
    let name = abs
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim_end_matches(".git").to_string())
        .unwrap_or_else(|| "repo".to_string());
    let repo = RepoId::new("local", name);

    let backends = backends_from_config(&settings.backends).context("Invalid custom rule")?;
    let sink = Arc::new(FsSink::new(settings.output.root.clone()));
    let dispatcher = Dispatcher::new(repo.clone(), backends, Routing::new(&settings.routing), sink);

    eprintln!("Scanning repository at: {}", abs.display());
    let analysis = run_analysis(
        &abs,
        dispatcher,
        HarvestOptions::from(&settings.harvest),
        Box::new(IndicatifProgress::new()),
        settings.harvest.channel_capacity,
    )
    .await?;

    let harvest = &analysis.harvest;
    eprintln!(
        "{} commits, {} reachable blobs, {} dangling blobs ({} store objects), {} partial failures",
        harvest.commits, harvest.reachable_blobs, harvest.dangling_blobs, harvest.store_objects, harvest.failures
    );
    eprintln!(
        "Scan cap {}; results under {}",
        format_size(settings.harvest.max_scan_bytes),
        settings.output.root.display()
    );
    println!("{}", serde_json::to_string_pretty(&analysis.report.families)?);
    Ok(())
}

async fn run_status(settings: Settings) -> Result<()> {
    let broker = open_broker(&settings, Arc::new(SystemClock)).await?;
    for lane in [Lane::Crawl, Lane::Analyze] {
        let stats = broker.stats(lane).await?;
        println!(
            "{:<8} queued {:>6}  leased {:>4}  failed {:>4}  completed {:>6}  dead-letter {:>4}",
            lane.as_str(), stats.queued, stats.leased, stats.failed, stats.completed, stats.dead_letter
        );
    }
    broker.close().await;
    Ok(())
}
