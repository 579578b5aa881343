//! Analyze lane: harvest a local mirror and dispatch every blob
//!
//! The git walk runs on the blocking pool and hands events over a bounded
//! channel, so a slow backend holds the walk back instead of letting
//! recovered content pile up in memory.

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{HarvestConfig, ResumeMode};
use crate::crawl::remove_mirror;
use crate::dispatch::{Dispatcher, RepoReport, Routing, ScannerBackend};
use crate::error::{ErrorKind, PipelineError};
use crate::harvest::{HarvestOptions, HarvestSummary, Harvester, LogProgress, ProgressReporter};
use crate::model::{AnalyzeJob, Lane, RepoJob};
use crate::queue::{LeasedJob, SqliteBroker};
use crate::sink::ResultSink;
use crate::worker::JobHandler;

#[derive(Debug)]
pub struct Analysis {
    pub report: RepoReport,
    pub harvest: HarvestSummary,
}

/// Stream a harvest of `store` through `dispatcher`, then write the
/// per-family summaries
pub async fn run_analysis(
    store: &Path,
    dispatcher: Dispatcher,
    mut options: HarvestOptions,
    progress: Box<dyn ProgressReporter>,
    capacity: usize,
) -> Result<Analysis, PipelineError> {
    let mut dispatcher = dispatcher;
    options.wants_content = dispatcher.content_filter();
    let harvester = Harvester::new(store, options).with_progress(progress);

    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let walk = tokio::task::spawn_blocking(move || {
        harvester.run(|event| match tx.blocking_send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        })
    });

    let mut dispatch_error = None;
    while let Some(event) = rx.recv().await {
        if let Err(e) = dispatcher.handle(event).await {
            dispatch_error = Some(e);
            break;
        }
    }
    // stops the walk if dispatch bailed out early
    drop(rx);

    let walked = walk
        .await
        .map_err(|e| PipelineError::transient(format!("harvest task failed: {e}")))?;
    if let Some(e) = dispatch_error {
        return Err(e);
    }
    let harvest = walked?;
    let report = dispatcher.finish().await?;
    Ok(Analysis { report, harvest })
}

pub struct AnalyzeHandler {
    broker: Arc<SqliteBroker>,
    sink: Arc<dyn ResultSink>,
    backends: Vec<Arc<dyn ScannerBackend>>,
    routing: Routing,
    harvest: HarvestConfig,
    keep_clones: bool,
}

impl AnalyzeHandler {
    pub fn new(
        broker: Arc<SqliteBroker>,
        sink: Arc<dyn ResultSink>,
        backends: Vec<Arc<dyn ScannerBackend>>,
        routing: Routing,
        harvest: HarvestConfig,
    ) -> Self {
        Self {
            broker,
            sink,
            backends,
            routing,
            harvest,
            keep_clones: false,
        }
    }

    pub fn keep_clones(mut self, keep: bool) -> Self {
        self.keep_clones = keep;
        self
    }

    pub async fn analyze(&self, job: &AnalyzeJob, last_delivery: bool) -> Result<Analysis, PipelineError> {
        let repo = &job.repo;
        if !job.store_path.join("HEAD").is_file() {
            // Mirror lost: fetch it again. The analyze job stays active so the
            // crawl's enqueue folds into it instead of being retired by an ack.
            let queued = self
                .broker
                .enqueue(Lane::Crawl, &RepoJob { repo: repo.clone() }, &repo.to_string())
                .await?;
            warn!(%repo, store = %job.store_path.display(), crawl_job = %queued.id, "object store missing, crawl requeued");
            return Err(PipelineError::transient(format!(
                "object store for {repo} missing; waiting for crawl"
            )));
        }

        let mut dispatcher = Dispatcher::new(
            repo.clone(),
            self.backends.clone(),
            self.routing.clone(),
            self.sink.clone(),
        );
        if self.harvest.resume == ResumeMode::SkipScanned {
            dispatcher = dispatcher.with_ledger(self.broker.clone());
        }

        let progress = Box::new(LogProgress {
            repo: repo.to_string(),
        });
        let result = run_analysis(
            &job.store_path,
            dispatcher,
            HarvestOptions::from(&self.harvest),
            progress,
            self.harvest.channel_capacity,
        )
        .await;

        match result {
            Ok(analysis) => {
                self.broker.mark_processed(repo).await?;
                self.broker.clear_ledger(repo).await?;
                if !self.keep_clones {
                    remove_mirror(&job.store_path).await;
                }
                info!(
                    %repo,
                    reachable = analysis.harvest.reachable_blobs,
                    dangling = analysis.harvest.dangling_blobs,
                    findings = analysis.report.stats.findings,
                    gaps = analysis.report.stats.gaps,
                    "repository analysed"
                );
                Ok(analysis)
            }
            Err(err) => {
                let terminal = matches!(err, PipelineError::Permanent(_))
                    || (last_delivery && !matches!(err.kind(), ErrorKind::Fatal | ErrorKind::RateLimited));
                if terminal && !self.keep_clones {
                    remove_mirror(&job.store_path).await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl JobHandler for AnalyzeHandler {
    fn lane(&self) -> Lane {
        Lane::Analyze
    }

    async fn handle(&self, job: &LeasedJob) -> Result<(), PipelineError> {
        let payload: AnalyzeJob = job.payload()?;
        self.analyze(&payload, job.is_last_attempt()).await.map(|_| ())
    }
}
