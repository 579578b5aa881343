//! Scan dispatcher
//!
//! Consumes harvested blobs, routes each to the backends registered for its
//! category, and hands the merged results to the sink. Within one job a
//! backend sees a given hash at most once; a failing backend becomes a
//! coverage gap for that blob and never affects other backends or blobs.

mod backend;
mod external;
mod routing;
mod rules;

pub use backend::{BackendError, ScanMetadata, ScannerBackend};
pub use external::{ExternalToolScanner, parse_output};
pub use routing::Routing;
pub use rules::{CustomRuleScanner, Rule};

use async_trait::async_trait;
use futures::FutureExt;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BackendsConfig;
use crate::error::PipelineError;
use crate::harvest::{ContentFilter, HarvestEvent, HarvestedBlob};
use crate::model::{Classification, CoverageGap, ObjectHash, PartialFailure, RepoId, ScanFinding};
use crate::sink::{BlobResults, FamilyGap, FamilySummary, ResultSink};

/// Partial failures listed in a summary; the count is always complete
const MAX_REPORTED_FAILURES: usize = 1000;

/// Record of backend calls already completed by an earlier delivery
#[async_trait]
pub trait ScanLedger: Send + Sync {
    async fn already_scanned(
        &self,
        repo: &RepoId,
        hash: &ObjectHash,
        backend: &str,
    ) -> Result<bool, PipelineError>;

    async fn record_scanned(
        &self,
        repo: &RepoId,
        hash: &ObjectHash,
        backend: &str,
    ) -> Result<(), PipelineError>;
}

/// `(hash, backend)` pairs already sent this job
#[derive(Debug, Default)]
pub struct ScanCache {
    seen: FxHashSet<(ObjectHash, usize)>,
}

impl ScanCache {
    /// True the first time a pair is offered
    pub fn first_visit(&mut self, hash: ObjectHash, backend: usize) -> bool {
        self.seen.insert((hash, backend))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchStats {
    pub reachable_blobs: usize,
    pub dangling_blobs: usize,
    pub skipped_oversized: usize,
    pub unrouted: usize,
    pub invocations: usize,
    /// Backend calls skipped because an earlier delivery completed them
    pub resumed: usize,
    pub findings: usize,
    pub gaps: usize,
    pub partial_failures: usize,
}

#[derive(Debug, Clone)]
pub struct RepoReport {
    pub repo: RepoId,
    pub stats: DispatchStats,
    pub families: Vec<FamilySummary>,
}

/// Build the enabled backends from configuration
pub fn backends_from_config(config: &BackendsConfig) -> Result<Vec<Arc<dyn ScannerBackend>>, regex::Error> {
    let mut backends: Vec<Arc<dyn ScannerBackend>> = Vec::new();
    if config.custom_rules.enabled {
        backends.push(Arc::new(CustomRuleScanner::from_config(&config.custom_rules)?));
    }
    for tool in config.external.iter().filter(|t| t.enabled) {
        backends.push(Arc::new(ExternalToolScanner::new(tool.clone())));
    }
    Ok(backends)
}

pub struct Dispatcher {
    repo: RepoId,
    backends: Vec<Arc<dyn ScannerBackend>>,
    routing: Routing,
    sink: Arc<dyn ResultSink>,
    ledger: Option<Arc<dyn ScanLedger>>,
    cache: ScanCache,
    stats: DispatchStats,
    failures: Vec<PartialFailure>,
}

impl Dispatcher {
    pub fn new(
        repo: RepoId,
        backends: Vec<Arc<dyn ScannerBackend>>,
        routing: Routing,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            repo,
            backends,
            routing,
            sink,
            ledger: None,
            cache: ScanCache::default(),
            stats: DispatchStats::default(),
            failures: Vec::new(),
        }
    }

    /// Skip backend calls an earlier delivery already completed
    pub fn with_ledger(mut self, ledger: Arc<dyn ScanLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Content filter for the harvester: load bytes only when some
    /// registered backend would look at them
    pub fn content_filter(&self) -> ContentFilter {
        let routing = self.routing.clone();
        let backends = self.backends.clone();
        Arc::new(move |classification: &Classification| {
            routing.backends_for(classification).iter().any(|id| {
                backends
                    .iter()
                    .any(|b| b.id() == id && b.relevant_for(classification))
            })
        })
    }

    pub async fn handle(&mut self, event: HarvestEvent) -> Result<(), PipelineError> {
        match event {
            HarvestEvent::Blob(blob) => self.dispatch(blob).await,
            HarvestEvent::Failure(failure) => {
                self.stats.partial_failures += 1;
                self.failures.push(failure);
                Ok(())
            }
        }
    }

    pub async fn dispatch(&mut self, blob: HarvestedBlob) -> Result<(), PipelineError> {
        let HarvestedBlob {
            record,
            content,
            truncated,
        } = blob;

        if record.reachable {
            self.stats.reachable_blobs += 1;
        } else {
            self.stats.dangling_blobs += 1;
        }

        let routed: Vec<usize> = self
            .routing
            .backends_for(&record.classification)
            .iter()
            .filter_map(|id| self.backends.iter().position(|b| b.id() == id))
            .filter(|&i| self.backends[i].relevant_for(&record.classification))
            .collect();

        let Some(content) = content else {
            if !routed.is_empty() && record.classification.oversized {
                self.stats.skipped_oversized += 1;
            } else {
                self.stats.unrouted += 1;
            }
            return Ok(());
        };
        if routed.is_empty() {
            self.stats.unrouted += 1;
            return Ok(());
        }

        let metadata = ScanMetadata {
            repo: self.repo.clone(),
            hash: record.hash,
            path_hint: record.path_hint().map(str::to_string),
            commit: record.first_commit(),
            classification: record.classification,
            truncated,
        };
        let paths = record.paths();

        let mut findings: BTreeMap<String, Vec<ScanFinding>> = BTreeMap::new();
        let mut gaps: Vec<FamilyGap> = Vec::new();
        let mut completed: Vec<(String, String)> = Vec::new();

        for index in routed {
            if !self.cache.first_visit(record.hash, index) {
                continue;
            }
            let backend = Arc::clone(&self.backends[index]);
            if let Some(ledger) = &self.ledger {
                if ledger.already_scanned(&self.repo, &record.hash, backend.id()).await? {
                    self.stats.resumed += 1;
                    continue;
                }
            }

            self.stats.invocations += 1;
            let outcome = AssertUnwindSafe(backend.scan(&content, &metadata))
                .catch_unwind()
                .await;
            let reason = match outcome {
                Ok(Ok(matches)) => {
                    let family = findings.entry(backend.family().to_string()).or_default();
                    family.extend(matches.into_iter().map(|m| ScanFinding {
                        blob: record.hash,
                        rule_id: m.rule_id,
                        offset: m.offset,
                        snippet: m.snippet,
                        confidence: m.confidence,
                        repo: self.repo.clone(),
                        backend: backend.id().to_string(),
                        paths: paths.clone(),
                    }));
                    completed.push((backend.family().to_string(), backend.id().to_string()));
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "backend panicked".to_string(),
            };

            warn!(repo = %self.repo, hash = %record.hash, backend = backend.id(), %reason, "backend unavailable");
            gaps.push(FamilyGap {
                family: backend.family().to_string(),
                gap: CoverageGap {
                    blob: record.hash,
                    backend: backend.id().to_string(),
                    reason,
                },
            });
        }

        for list in findings.values_mut() {
            list.sort_by(|a, b| {
                a.rule_id
                    .cmp(&b.rule_id)
                    .then(a.offset.cmp(&b.offset))
                    .then_with(|| a.backend.cmp(&b.backend))
            });
            list.dedup_by(|a, b| a.dedupe_key() == b.dedupe_key());
        }
        findings.retain(|_, list| !list.is_empty());

        let found: usize = findings.values().map(Vec::len).sum();
        self.stats.findings += found;
        self.stats.gaps += gaps.len();
        if found > 0 {
            debug!(repo = %self.repo, hash = %record.hash, findings = found, "blob has findings");
        }

        self.sink.persist(&BlobResults {
            repo: &self.repo,
            record: &record,
            content: Some(content.as_slice()),
            findings: &findings,
            gaps: &gaps,
            completed: &completed,
        })?;

        if let Some(ledger) = &self.ledger {
            for (_, backend) in &completed {
                ledger.record_scanned(&self.repo, &record.hash, backend).await?;
            }
        }
        Ok(())
    }

    /// Write one summary per backend family from what the sink holds
    pub async fn finish(mut self) -> Result<RepoReport, PipelineError> {
        self.failures.sort();
        self.failures.dedup();
        self.failures.truncate(MAX_REPORTED_FAILURES);

        let mut families: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for backend in &self.backends {
            families
                .entry(backend.family().to_string())
                .or_default()
                .push(backend.id().to_string());
        }

        let mut summaries = Vec::with_capacity(families.len());
        for (family, mut backends) in families {
            backends.sort();
            let tally = self.sink.tally(&self.repo, &family)?;
            let summary = FamilySummary {
                repo: self.repo.to_string(),
                family,
                backends,
                reachable_blobs: self.stats.reachable_blobs,
                dangling_blobs: self.stats.dangling_blobs,
                skipped_oversized: self.stats.skipped_oversized,
                blobs_with_findings: tally.blobs_with_findings,
                findings: tally.findings_by_rule.values().sum(),
                findings_by_rule: tally.findings_by_rule,
                gaps: tally.gaps,
                partial_failures: self.failures.clone(),
            };
            self.sink.write_summary(&self.repo, &summary)?;
            summaries.push(summary);
        }

        info!(
            repo = %self.repo,
            reachable = self.stats.reachable_blobs,
            dangling = self.stats.dangling_blobs,
            invocations = self.stats.invocations,
            findings = self.stats.findings,
            gaps = self.stats.gaps,
            "dispatch complete"
        );
        Ok(RepoReport {
            repo: self.repo,
            stats: self.stats,
            families: summaries,
        })
    }
}
