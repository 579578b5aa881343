//! Git object harvester
//!
//! Recovers every distinct blob from a local object store, reachable or not.
//!
//! # Phases
//!
//! 1. **refs**: enumerate refs and HEAD, peel annotated tags
//! 2. **graph**: iterative walk of the commit DAG into an arena, then a
//!    parents-first topological order
//! 3. **diff**: each commit's tree against each parent's (root commits
//!    against the empty tree); blobs are emitted the first time their hash
//!    shows up, with the provenance collected within that commit
//! 4. **inventory**: list every object in packs and loose storage and
//!    subtract the reachable set
//! 5. **dangling**: walk unreachable commits and trees to attach orphaned
//!    paths, then emit the dangling blobs in hash order
//!
//! Blobs are streamed to the caller one by one, so only hash sets and the
//! commit arena are held in memory. Unreadable objects are reported as
//! [`HarvestEvent::Failure`] and never stop the walk.

mod classify;
mod content;
mod diff;
mod graph;
mod interner;
mod odb;
mod progress;

pub use classify::{category_for_path, classify, probe};
pub use content::{BlobLoader, LoadedContent};
pub use diff::{DiffEvent, TreeDiffer};
pub use graph::{CommitGraph, RefRoots};
pub use interner::{PathId, PathInterner};
pub use odb::ObjectInventory;
pub use progress::{IndicatifProgress, LogProgress, NoopProgress, ProgressHandle, ProgressReporter};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{HarvestConfig, OversizePolicy};
use crate::error::PipelineError;
use crate::model::{
    BlobRecord, Category, Change, Classification, ObjectHash, ObjectKind, PartialFailure,
    Provenance,
};

/// One unit of harvest output
#[derive(Debug)]
pub enum HarvestEvent {
    Blob(HarvestedBlob),
    Failure(PartialFailure),
}

/// A blob record plus the bytes the dispatcher may scan
#[derive(Debug)]
pub struct HarvestedBlob {
    pub record: BlobRecord,
    /// `None` when skipped (oversized with the skip policy, or unwanted)
    pub content: Option<Vec<u8>>,
    pub truncated: bool,
}

pub type ContentFilter = Arc<dyn Fn(&Classification) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct HarvestOptions {
    pub max_scan_bytes: u64,
    pub oversized: OversizePolicy,
    pub max_provenance: usize,
    /// Decides whether content is loaded for a classified blob
    pub wants_content: ContentFilter,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

impl From<&HarvestConfig> for HarvestOptions {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            max_scan_bytes: config.max_scan_bytes,
            oversized: config.oversized,
            max_provenance: config.max_provenance.max(1),
            wants_content: Arc::new(|_: &Classification| true),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct HarvestSummary {
    pub refs: usize,
    pub commits: usize,
    pub trees: usize,
    pub store_objects: usize,
    pub reachable_blobs: usize,
    pub dangling_blobs: usize,
    pub dangling_commits: usize,
    pub dangling_trees: usize,
    pub deleted_paths: usize,
    pub failures: usize,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("cannot open repository {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("cannot read refs: {0}")]
    Refs(String),
    #[error("harvest stopped by consumer")]
    Stopped,
}

impl From<HarvestError> for PipelineError {
    fn from(err: HarvestError) -> Self {
        PipelineError::TransientInfra(err.to_string())
    }
}

pub struct Harvester {
    path: PathBuf,
    options: HarvestOptions,
    progress: Box<dyn ProgressReporter>,
}

struct PendingBlob {
    hash: ObjectHash,
    provenance: Vec<Provenance>,
}

impl Harvester {
    pub fn new(path: impl AsRef<Path>, options: HarvestOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            progress: Box::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Collect every event into memory (tests and small repositories)
    pub fn collect(&self) -> Result<(Vec<HarvestEvent>, HarvestSummary), HarvestError> {
        let mut events = Vec::new();
        let summary = self.run(|event| {
            events.push(event);
            ControlFlow::Continue(())
        })?;
        Ok((events, summary))
    }

    /// Run all phases, handing each event to `emit` as soon as it is ready.
    /// Returning `ControlFlow::Break` from `emit` stops the harvest.
    pub fn run<F>(&self, mut emit: F) -> Result<HarvestSummary, HarvestError>
    where
        F: FnMut(HarvestEvent) -> ControlFlow<()>,
    {
        let open_err = |reason: String| HarvestError::Open {
            path: self.path.clone(),
            reason,
        };
        let gix_repo = gix::open(&self.path).map_err(|e| open_err(e.to_string()))?;
        let git_repo =
            git2::Repository::open(&self.path).map_err(|e| open_err(e.message().to_string()))?;
        let loader = BlobLoader::new(&git_repo, self.options.max_scan_bytes, self.options.oversized)
            .map_err(|e| open_err(e.message().to_string()))?;
        let odb = gix_repo.objects.clone();
        let objects_dir = gix_repo.objects.store_ref().path().to_path_buf();

        let mut summary = HarvestSummary::default();
        let mut out = Emitter {
            loader: &loader,
            options: &self.options,
            seen_blobs: FxHashSet::default(),
            summary: &mut summary,
            emit: &mut emit,
        };

        // Phase 1: refs
        let roots = RefRoots::collect(&git_repo).map_err(|e| HarvestError::Refs(e.message().to_string()))?;
        out.summary.refs = roots.refs;
        for failure in &roots.failures {
            out.failure(failure.clone())?;
        }

        // Phase 2: commit graph
        let graph = CommitGraph::walk(&odb, &roots.commits);
        out.summary.commits = graph.len();
        for failure in &graph.unreadable {
            out.failure(failure.clone())?;
        }
        debug!(refs = roots.refs, commits = graph.len(), "commit graph built");

        // Tip snapshot: blobs still present in some ref's tree
        let mut differ = TreeDiffer::new(&odb);
        let mut tip_blobs: FxHashSet<ObjectHash> = roots.blobs.iter().copied().collect();
        {
            let mut visited = FxHashSet::default();
            let tip_trees = roots
                .commits
                .iter()
                .filter_map(|c| graph.get(c).map(|n| n.tree))
                .chain(roots.trees.iter().copied());
            for tree in tip_trees {
                differ.collect_blobs(tree, &mut visited, &mut tip_blobs);
            }
        }

        // Phase 3: diff in topological order
        let order = graph.topo_order();
        let pb = self.progress.start("Diffing commits", order.len() as u64);
        for idx in order {
            let node = graph.node(idx);
            let mut pending: Vec<PendingBlob> = Vec::new();
            let mut pending_index: FxHashMap<ObjectHash, usize> = FxHashMap::default();
            let mut failures: Vec<PartialFailure> = Vec::new();

            let parent_trees: Vec<Option<ObjectHash>> = if node.parents.is_empty() {
                vec![None]
            } else {
                node.parents
                    .iter()
                    .map(|p| graph.get(p).map(|parent| parent.tree))
                    .collect()
            };

            for parent_tree in parent_trees {
                differ.diff(parent_tree, node.tree, b"", |event| match event {
                    DiffEvent::Blob { oid, path, change } => {
                        let provenance = Provenance {
                            path: String::from_utf8_lossy(path).into_owned(),
                            commit: Some(node.hash),
                            change,
                            present: true,
                        };
                        if let Some(&i) = pending_index.get(&oid) {
                            if pending[i].provenance.len() < self.options.max_provenance {
                                pending[i].provenance.push(provenance);
                            }
                        } else if !out.seen_blobs.contains(&oid) {
                            pending_index.insert(oid, pending.len());
                            pending.push(PendingBlob {
                                hash: oid,
                                provenance: vec![provenance],
                            });
                        }
                    }
                    DiffEvent::Deleted { .. } => out.summary.deleted_paths += 1,
                    DiffEvent::Unreadable { object, reason } => {
                        failures.push(PartialFailure { object, reason })
                    }
                });
            }

            for failure in failures {
                out.failure(failure)?;
            }
            for blob in pending {
                let deleted_at_tips = !tip_blobs.contains(&blob.hash);
                out.blob(blob.hash, blob.provenance, true, deleted_at_tips)?;
            }
            pb.inc(1);
        }
        pb.finish();

        // Blobs and trees named directly by tags
        for tree in &roots.trees {
            let mut pending: Vec<PendingBlob> = Vec::new();
            differ.diff(None, *tree, b"", |event| {
                if let DiffEvent::Blob { oid, path, change } = event {
                    if !out.seen_blobs.contains(&oid) && !pending.iter().any(|p| p.hash == oid) {
                        pending.push(PendingBlob {
                            hash: oid,
                            provenance: vec![Provenance {
                                path: String::from_utf8_lossy(path).into_owned(),
                                commit: None,
                                change,
                                present: true,
                            }],
                        });
                    }
                }
            });
            for blob in pending {
                out.blob(blob.hash, blob.provenance, true, false)?;
            }
        }
        for blob in &roots.blobs {
            if !out.seen_blobs.contains(blob) {
                out.blob(*blob, Vec::new(), true, false)?;
            }
        }
        out.summary.trees = differ.trees_visited();
        out.summary.reachable_blobs = out.seen_blobs.len();

        // Phase 4: inventory minus reachable
        let inventory = ObjectInventory::load(&objects_dir);
        out.summary.store_objects = inventory.len();
        for index in &inventory.unreadable {
            debug!(index = %index, "pack index skipped");
            out.summary.failures += 1;
        }

        let reachable_tags: FxHashSet<ObjectHash> = roots.tags.iter().copied().collect();
        let mut dangling_commits = Vec::new();
        let mut dangling_trees = Vec::new();
        let mut dangling_blobs: FxHashSet<ObjectHash> = FxHashSet::default();

        let pb = self.progress.start("Enumerating store", inventory.len() as u64);
        for &hash in &inventory.objects {
            pb.inc(1);
            if out.seen_blobs.contains(&hash)
                || differ.seen_trees().contains(&hash)
                || graph.contains(&hash)
                || reachable_tags.contains(&hash)
            {
                continue;
            }
            match out.loader.header(hash) {
                Ok((_, Some(ObjectKind::Commit))) => dangling_commits.push(hash),
                Ok((_, Some(ObjectKind::Tree))) => dangling_trees.push(hash),
                Ok((_, Some(ObjectKind::Blob))) => {
                    dangling_blobs.insert(hash);
                }
                Ok(_) => {}
                Err(reason) => out.failure(PartialFailure {
                    object: hash,
                    reason: format!("object header unreadable: {}", reason),
                })?,
            }
        }
        pb.finish();
        out.summary.dangling_commits = dangling_commits.len();
        out.summary.dangling_trees = dangling_trees.len();

        // Phase 5: orphaned provenance for dangling blobs
        let mut interner = PathInterner::new();
        let mut orphan_paths: FxHashMap<ObjectHash, Vec<(PathId, Option<ObjectHash>)>> =
            FxHashMap::default();
        let mut record_orphan = |commit: Option<ObjectHash>,
                                 event: DiffEvent<'_>,
                                 interner: &mut PathInterner| {
            if let DiffEvent::Blob { oid, path, .. } = event {
                if dangling_blobs.contains(&oid) {
                    let entry = orphan_paths.entry(oid).or_default();
                    if entry.len() < self.options.max_provenance {
                        entry.push((interner.intern(path), commit));
                    }
                }
            }
        };

        let dangling_commit_set: FxHashSet<ObjectHash> = dangling_commits.iter().copied().collect();
        let dangling_graph =
            CommitGraph::walk_filtered(&odb, &dangling_commits, |h| dangling_commit_set.contains(h));
        for failure in &dangling_graph.unreadable {
            out.failure(failure.clone())?;
        }
        for idx in dangling_graph.topo_order() {
            let node = dangling_graph.node(idx);
            if differ.seen_trees().contains(&node.tree) {
                continue;
            }
            differ.diff(None, node.tree, b"", |event| {
                record_orphan(Some(node.hash), event, &mut interner)
            });
        }
        // Outermost trees first, so nested ones are reached with their full path
        let mut nested: FxHashSet<ObjectHash> = FxHashSet::default();
        for tree in &dangling_trees {
            if let Ok(entries) = differ.read_entries(*tree) {
                nested.extend(
                    entries
                        .iter()
                        .filter(|e| e.kind == ObjectKind::Tree)
                        .map(|e| e.target),
                );
            }
        }
        let (outer, inner): (Vec<ObjectHash>, Vec<ObjectHash>) =
            dangling_trees.iter().copied().partition(|t| !nested.contains(t));
        for tree in outer.into_iter().chain(inner) {
            differ.diff(None, tree, b"", |event| record_orphan(None, event, &mut interner));
        }

        let mut dangling: Vec<ObjectHash> = dangling_blobs.iter().copied().collect();
        dangling.sort_unstable();
        for hash in dangling {
            let provenance = orphan_paths
                .remove(&hash)
                .unwrap_or_default()
                .into_iter()
                .map(|(path_id, commit)| Provenance {
                    path: interner.resolve(path_id).into_owned(),
                    commit,
                    change: Change::Orphaned,
                    present: true,
                })
                .collect();
            out.blob(hash, provenance, false, false)?;
            out.summary.dangling_blobs += 1;
        }

        info!(
            path = %self.path.display(),
            commits = summary.commits,
            reachable = summary.reachable_blobs,
            dangling = summary.dangling_blobs,
            failures = summary.failures,
            "harvest complete"
        );
        Ok(summary)
    }
}

/// Builds records for first-seen hashes and forwards events to the consumer
struct Emitter<'a, 'r, F> {
    loader: &'a BlobLoader<'r>,
    options: &'a HarvestOptions,
    seen_blobs: FxHashSet<ObjectHash>,
    summary: &'a mut HarvestSummary,
    emit: &'a mut F,
}

impl<F> Emitter<'_, '_, F>
where
    F: FnMut(HarvestEvent) -> ControlFlow<()>,
{
    fn send(&mut self, event: HarvestEvent) -> Result<(), HarvestError> {
        match (self.emit)(event) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(HarvestError::Stopped),
        }
    }

    fn failure(&mut self, failure: PartialFailure) -> Result<(), HarvestError> {
        debug!(object = %failure.object, reason = %failure.reason, "skipping unreadable object");
        self.summary.failures += 1;
        self.send(HarvestEvent::Failure(failure))
    }

    fn blob(
        &mut self,
        hash: ObjectHash,
        mut provenance: Vec<Provenance>,
        reachable: bool,
        deleted_at_tips: bool,
    ) -> Result<(), HarvestError> {
        if !self.seen_blobs.insert(hash) {
            return Ok(());
        }

        let size = match self.loader.header(hash) {
            Ok((size, _)) => size,
            Err(reason) => {
                return self.failure(PartialFailure {
                    object: hash,
                    reason: format!("blob unreadable: {}", reason),
                });
            }
        };

        provenance.sort();
        provenance.dedup();
        let path_hint = provenance.first().map(|p| p.path.clone());

        let preliminary = classify(path_hint.as_deref(), size, None, self.options.max_scan_bytes);
        let needs_probe = preliminary.category == Category::Unknown;

        let (content, truncated) = if needs_probe || (self.options.wants_content)(&preliminary) {
            match self.loader.load(hash, size) {
                Ok(LoadedContent { bytes, truncated }) => (bytes, truncated),
                Err(reason) => {
                    return self.failure(PartialFailure {
                        object: hash,
                        reason: format!("blob unreadable: {}", reason),
                    });
                }
            }
        } else {
            (None, false)
        };

        let classification = classify(
            path_hint.as_deref(),
            size,
            content.as_deref(),
            self.options.max_scan_bytes,
        );
        let content = if (self.options.wants_content)(&classification) {
            content
        } else {
            None
        };

        let record = BlobRecord {
            hash,
            size,
            reachable,
            deleted_at_tips: reachable && deleted_at_tips,
            classification,
            provenance,
        };
        self.send(HarvestEvent::Blob(HarvestedBlob {
            record,
            content,
            truncated,
        }))
    }
}
