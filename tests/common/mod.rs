// Shared test fixtures for integration tests
// Functions here are used across different test files
#![allow(dead_code)]

use async_trait::async_trait;
use git2::{Oid, Repository, Signature};
use secretdig::clock::ManualClock;
use secretdig::config::RetryConfig;
use secretdig::dispatch::{BackendError, ScanMetadata, ScannerBackend};
use secretdig::harvest::{HarvestEvent, HarvestOptions, HarvestSummary, HarvestedBlob, Harvester};
use secretdig::model::{BackendMatch, ObjectHash};
use secretdig::queue::SqliteBroker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Create a temporary git repository
pub fn create_test_repo() -> (TempDir, PathBuf, Repository) {
    let dir = TempDir::new().unwrap();
    let repo_path = dir.path().to_path_buf();
    let repo = Repository::init(&repo_path).unwrap();

    // Configure git user for commits
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Test User").unwrap();
    config.set_str("user.email", "test@example.com").unwrap();

    (dir, repo_path, repo)
}

/// Add files to the repository and create a commit on HEAD
pub fn add_commit(repo: &Repository, files: &[(&str, &[u8])], message: &str) -> Oid {
    let mut index = repo.index().unwrap();

    for (path, content) in files {
        let full_path = repo.workdir().unwrap().join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full_path, content).unwrap();
        index.add_path(Path::new(path)).unwrap();
    }

    index.write().unwrap();
    commit_index(repo, &mut index, message)
}

/// Remove a file from the repository and create a commit
pub fn remove_file_commit(repo: &Repository, path: &str, message: &str) -> Oid {
    let full_path = repo.workdir().unwrap().join(path);
    if full_path.exists() {
        std::fs::remove_file(&full_path).unwrap();
    }

    let mut index = repo.index().unwrap();
    index.remove_path(Path::new(path)).unwrap();
    index.write().unwrap();
    commit_index(repo, &mut index, message)
}

fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Oid {
    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

/// Force the current branch back to `target`, leaving later commits
/// unreferenced (a history rewrite)
pub fn rewrite_branch_to(repo: &Repository, target: Oid) {
    let branch = repo.head().unwrap().name().unwrap().to_string();
    repo.reference(&branch, target, true, "rewrite history").unwrap();
}

/// Write a blob no commit or tree refers to
pub fn write_orphan_blob(repo: &Repository, content: &[u8]) -> Oid {
    repo.blob(content).unwrap()
}

/// Overwrite a loose object with bytes that do not inflate
pub fn corrupt_loose_object(repo_path: &Path, oid: Oid) {
    let hex = oid.to_string();
    let path = repo_path
        .join(".git")
        .join("objects")
        .join(&hex[..2])
        .join(&hex[2..]);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_readonly(false);
    std::fs::set_permissions(&path, perms).unwrap();
    std::fs::write(&path, b"definitely not zlib").unwrap();
}

pub fn hash_of(oid: Oid) -> ObjectHash {
    ObjectHash::from_slice(oid.as_bytes()).unwrap()
}

/// Run a full harvest with default options
pub fn harvest(path: &Path) -> (Vec<HarvestEvent>, HarvestSummary) {
    Harvester::new(path, HarvestOptions::default()).collect().unwrap()
}

pub fn blobs(events: &[HarvestEvent]) -> Vec<&HarvestedBlob> {
    events
        .iter()
        .filter_map(|e| match e {
            HarvestEvent::Blob(blob) => Some(blob),
            HarvestEvent::Failure(_) => None,
        })
        .collect()
}

pub fn find_blob<'a>(events: &'a [HarvestEvent], oid: Oid) -> Option<&'a HarvestedBlob> {
    let hash = hash_of(oid);
    blobs(events).into_iter().find(|b| b.record.hash == hash)
}

pub async fn memory_broker(clock: Arc<ManualClock>) -> Arc<SqliteBroker> {
    let retry = RetryConfig {
        max_attempts: 3,
        backoff_base_ms: 1_000,
        backoff_max_ms: 10_000,
        jitter_ratio: 0.0,
    };
    Arc::new(SqliteBroker::in_memory(&retry, clock).await.unwrap())
}

/// Recursively list files under `root` as sorted relative paths with contents
pub fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(String, Vec<u8>)>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Backend that counts calls and reports a match whenever `needle` occurs
pub struct CountingBackend {
    pub id: &'static str,
    pub family: &'static str,
    pub needle: &'static [u8],
    pub calls: AtomicUsize,
}

impl CountingBackend {
    pub fn new(id: &'static str, family: &'static str, needle: &'static [u8]) -> Self {
        Self {
            id,
            family,
            needle,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScannerBackend for CountingBackend {
    fn id(&self) -> &str {
        self.id
    }

    fn family(&self) -> &str {
        self.family
    }

    async fn scan(&self, content: &[u8], _meta: &ScanMetadata) -> Result<Vec<BackendMatch>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let found = content
            .windows(self.needle.len())
            .position(|w| w == self.needle);
        Ok(found
            .map(|offset| BackendMatch {
                rule_id: "needle".to_string(),
                offset: offset as u64,
                snippet: String::from_utf8_lossy(self.needle).into_owned(),
                confidence: 1.0,
            })
            .into_iter()
            .collect())
    }
}

/// Backend that panics on content containing `trigger`
pub struct CrashingBackend {
    pub trigger: &'static [u8],
}

#[async_trait]
impl ScannerBackend for CrashingBackend {
    fn id(&self) -> &str {
        "crashy"
    }

    fn family(&self) -> &str {
        "crashy"
    }

    async fn scan(&self, content: &[u8], _meta: &ScanMetadata) -> Result<Vec<BackendMatch>, BackendError> {
        if content.windows(self.trigger.len()).any(|w| w == self.trigger) {
            panic!("scanner crashed");
        }
        Ok(Vec::new())
    }
}
