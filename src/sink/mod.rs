//! Result sink
//!
//! Findings, gap markers, restored blob content and per-family summaries
//! are keyed by repository, blob hash and rule id, so writing the same
//! results twice leaves the same files behind.

mod fs;
mod layout;

pub use fs::FsSink;
pub use layout::{Layout, gap_file, rule_file};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::error::PipelineError;
use crate::model::{BlobRecord, CoverageGap, PartialFailure, RepoId, ScanFinding};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode results: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SinkError> for PipelineError {
    fn from(err: SinkError) -> Self {
        match &err {
            SinkError::Io {
                action,
                path,
                source,
            } => PipelineError::from_io(&format!("cannot {action} {}", path.display()), source),
            _ => PipelineError::TransientInfra(err.to_string()),
        }
    }
}

/// A gap recorded against a backend family
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FamilyGap {
    pub family: String,
    pub gap: CoverageGap,
}

/// Everything the dispatcher learned about one blob
pub struct BlobResults<'a> {
    pub repo: &'a RepoId,
    pub record: &'a BlobRecord,
    pub content: Option<&'a [u8]>,
    /// Family -> findings, sorted and deduplicated
    pub findings: &'a BTreeMap<String, Vec<ScanFinding>>,
    pub gaps: &'a [FamilyGap],
    /// `(family, backend id)` pairs that completed for this blob
    pub completed: &'a [(String, String)],
}

impl BlobResults<'_> {
    pub fn has_findings(&self) -> bool {
        self.findings.values().any(|f| !f.is_empty())
    }
}

/// What is on record for one family of one repository
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoredTally {
    pub blobs_with_findings: usize,
    pub findings_by_rule: BTreeMap<String, usize>,
    pub gaps: Vec<CoverageGap>,
}

/// `{family}_findings/{owner}/{repo}/summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilySummary {
    pub repo: String,
    pub family: String,
    pub backends: Vec<String>,
    pub reachable_blobs: usize,
    pub dangling_blobs: usize,
    pub skipped_oversized: usize,
    pub blobs_with_findings: usize,
    pub findings: usize,
    pub findings_by_rule: BTreeMap<String, usize>,
    pub gaps: Vec<CoverageGap>,
    pub partial_failures: Vec<PartialFailure>,
}

/// Durable destination for scan results. Implementations must tolerate the
/// same blob being persisted more than once.
pub trait ResultSink: Send + Sync {
    fn persist(&self, results: &BlobResults<'_>) -> Result<(), SinkError>;

    /// Read back what is stored for a family, across all deliveries
    fn tally(&self, repo: &RepoId, family: &str) -> Result<StoredTally, SinkError>;

    fn write_summary(&self, repo: &RepoId, summary: &FamilySummary) -> Result<(), SinkError>;
}
