//! Scanner backend capability

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{BackendMatch, Classification, ContentKind, ObjectHash, RepoId};

/// Context handed to a backend alongside the blob bytes
#[derive(Debug, Clone, Serialize)]
pub struct ScanMetadata {
    pub repo: RepoId,
    pub hash: ObjectHash,
    pub path_hint: Option<String>,
    pub commit: Option<ObjectHash>,
    pub classification: Classification,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend crashed: {0}")]
    Crashed(String),
    #[error("backend timed out after {0}s")]
    Timeout(u64),
    #[error("backend exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },
    #[error("backend output unreadable: {0}")]
    Output(String),
    #[error("backend I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A detector the dispatcher can route content to.
///
/// `scan` returns matches ordered by offset. Any error is treated as the
/// backend being unavailable for this blob; it never fails the job.
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    /// Stable id used in routing tables and gap markers
    fn id(&self) -> &str;

    /// Output family, i.e. the `{family}_findings/` directory
    fn family(&self) -> &str;

    fn relevant_for(&self, classification: &Classification) -> bool {
        classification.content != ContentKind::Binary
    }

    async fn scan(
        &self,
        content: &[u8],
        metadata: &ScanMetadata,
    ) -> Result<Vec<BackendMatch>, BackendError>;
}
