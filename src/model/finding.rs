use serde::{Deserialize, Serialize};

use super::{ObjectHash, RepoId};

/// Raw match returned by a scanner backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMatch {
    pub rule_id: String,
    pub offset: u64,
    pub snippet: String,
    pub confidence: f32,
}

/// A finding attributed to a blob in a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub blob: ObjectHash,
    pub rule_id: String,
    pub offset: u64,
    pub snippet: String,
    pub confidence: f32,
    pub repo: RepoId,
    pub backend: String,
    pub paths: Vec<String>,
}

impl ScanFinding {
    pub fn dedupe_key(&self) -> (ObjectHash, &str, u64) {
        (self.blob, self.rule_id.as_str(), self.offset)
    }
}

/// A hash/backend pair that could not be scanned
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoverageGap {
    pub blob: ObjectHash,
    pub backend: String,
    pub reason: String,
}

/// An object that could not be read during harvest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartialFailure {
    pub object: ObjectHash,
    pub reason: String,
}
