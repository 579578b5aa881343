use serde::{Deserialize, Serialize};

use super::ObjectHash;

/// What a diff said happened to a path at a given commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Added,
    Modified,
    Deleted,
    /// Seen inside an unreachable commit or tree, not via a parent diff
    Orphaned,
}

/// One place a blob was observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Provenance {
    pub path: String,
    pub commit: Option<ObjectHash>,
    pub change: Change,
    /// Whether the blob is present in the tree of `commit` at `path`
    pub present: bool,
}

/// Coarse content category used for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Source,
    Config,
    EnvFile,
    Document,
    CompiledArtifact,
    BytecodeCache,
    Media,
    /// No surviving path; category inferred from content only
    Unknown,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Source => "source",
            Category::Config => "config",
            Category::EnvFile => "env_file",
            Category::Document => "document",
            Category::CompiledArtifact => "compiled_artifact",
            Category::BytecodeCache => "bytecode_cache",
            Category::Media => "media",
            Category::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Binary,
    /// Not probed (path-derived category was enough)
    Unprobed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub content: ContentKind,
    pub oversized: bool,
}

/// A distinct blob recovered from one repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRecord {
    pub hash: ObjectHash,
    pub size: u64,
    pub reachable: bool,
    /// Reachable blob that is absent from every ref tip tree
    pub deleted_at_tips: bool,
    pub classification: Classification,
    pub provenance: Vec<Provenance>,
}

impl BlobRecord {
    /// Best path hint for backends and rule filters
    pub fn path_hint(&self) -> Option<&str> {
        self.provenance.first().map(|p| p.path.as_str())
    }

    pub fn first_commit(&self) -> Option<ObjectHash> {
        self.provenance.iter().find_map(|p| p.commit)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.provenance.iter().map(|p| p.path.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }
}
