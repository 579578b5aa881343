//! Git object graph types produced while walking a store

use serde::{Deserialize, Serialize};

use super::ObjectHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn from_git2(kind: git2::ObjectType) -> Option<Self> {
        match kind {
            git2::ObjectType::Commit => Some(ObjectKind::Commit),
            git2::ObjectType::Tree => Some(ObjectKind::Tree),
            git2::ObjectType::Blob => Some(ObjectKind::Blob),
            git2::ObjectType::Tag => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

/// A commit in the arena built by the graph walk
#[derive(Debug, Clone)]
pub struct CommitNode {
    pub hash: ObjectHash,
    /// Parent order as recorded in the commit
    pub parents: Vec<ObjectHash>,
    pub tree: ObjectHash,
    pub author: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: Vec<u8>,
    pub target: ObjectHash,
    pub kind: ObjectKind,
}
