//! Ref enumeration and commit graph construction
//!
//! Refs are read with git2 (symbolic refs resolved, annotated tags peeled);
//! commits are decoded through the gix object database and stored in an
//! arena indexed by hash.

use gix::prelude::FindExt;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use tracing::debug;

use crate::model::{CommitNode, ObjectHash, ObjectKind, PartialFailure};

/// Objects named directly by refs, after peeling tags
#[derive(Debug, Default)]
pub struct RefRoots {
    pub refs: usize,
    pub commits: Vec<ObjectHash>,
    /// Tags pointing straight at trees or blobs
    pub trees: Vec<ObjectHash>,
    pub blobs: Vec<ObjectHash>,
    /// Annotated tag objects crossed while peeling
    pub tags: Vec<ObjectHash>,
    pub failures: Vec<PartialFailure>,
}

const MAX_TAG_CHAIN: usize = 16;

impl RefRoots {
    /// Collect every ref in the repository plus HEAD (which may be detached)
    pub fn collect(repo: &git2::Repository) -> Result<Self, git2::Error> {
        let mut roots = Self::default();
        let mut targets: Vec<git2::Oid> = Vec::new();

        for reference in repo.references()? {
            let reference = match reference {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable ref");
                    continue;
                }
            };
            let resolved = match reference.resolve() {
                Ok(r) => r,
                Err(e) => {
                    debug!(name = reference.name().unwrap_or("?"), error = %e, "dangling symbolic ref");
                    continue;
                }
            };
            if let Some(oid) = resolved.target() {
                roots.refs += 1;
                targets.push(oid);
            }
        }

        if let Some(oid) = repo.head().ok().and_then(|h| h.target()) {
            targets.push(oid);
        }

        targets.sort();
        targets.dedup();

        for oid in targets {
            roots.peel(repo, oid);
        }

        roots.commits.sort();
        roots.commits.dedup();
        roots.tags.sort();
        roots.tags.dedup();
        Ok(roots)
    }

    fn peel(&mut self, repo: &git2::Repository, start: git2::Oid) {
        let mut oid = start;
        for _ in 0..MAX_TAG_CHAIN {
            let object = match repo.find_object(oid, None) {
                Ok(o) => o,
                Err(e) => {
                    self.failures.push(PartialFailure {
                        object: ObjectHash::from(oid),
                        reason: format!("ref target unreadable: {}", e.message()),
                    });
                    return;
                }
            };
            match object.kind().and_then(ObjectKind::from_git2) {
                Some(ObjectKind::Tag) => {
                    self.tags.push(ObjectHash::from(oid));
                    match object.as_tag() {
                        Some(tag) => oid = tag.target_id(),
                        None => return,
                    }
                }
                Some(ObjectKind::Commit) => {
                    self.commits.push(ObjectHash::from(oid));
                    return;
                }
                Some(ObjectKind::Tree) => {
                    self.trees.push(ObjectHash::from(oid));
                    return;
                }
                Some(ObjectKind::Blob) => {
                    self.blobs.push(ObjectHash::from(oid));
                    return;
                }
                None => return,
            }
        }
    }
}

/// Arena of commits reachable from a set of roots
#[derive(Debug, Default)]
pub struct CommitGraph {
    nodes: Vec<CommitNode>,
    index: FxHashMap<ObjectHash, usize>,
    /// Commits referenced as a root or parent that could not be decoded
    pub unreadable: Vec<PartialFailure>,
}

impl CommitGraph {
    /// Iterative depth-first walk over parent pointers with a visited set
    pub fn walk<S: gix::prelude::Find>(odb: &S, roots: &[ObjectHash]) -> Self {
        Self::walk_filtered(odb, roots, |_| true)
    }

    /// Like [`walk`](Self::walk), but only follows parents accepted by `follow`
    pub fn walk_filtered<S, P>(odb: &S, roots: &[ObjectHash], follow: P) -> Self
    where
        S: gix::prelude::Find,
        P: Fn(&ObjectHash) -> bool,
    {
        let mut graph = Self::default();
        let mut visited: FxHashSet<ObjectHash> = FxHashSet::default();
        let mut stack: Vec<ObjectHash> = roots.iter().rev().copied().collect();
        let mut buf = Vec::with_capacity(1024);

        while let Some(hash) = stack.pop() {
            if !visited.insert(hash) {
                continue;
            }

            let oid = hash.to_object_id();
            let commit = match odb.find_commit(&oid, &mut buf) {
                Ok(c) => c,
                Err(e) => {
                    graph.unreadable.push(PartialFailure {
                        object: hash,
                        reason: format!("commit unreadable: {}", e),
                    });
                    continue;
                }
            };

            let tree = ObjectHash::from(commit.tree());
            let parents: Vec<ObjectHash> = commit.parents().map(ObjectHash::from).collect();
            let (author, timestamp) = match commit.author() {
                Ok(sig) => (sig.name.to_string(), sig.seconds()),
                Err(_) => (String::new(), 0),
            };

            for parent in parents.iter().rev() {
                if !visited.contains(parent) && follow(parent) {
                    stack.push(*parent);
                }
            }

            graph.index.insert(hash, graph.nodes.len());
            graph.nodes.push(CommitNode {
                hash,
                parents,
                tree,
                author,
                timestamp,
            });
        }

        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, hash: &ObjectHash) -> Option<&CommitNode> {
        self.index.get(hash).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, hash: &ObjectHash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn node(&self, idx: usize) -> &CommitNode {
        &self.nodes[idx]
    }

    /// Parents-first order derived from the graph alone (Kahn's algorithm).
    /// Commit timestamps are never consulted.
    pub fn topo_order(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut pending = vec![0usize; n];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, node) in self.nodes.iter().enumerate() {
            for parent in &node.parents {
                if let Some(&p) = self.index.get(parent) {
                    pending[i] += 1;
                    children[p].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut placed = vec![false; n];

        while let Some(i) = ready.pop_front() {
            order.push(i);
            placed[i] = true;
            for &child in &children[i] {
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.push_back(child);
                }
            }
        }

        // Only reachable with forged objects forming a cycle
        if order.len() < n {
            order.extend((0..n).filter(|&i| !placed[i]));
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ObjectHash {
        ObjectHash::from_bytes([n; 20])
    }

    fn graph_of(edges: &[(u8, &[u8])]) -> CommitGraph {
        let mut graph = CommitGraph::default();
        for (child, parents) in edges {
            graph.index.insert(hash(*child), graph.nodes.len());
            graph.nodes.push(CommitNode {
                hash: hash(*child),
                parents: parents.iter().map(|p| hash(*p)).collect(),
                tree: hash(0),
                author: String::new(),
                timestamp: 0,
            });
        }
        graph
    }

    #[test]
    fn test_topo_order_parents_first() {
        // discovery order is child-first, as a DFS from the tip produces
        let graph = graph_of(&[(4, &[2, 3]), (3, &[1]), (2, &[1]), (1, &[])]);
        let order: Vec<ObjectHash> = graph
            .topo_order()
            .into_iter()
            .map(|i| graph.node(i).hash)
            .collect();

        let pos = |h: u8| order.iter().position(|x| *x == hash(h)).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }

    #[test]
    fn test_topo_order_ignores_missing_parents() {
        let graph = graph_of(&[(2, &[9]), (3, &[2])]);
        let order = graph.topo_order();
        assert_eq!(graph.node(order[0]).hash, hash(2));
        assert_eq!(graph.node(order[1]).hash, hash(3));
    }
}
