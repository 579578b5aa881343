//! Tree diffing over the object database
//!
//! Each commit's tree is compared with its parent's tree using an explicit
//! stack of directory frames. A tree is descended at most once per harvest:
//! once a tree hash has been seen, everything below it has already been
//! reported, so identical subtrees and repeated snapshots cost nothing.

use gix::prelude::{Find, FindExt};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::model::{Change, ObjectHash, ObjectKind, TreeEntry};

/// Buffer pool for reusing decode buffers across frames
#[derive(Default)]
pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn take(&mut self) -> Vec<u8> {
        self.buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(8 * 1024))
    }

    pub fn give(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        self.buffers.push(buf);
    }
}

/// Git file modes as they appear in tree entries
pub mod mode {
    pub const TREE: u32 = 0o040000;
    pub const BLOB: u32 = 0o100644;
    pub const EXECUTABLE: u32 = 0o100755;
    pub const SYMLINK: u32 = 0o120000;
    pub const SUBMODULE: u32 = 0o160000;
}

#[derive(Debug)]
pub enum DiffEvent<'p> {
    /// A blob present in the new tree that differs from (or is absent in) the old one
    Blob {
        oid: ObjectHash,
        path: &'p [u8],
        change: Change,
    },
    /// A blob present in the old tree whose path no longer exists
    Deleted { oid: ObjectHash, path: &'p [u8] },
    Unreadable { object: ObjectHash, reason: String },
}

struct Frame {
    old: Option<ObjectHash>,
    new: ObjectHash,
    path: Vec<u8>,
}

pub struct TreeDiffer<'a, S: Find> {
    odb: &'a S,
    pool: BufferPool,
    seen_trees: FxHashSet<ObjectHash>,
    stack: Vec<Frame>,
}

impl<'a, S: Find> TreeDiffer<'a, S> {
    pub fn new(odb: &'a S) -> Self {
        Self {
            odb,
            pool: BufferPool::default(),
            seen_trees: FxHashSet::default(),
            stack: Vec::new(),
        }
    }

    /// Trees descended so far (reachable trees during the ref phase)
    pub fn seen_trees(&self) -> &FxHashSet<ObjectHash> {
        &self.seen_trees
    }

    pub fn trees_visited(&self) -> usize {
        self.seen_trees.len()
    }

    /// Diff `old` against `new`, reporting changes under `prefix`.
    /// A root commit passes `old = None` (the empty tree).
    pub fn diff<F>(&mut self, old: Option<ObjectHash>, new: ObjectHash, prefix: &[u8], mut visit: F)
    where
        F: FnMut(DiffEvent<'_>),
    {
        self.stack.push(Frame {
            old,
            new,
            path: prefix.to_vec(),
        });

        while let Some(frame) = self.stack.pop() {
            if frame.old == Some(frame.new) || !self.seen_trees.insert(frame.new) {
                continue;
            }

            let new_entries = match self.read_entries(frame.new) {
                Ok(entries) => entries,
                Err(reason) => {
                    visit(DiffEvent::Unreadable {
                        object: frame.new,
                        reason,
                    });
                    continue;
                }
            };
            // An unreadable old side degrades to "everything added"
            let old_entries = match frame.old {
                Some(old) => self.read_entries(old).unwrap_or_default(),
                None => Vec::new(),
            };
            let old_by_name: FxHashMap<&[u8], &TreeEntry> = old_entries
                .iter()
                .map(|e| (e.name.as_slice(), e))
                .collect();

            let mut path = frame.path;
            let base_len = path.len();

            for entry in &new_entries {
                push_component(&mut path, base_len, &entry.name);
                let previous = old_by_name.get(entry.name.as_slice()).copied();

                match entry.kind {
                    ObjectKind::Tree => {
                        let old_subtree = previous
                            .filter(|p| p.kind == ObjectKind::Tree)
                            .map(|p| p.target);
                        self.stack.push(Frame {
                            old: old_subtree,
                            new: entry.target,
                            path: path.clone(),
                        });
                    }
                    ObjectKind::Blob => match previous {
                        Some(p) if p.kind == ObjectKind::Blob && p.target == entry.target => {}
                        Some(p) if p.kind == ObjectKind::Blob => visit(DiffEvent::Blob {
                            oid: entry.target,
                            path: &path,
                            change: Change::Modified,
                        }),
                        _ => visit(DiffEvent::Blob {
                            oid: entry.target,
                            path: &path,
                            change: Change::Added,
                        }),
                    },
                    // gitlinks point into other repositories
                    _ => {}
                }
            }

            if !old_entries.is_empty() {
                let new_names: FxHashSet<&[u8]> =
                    new_entries.iter().map(|e| e.name.as_slice()).collect();
                for old in &old_entries {
                    if old.kind == ObjectKind::Blob && !new_names.contains(old.name.as_slice()) {
                        push_component(&mut path, base_len, &old.name);
                        visit(DiffEvent::Deleted {
                            oid: old.target,
                            path: &path,
                        });
                    }
                }
            }
        }
    }

    /// Collect every blob under `root` into `out`, independently of the
    /// diff's seen set. Used for the ref tip snapshot.
    pub fn collect_blobs(
        &mut self,
        root: ObjectHash,
        visited: &mut FxHashSet<ObjectHash>,
        out: &mut FxHashSet<ObjectHash>,
    ) {
        let mut pending = vec![root];
        while let Some(tree) = pending.pop() {
            if !visited.insert(tree) {
                continue;
            }
            let Ok(entries) = self.read_entries(tree) else {
                continue;
            };
            for entry in entries {
                match entry.kind {
                    ObjectKind::Tree => pending.push(entry.target),
                    ObjectKind::Blob => {
                        out.insert(entry.target);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Decode a tree into owned entries
    pub fn read_entries(&mut self, tree: ObjectHash) -> Result<Vec<TreeEntry>, String> {
        let mut buf = self.pool.take();
        let oid = tree.to_object_id();
        let result = match self.odb.find_tree(&oid, &mut buf) {
            Ok(decoded) => Ok(decoded
                .entries
                .iter()
                .map(|entry| {
                    let (mode, kind) = if entry.mode.is_tree() {
                        (mode::TREE, ObjectKind::Tree)
                    } else if entry.mode.is_commit() {
                        (mode::SUBMODULE, ObjectKind::Commit)
                    } else if entry.mode.is_link() {
                        (mode::SYMLINK, ObjectKind::Blob)
                    } else if entry.mode.is_executable() {
                        (mode::EXECUTABLE, ObjectKind::Blob)
                    } else {
                        (mode::BLOB, ObjectKind::Blob)
                    };
                    TreeEntry {
                        mode,
                        name: entry.filename.to_vec(),
                        target: ObjectHash::from(entry.oid.to_owned()),
                        kind,
                    }
                })
                .collect()),
            Err(e) => Err(format!("tree unreadable: {}", e)),
        };
        self.pool.give(buf);
        result
    }
}

fn push_component(path: &mut Vec<u8>, base_len: usize, name: &[u8]) {
    path.truncate(base_len);
    if base_len > 0 {
        path.push(b'/');
    }
    path.extend_from_slice(name);
}
