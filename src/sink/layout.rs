use std::path::{Path, PathBuf};

use crate::model::{ObjectHash, RepoId};
use crate::util::path::sanitize_segment;

pub const CLONES_DIR: &str = "cloned_repos";
pub const RESTORED_DIR: &str = "restored_files";
pub const DANGLING_DIR: &str = "dangling_blobs";
pub const SUMMARY_FILE: &str = "summary.json";
pub const CONTENT_FILE: &str = "content";
pub const PROVENANCE_FILE: &str = "provenance.json";
pub const GAP_PREFIX: &str = "_unavailable-";

/// Directory scheme under the output root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, top: &str, repo: &RepoId) -> PathBuf {
        let [owner, name] = repo.path_segments();
        self.root.join(top).join(owner).join(name)
    }

    /// `cloned_repos/{owner}/{repo}.git`
    pub fn clone_dir(&self, repo: &RepoId) -> PathBuf {
        let [owner, name] = repo.path_segments();
        self.root
            .join(CLONES_DIR)
            .join(owner)
            .join(format!("{name}.git"))
    }

    /// `restored_files/...` for reachable blobs, `dangling_blobs/...` otherwise
    pub fn blob_dir(&self, repo: &RepoId, hash: &ObjectHash, reachable: bool) -> PathBuf {
        let top = if reachable { RESTORED_DIR } else { DANGLING_DIR };
        self.repo_dir(top, repo).join(hash.to_hex())
    }

    pub fn family_dir(&self, family: &str, repo: &RepoId) -> PathBuf {
        let top = format!("{}_findings", sanitize_segment(family));
        self.repo_dir(&top, repo)
    }

    pub fn findings_dir(&self, family: &str, repo: &RepoId, hash: &ObjectHash) -> PathBuf {
        self.family_dir(family, repo).join(hash.to_hex())
    }

    pub fn summary_path(&self, family: &str, repo: &RepoId) -> PathBuf {
        self.family_dir(family, repo).join(SUMMARY_FILE)
    }
}

pub fn rule_file(rule_id: &str) -> String {
    format!("{}.json", sanitize_segment(rule_id))
}

pub fn gap_file(backend: &str) -> String {
    format!("{GAP_PREFIX}{}.json", sanitize_segment(backend))
}
