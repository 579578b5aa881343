// Shared benchmark helpers
// Functions here are used across different benchmark files
#![allow(dead_code)]

use git2::{Repository, Signature};
use std::path::PathBuf;
use tempfile::TempDir;

/// Create a temporary git repository for benchmarks
pub fn create_bench_repo() -> (TempDir, PathBuf, Repository) {
    let dir = TempDir::new().unwrap();
    let repo_path = dir.path().to_path_buf();
    let repo = Repository::init(&repo_path).unwrap();

    // Configure git user for commits
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "Bench User").unwrap();
    config.set_str("user.email", "bench@example.com").unwrap();

    (dir, repo_path, repo)
}

/// Add files and create a commit
pub fn add_commit(repo: &Repository, files: &[(&str, &[u8])], message: &str) -> git2::Oid {
    let sig = Signature::now("Bench User", "bench@example.com").unwrap();
    let mut index = repo.index().unwrap();

    for (path, content) in files {
        let full_path = repo.workdir().unwrap().join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full_path, content).unwrap();
        index.add_path(std::path::Path::new(path)).unwrap();
    }

    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

    if let Some(parent) = parent {
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent]).unwrap()
    } else {
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[]).unwrap()
    }
}

/// Build a history of `commits` commits over `files` files. Every tenth
/// commit plants a credential that the next commit removes again, and the
/// last few commits are cut off the branch so they end up dangling.
pub fn generate_history(files: usize, commits: usize) -> (TempDir, PathBuf) {
    let (dir, repo_path, repo) = create_bench_repo();

    let initial: Vec<(String, Vec<u8>)> = (0..files)
        .map(|i| {
            let path = format!("src/dir_{}/file_{}.py", i % 20, i);
            let content = format!("# File {}\ndef func_{}():\n    return {}\n", i, i, i);
            (path, content.into_bytes())
        })
        .collect();
    let refs: Vec<_> = initial.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect();
    let mut keep = add_commit(&repo, &refs, "Initial commit");

    for commit_num in 1..commits {
        let mut changed: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| {
                let idx = (commit_num * 5 + i) % files;
                let path = format!("src/dir_{}/file_{}.py", idx % 20, idx);
                let content = format!("# File {} v{}\ndef func_{}():\n    return {}\n", idx, commit_num, idx, commit_num);
                (path, content.into_bytes())
            })
            .collect();
        if commit_num % 10 == 0 {
            changed.push((
                format!("config/secrets_{}.env", commit_num),
                format!("API_KEY=sk_live_{:024}\n", commit_num).into_bytes(),
            ));
        }
        let refs: Vec<_> = changed.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect();
        let oid = add_commit(&repo, &refs, &format!("Commit {}", commit_num));
        if commit_num + 3 < commits {
            keep = oid;
        }
    }

    let branch = repo.head().unwrap().name().unwrap().to_string();
    repo.reference(&branch, keep, true, "drop tail").unwrap();
    (dir, repo_path)
}
