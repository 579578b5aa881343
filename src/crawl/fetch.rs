//! Mirror acquisition over the git protocol

use git2::{AutotagOption, Cred, FetchOptions, FetchPrune, ProxyOptions, RemoteCallbacks, Repository};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::CrawlError;
use crate::config::CrawlConfig;

/// Every ref the host exposes: branches, tags, notes, pull request heads
pub const MIRROR_REFSPEC: &str = "+refs/*:refs/*";
const REMOTE: &str = "origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// False when an existing store was updated in place
    pub fresh: bool,
    pub received_objects: usize,
    pub received_bytes: usize,
}

/// Blocking; callers run it on the blocking pool
pub trait RepoFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome, CrawlError>;
}

pub struct GitFetcher {
    token: Option<String>,
    proxy: Option<String>,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(config: &CrawlConfig) -> Self {
        Self {
            token: config.token.clone(),
            proxy: config.git_proxy().map(str::to_string),
            timeout: Duration::from_secs(config.clone_timeout_secs.max(1)),
        }
    }

    fn open_or_init(dest: &Path) -> Result<(Repository, bool), CrawlError> {
        if dest.join("HEAD").is_file() {
            if let Ok(repo) = Repository::open_bare(dest) {
                return Ok((repo, false));
            }
            // leftover from an interrupted first attempt
            std::fs::remove_dir_all(dest).map_err(|e| CrawlError::io("remove broken mirror", dest, e))?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlError::io("create clone root", parent, e))?;
        }
        let repo = Repository::init_bare(dest).map_err(CrawlError::from)?;
        Ok((repo, true))
    }
}

impl RepoFetcher for GitFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome, CrawlError> {
        let (repo, fresh) = Self::open_or_init(dest)?;
        let mut remote = match repo.find_remote(REMOTE) {
            Ok(_) => {
                repo.remote_set_url(REMOTE, url)?;
                repo.find_remote(REMOTE)?
            }
            Err(_) => repo.remote_with_fetch(REMOTE, url, MIRROR_REFSPEC)?,
        };

        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = self.token.clone() {
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("x-access-token", &token)
            });
        }
        let deadline = Instant::now() + self.timeout;
        callbacks.transfer_progress(move |_| Instant::now() < deadline);

        let mut proxy = ProxyOptions::new();
        if let Some(url) = &self.proxy {
            proxy.url(url);
        }

        let mut options = FetchOptions::new();
        options
            .remote_callbacks(callbacks)
            .proxy_options(proxy)
            .download_tags(AutotagOption::All)
            .prune(FetchPrune::On);

        debug!(url, dest = %dest.display(), fresh, "fetching mirror");
        if let Err(err) = remote.fetch(&[MIRROR_REFSPEC], Some(&mut options), None) {
            if Instant::now() >= deadline {
                return Err(CrawlError::Timeout(self.timeout.as_secs()));
            }
            return Err(err.into());
        }

        if let Ok(head) = remote.default_branch() {
            if let Some(name) = head.as_str() {
                point_head(&repo, name);
            }
        }

        let stats = remote.stats();
        let outcome = FetchOutcome {
            fresh,
            received_objects: stats.received_objects(),
            received_bytes: stats.received_bytes(),
        };
        info!(
            url,
            fresh,
            objects = outcome.received_objects,
            bytes = outcome.received_bytes,
            "mirror fetched"
        );
        Ok(outcome)
    }
}

/// Follow the upstream default branch; a mirror with a stale HEAD is
/// still complete, so failure is only logged
fn point_head(repo: &Repository, name: &str) -> bool {
    match repo.set_head(name) {
        Ok(()) => true,
        Err(e) => {
            warn!(head = name, error = %e, "cannot point mirror HEAD at upstream default branch");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn upstream(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let blob = repo.blob(b"hello\n").unwrap();
        let mut tb = repo.treebuilder(None).unwrap();
        tb.insert("hello.txt", blob, 0o100644).unwrap();
        let tree = repo.find_tree(tb.write().unwrap()).unwrap();
        let commit = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        repo.reference("refs/heads/feature", commit, true, "branch").unwrap();
        repo.tag_lightweight("v1", &repo.find_object(commit, None).unwrap(), false)
            .unwrap();
        drop(tree);
        drop(tb);
        repo
    }

    #[test]
    fn test_mirror_copies_all_refs() {
        let src = TempDir::new().unwrap();
        upstream(src.path());
        let out = TempDir::new().unwrap();
        let dest = out.path().join("octo").join("hello.git");

        let fetcher = GitFetcher::new(&CrawlConfig::default());
        let url = src.path().to_str().unwrap();
        let first = fetcher.fetch(url, &dest).unwrap();
        assert!(first.fresh);

        let mirror = Repository::open_bare(&dest).unwrap();
        assert!(mirror.find_reference("refs/heads/main").is_ok());
        assert!(mirror.find_reference("refs/heads/feature").is_ok());
        assert!(mirror.find_reference("refs/tags/v1").is_ok());

        let again = fetcher.fetch(url, &dest).unwrap();
        assert!(!again.fresh);
    }

    #[test]
    fn test_bad_default_branch_leaves_head() {
        let src = TempDir::new().unwrap();
        upstream(src.path());
        let out = TempDir::new().unwrap();
        let dest = out.path().join("hello.git");
        GitFetcher::new(&CrawlConfig::default())
            .fetch(src.path().to_str().unwrap(), &dest)
            .unwrap();

        let mirror = Repository::open_bare(&dest).unwrap();
        let before = mirror.find_reference("HEAD").unwrap().symbolic_target().map(str::to_string);
        assert!(!point_head(&mirror, "not a ref"));
        let after = mirror.find_reference("HEAD").unwrap().symbolic_target().map(str::to_string);
        assert_eq!(before, after);
        assert!(point_head(&mirror, "refs/heads/feature"));
    }
}
