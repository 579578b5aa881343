//! Crawl coordinator
//!
//! Turns a repository identifier into a local bare mirror and exactly one
//! analyze job. API calls draw from the shared [`RateBudget`]; git traffic
//! is retried in process before the queue's own retry budget is touched.

mod fetch;
mod host;

pub use fetch::{FetchOutcome, GitFetcher, MIRROR_REFSPEC, RepoFetcher};
pub use host::{GitHubApi, HostApi, RepoMetadata, quota_from_headers};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CrawlConfig;
use crate::error::{ErrorKind, PipelineError};
use crate::model::{AnalyzeJob, JobId, Lane, RepoId, RepoJob};
use crate::queue::{LeasedJob, SqliteBroker};
use crate::ratelimit::RateBudget;
use crate::sink::Layout;
use crate::util::retry::{RetryPolicy, retry_async};
use crate::worker::JobHandler;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("host quota exhausted until {reset_at}")]
    RateLimited { reset_at: i64 },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("fetch timed out after {0}s")]
    Timeout(u64),
    #[error("git error: {0}")]
    Git(String),
    #[error("cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid crawl configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CrawlError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        CrawlError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Worth another in-process attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Network(_) | CrawlError::Auth(_) | CrawlError::Timeout(_) | CrawlError::Git(_) => {
                true
            }
            CrawlError::Io { source, .. } => !crate::error::is_disk_exhausted(source),
            _ => false,
        }
    }
}

impl From<git2::Error> for CrawlError {
    fn from(err: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};
        let message = err.message().to_string();
        match (err.code(), err.class()) {
            (ErrorCode::Auth, _) | (_, ErrorClass::Ssh) => CrawlError::Auth(message),
            (_, ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl) => {
                if message.contains("404") || message.contains("not found") {
                    CrawlError::Unavailable(message)
                } else {
                    CrawlError::Network(message)
                }
            }
            _ => CrawlError::Git(message),
        }
    }
}

impl From<CrawlError> for PipelineError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::RateLimited { reset_at } => PipelineError::RateLimited { reset_at },
            CrawlError::Unavailable(msg) => PipelineError::Permanent(msg),
            CrawlError::Config(msg) => PipelineError::Fatal(msg),
            CrawlError::Io { action, ref path, ref source } => {
                PipelineError::from_io(&format!("cannot {action} {}", path.display()), source)
            }
            CrawlError::Pipeline(inner) => inner,
            other => PipelineError::TransientInfra(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Mirror ready and analyze job queued (or already queued by an
    /// earlier delivery when `created` is false)
    Enqueued { job: JobId, created: bool },
    /// Analysed within the processed-cache window
    SkippedRecent,
    SkippedTooLarge { size_kb: u64 },
}

pub struct CrawlCoordinator {
    broker: Arc<SqliteBroker>,
    host: Arc<dyn HostApi>,
    fetcher: Arc<dyn RepoFetcher>,
    budget: Arc<dyn RateBudget>,
    layout: Layout,
    config: CrawlConfig,
    retry: RetryPolicy,
}

impl CrawlCoordinator {
    pub fn new(
        broker: Arc<SqliteBroker>,
        host: Arc<dyn HostApi>,
        fetcher: Arc<dyn RepoFetcher>,
        budget: Arc<dyn RateBudget>,
        layout: Layout,
        config: CrawlConfig,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.clone_attempts.max(1),
            delay: Duration::from_secs(config.clone_retry_delay_secs),
            max_delay: Duration::from_secs(600),
        };
        Self {
            broker,
            host,
            fetcher,
            budget,
            layout,
            config,
            retry,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Acquire `repo` and queue its analysis. `last_delivery` marks the
    /// final queue attempt, after which a failed mirror is removed.
    pub async fn crawl(&self, repo: &RepoId, last_delivery: bool) -> Result<CrawlOutcome, PipelineError> {
        if self.config.processed_ttl_secs > 0
            && self
                .broker
                .recently_processed(repo, Duration::from_secs(self.config.processed_ttl_secs))
                .await?
        {
            info!(%repo, "analysed recently, skipping");
            return Ok(CrawlOutcome::SkippedRecent);
        }

        self.budget.acquire().await?;
        let metadata = self.host.repo_metadata(repo).await?;

        if let Some(limit) = self.config.max_repo_size_kb {
            if metadata.size_kb > limit {
                warn!(%repo, size_kb = metadata.size_kb, limit, "repository over size ceiling, skipping");
                return Ok(CrawlOutcome::SkippedTooLarge {
                    size_kb: metadata.size_kb,
                });
            }
        }

        let dest = self.layout.clone_dir(repo);
        let fetched = retry_async("fetch", &self.retry, CrawlError::is_retryable, |_| {
            let fetcher = self.fetcher.clone();
            let url = metadata.clone_url.clone();
            let dest = dest.clone();
            async move {
                match tokio::task::spawn_blocking(move || fetcher.fetch(&url, &dest)).await {
                    Ok(result) => result,
                    Err(e) => Err(CrawlError::Git(format!("fetch task failed: {e}"))),
                }
            }
        })
        .await;

        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = PipelineError::from(err);
                if matches!(err, PipelineError::Permanent(_))
                    || (last_delivery && !matches!(err.kind(), ErrorKind::Fatal | ErrorKind::RateLimited))
                {
                    remove_mirror(&dest).await;
                }
                return Err(err);
            }
        };

        let job = AnalyzeJob {
            repo: repo.clone(),
            store_path: dest,
        };
        let queued = self
            .broker
            .enqueue(Lane::Analyze, &job, &repo.to_string())
            .await?;
        info!(
            %repo,
            job_id = %queued.id,
            created = queued.created,
            objects = outcome.received_objects,
            "analysis queued"
        );
        Ok(CrawlOutcome::Enqueued {
            job: queued.id,
            created: queued.created,
        })
    }
}

#[async_trait]
impl JobHandler for CrawlCoordinator {
    fn lane(&self) -> Lane {
        Lane::Crawl
    }

    async fn handle(&self, job: &LeasedJob) -> Result<(), PipelineError> {
        let payload: RepoJob = job.payload()?;
        self.crawl(&payload.repo, job.is_last_attempt()).await.map(|_| ())
    }
}

pub(crate) async fn remove_mirror(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => info!(path = %path.display(), "mirror removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove mirror"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let limited: PipelineError = CrawlError::RateLimited { reset_at: 10 }.into();
        assert!(matches!(limited, PipelineError::RateLimited { reset_at: 10 }));

        let gone: PipelineError = CrawlError::Unavailable("octo/gone".into()).into();
        assert!(matches!(gone, PipelineError::Permanent(_)));

        let net: PipelineError = CrawlError::Network("reset".into()).into();
        assert!(matches!(net, PipelineError::TransientInfra(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(CrawlError::Timeout(5).is_retryable());
        assert!(!CrawlError::Unavailable("x".into()).is_retryable());
        assert!(!CrawlError::RateLimited { reset_at: 0 }.is_retryable());
    }
}
