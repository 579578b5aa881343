//! Hosting service metadata lookups

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::CrawlError;
use crate::config::CrawlConfig;
use crate::model::RepoId;
use crate::ratelimit::RateBudget;

/// What the host reports about a repository before it is cloned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoMetadata {
    pub clone_url: String,
    /// Kilobytes, as reported by the host
    pub size_kb: u64,
    pub default_branch: Option<String>,
}

#[async_trait]
pub trait HostApi: Send + Sync {
    async fn repo_metadata(&self, repo: &RepoId) -> Result<RepoMetadata, CrawlError>;
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    clone_url: String,
    #[serde(default)]
    size: u64,
    default_branch: Option<String>,
}

pub struct GitHubApi {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    user_agent: String,
    budget: Arc<dyn RateBudget>,
}

impl GitHubApi {
    pub fn new(config: &CrawlConfig, budget: Arc<dyn RateBudget>) -> Result<Self, CrawlError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = config.https_proxy.as_deref().or(config.http_proxy.as_deref()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| CrawlError::Config(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CrawlError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            user_agent: config.user_agent.clone(),
            budget,
        })
    }

    async fn observe_quota(&self, headers: &HeaderMap) -> Result<Option<(u32, i64)>, CrawlError> {
        let Some(quota) = quota_from_headers(headers) else {
            return Ok(None);
        };
        self.budget.observe(quota.0, quota.1).await?;
        Ok(Some(quota))
    }
}

#[async_trait]
impl HostApi for GitHubApi {
    async fn repo_metadata(&self, repo: &RepoId) -> Result<RepoMetadata, CrawlError> {
        let url = format!("{}/repos/{}/{}", self.base, repo.owner, repo.name);
        let mut request = self
            .client
            .get(&url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| CrawlError::Network(e.to_string()))?;
        let status = response.status();
        let quota = self.observe_quota(response.headers()).await?;
        debug!(%repo, %status, ?quota, "repository metadata");

        match status {
            s if s.is_success() => {
                let body: RepoResponse = response
                    .json()
                    .await
                    .map_err(|e| CrawlError::Network(format!("unreadable metadata: {e}")))?;
                Ok(RepoMetadata {
                    clone_url: body.clone_url,
                    size_kb: body.size,
                    default_branch: body.default_branch,
                })
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                Err(denied(repo, status, quota, response.headers(), now))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
                Err(CrawlError::Unavailable(format!("{repo}: {status}")))
            }
            StatusCode::UNAUTHORIZED => Err(CrawlError::Auth(format!("{repo}: {status}"))),
            _ => Err(CrawlError::Network(format!("{repo}: {status}"))),
        }
    }
}

/// `X-RateLimit-Remaining` and `X-RateLimit-Reset` (epoch seconds) as
/// (remaining, reset epoch ms)
pub fn quota_from_headers(headers: &HeaderMap) -> Option<(u32, i64)> {
    let read = |name: &str| headers.get(name)?.to_str().ok()?.trim().parse::<i64>().ok();
    let remaining = read("x-ratelimit-remaining")?;
    let reset = read("x-ratelimit-reset")?;
    Some((remaining.clamp(0, i64::from(u32::MAX)) as u32, reset.saturating_mul(1000)))
}

/// Map a 403/429. An exhausted quota or a `Retry-After` (secondary
/// limits) defers the job; a bare 403 means the repository is off limits.
fn denied(repo: &RepoId, status: StatusCode, quota: Option<(u32, i64)>, headers: &HeaderMap, now_secs: i64) -> CrawlError {
    if let Some((0, reset_at)) = quota {
        return CrawlError::RateLimited { reset_at };
    }
    match retry_after(headers) {
        Some(secs) => CrawlError::RateLimited {
            reset_at: now_secs.saturating_add(secs).saturating_mul(1000),
        },
        None if status == StatusCode::TOO_MANY_REQUESTS => CrawlError::RateLimited {
            reset_at: now_secs.saturating_add(60).saturating_mul(1000),
        },
        None => CrawlError::Unavailable(format!("{repo}: access denied")),
    }
}

/// `Retry-After` in seconds; the HTTP-date form is not used by the host
fn retry_after(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
        .map(|secs| secs.max(0))
}
