//! Runtime configuration
//!
//! Loaded from a TOML file (every section optional) and then overridden by
//! environment variables for secrets and deployment-specific paths.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::Category;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output: OutputConfig,
    pub broker: BrokerConfig,
    pub workers: WorkerConfig,
    pub crawl: CrawlConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub harvest: HarvestConfig,
    pub routing: RoutingConfig,
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub root: PathBuf,
    /// Leave mirrors on disk after analysis
    pub keep_clones: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("analysis_output"),
            keep_clones: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// SQLite database file shared by every worker process
    pub path: PathBuf,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("secretdig-queue.db"),
            visibility_timeout_secs: 900,
            poll_interval_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub crawl: usize,
    pub analyze: usize,
    /// Crawl workers stop leasing while the analyze lane is this deep.
    /// Defaults to twice the analyze worker count.
    pub max_analyze_depth: Option<usize>,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            crawl: 2,
            analyze: 2,
            max_analyze_depth: None,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn analyze_depth_ceiling(&self) -> usize {
        self.max_analyze_depth
            .unwrap_or(self.analyze.max(1) * 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub api_base: String,
    pub user_agent: String,
    pub token: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub clone_timeout_secs: u64,
    pub clone_attempts: usize,
    pub clone_retry_delay_secs: u64,
    /// Skip repositories the host reports as larger than this
    pub max_repo_size_kb: Option<u64>,
    /// Skip repositories analysed within this window; 0 disables
    pub processed_ttl_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            user_agent: concat!("secretdig/", env!("CARGO_PKG_VERSION")).to_string(),
            token: None,
            http_proxy: None,
            https_proxy: None,
            clone_timeout_secs: 1800,
            clone_attempts: 3,
            clone_retry_delay_secs: 60,
            max_repo_size_kb: None,
            processed_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl CrawlConfig {
    /// Proxy for git traffic; HTTPS proxy wins when both are set
    pub fn git_proxy(&self) -> Option<&str> {
        self.https_proxy
            .as_deref()
            .or(self.http_proxy.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 5000,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delivery attempts before a job is dead-lettered
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 30_000,
            backoff_max_ms: 3_600_000,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OversizePolicy {
    /// Scan the first `max_scan_bytes` only
    #[default]
    Truncate,
    Skip,
}

/// What a redelivered analyze job does with work done by an earlier delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeMode {
    #[default]
    Restart,
    SkipScanned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub max_scan_bytes: u64,
    pub oversized: OversizePolicy,
    pub resume: ResumeMode,
    /// Bounded hand-off between the git walk and the dispatcher
    pub channel_capacity: usize,
    /// Provenance entries kept per blob
    pub max_provenance: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_scan_bytes: 1024 * 1024,
            oversized: OversizePolicy::Truncate,
            resume: ResumeMode::Restart,
            channel_capacity: 64,
            max_provenance: 32,
        }
    }
}

/// Category -> backend ids. Categories without an entry use `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default: Vec<String>,
    pub categories: BTreeMap<Category, Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let all = vec!["custom-rules".to_string(), "trufflehog".to_string()];
        let mut categories = BTreeMap::new();
        categories.insert(Category::CompiledArtifact, Vec::new());
        categories.insert(Category::BytecodeCache, Vec::new());
        categories.insert(Category::Media, Vec::new());
        Self {
            default: all,
            categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub custom_rules: CustomRulesConfig,
    pub external: Vec<ExternalToolConfig>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            custom_rules: CustomRulesConfig::default(),
            external: vec![ExternalToolConfig::trufflehog()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomRulesConfig {
    pub enabled: bool,
    pub include_builtin: bool,
    pub rules: Vec<RuleConfig>,
}

impl Default for CustomRulesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_builtin: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub pattern: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Only apply to paths with these extensions (without the dot)
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_confidence() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalToolConfig {
    pub id: String,
    /// Output family, i.e. the `{family}_findings/` directory
    pub family: String,
    pub enabled: bool,
    /// Argument vector; `{path}` is replaced by the temp file holding the blob
    pub command: Vec<String>,
    #[serde(default)]
    pub accepted_exit_codes: Vec<i32>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_tool_timeout() -> u64 {
    1800
}

impl ExternalToolConfig {
    pub fn trufflehog() -> Self {
        Self {
            id: "trufflehog".to_string(),
            family: "trufflehog".to_string(),
            enabled: false,
            command: vec![
                "trufflehog".to_string(),
                "filesystem".to_string(),
                "{path}".to_string(),
                "--json".to_string(),
                "--no-update".to_string(),
            ],
            accepted_exit_codes: vec![0, 1, 183],
            timeout_secs: default_tool_timeout(),
        }
    }
}

impl Settings {
    /// Default location: `$XDG_CONFIG_HOME/secretdig/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("secretdig").join("config.toml"))
    }

    /// Load from `path` (or the default location) and apply env overrides.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.crawl.token = Some(token);
        }
        if let Some(proxy) = lookup("GIT_HTTP_PROXY").filter(|p| !p.is_empty()) {
            self.crawl.http_proxy = Some(proxy);
        }
        if let Some(proxy) = lookup("GIT_HTTPS_PROXY").filter(|p| !p.is_empty()) {
            self.crawl.https_proxy = Some(proxy);
        }
        if let Some(root) = lookup("SECRETDIG_OUTPUT_DIR").filter(|p| !p.is_empty()) {
            self.output.root = PathBuf::from(root);
        }
        if let Some(db) = lookup("SECRETDIG_BROKER_URL").filter(|p| !p.is_empty()) {
            self.broker.path = PathBuf::from(db);
        }
        if let Some(depth) = lookup("SECRETDIG_MAX_ANALYZE_DEPTH").and_then(|d| d.parse().ok()) {
            self.workers.max_analyze_depth = Some(depth);
        }
    }
}
