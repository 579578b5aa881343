//! External detector invoked as a subprocess
//!
//! The blob is written to a temporary file, the configured command is run
//! against it and its stdout is read as JSON lines. Two line shapes are
//! understood: a plain [`BackendMatch`] object, and trufflehog's
//! `--json` records.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::backend::{BackendError, ScanMetadata, ScannerBackend};
use crate::config::ExternalToolConfig;
use crate::model::BackendMatch;
use crate::util::format::redact;
use crate::util::path::extension_of;

const VERIFIED_CONFIDENCE: f32 = 0.95;
const UNVERIFIED_CONFIDENCE: f32 = 0.6;
const STDERR_LIMIT: usize = 2048;

pub struct ExternalToolScanner {
    config: ExternalToolConfig,
}

impl ExternalToolScanner {
    pub fn new(config: ExternalToolConfig) -> Self {
        Self { config }
    }

    fn exit_accepted(&self, code: Option<i32>) -> bool {
        match code {
            Some(code) if self.config.accepted_exit_codes.is_empty() => code == 0,
            Some(code) => self.config.accepted_exit_codes.contains(&code),
            None => false,
        }
    }

    fn write_temp(&self, content: &[u8], metadata: &ScanMetadata) -> std::io::Result<tempfile::NamedTempFile> {
        // Keep the extension; some detectors key off it
        let suffix = metadata
            .path_hint
            .as_deref()
            .and_then(extension_of)
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("secretdig-")
            .suffix(&suffix)
            .tempfile()?;
        file.write_all(content)?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl ScannerBackend for ExternalToolScanner {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn family(&self) -> &str {
        &self.config.family
    }

    async fn scan(&self, content: &[u8], metadata: &ScanMetadata) -> Result<Vec<BackendMatch>, BackendError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| BackendError::Crashed("empty command".to_string()))?;

        let file = self.write_temp(content, metadata)?;
        let path = file.path().to_string_lossy().into_owned();
        let args: Vec<String> = args.iter().map(|a| a.replace("{path}", &path)).collect();

        debug!(backend = %self.config.id, blob = %metadata.hash, "running external detector");
        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(self.config.timeout_secs))??;
        drop(file);

        if !self.exit_accepted(output.status.code()) {
            let cut = output.stderr.len().min(STDERR_LIMIT);
            let stderr = String::from_utf8_lossy(&output.stderr[..cut]).into_owned();
            return Err(BackendError::ExitStatus {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut matches = parse_output(&stdout, content)?;
        matches.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.rule_id.cmp(&b.rule_id)));
        Ok(matches)
    }
}

/// Parse JSON-lines output. Non-JSON lines (banners, progress) are ignored;
/// a JSON line that fits neither shape is an error.
pub fn parse_output(stdout: &str, content: &[u8]) -> Result<Vec<BackendMatch>, BackendError> {
    let mut matches = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let value: Value = serde_json::from_str(line).map_err(|e| BackendError::Output(e.to_string()))?;
        if let Ok(m) = serde_json::from_value::<BackendMatch>(value.clone()) {
            matches.push(m);
        } else if let Some(m) = trufflehog_match(&value, content) {
            matches.push(m);
        } else if value.get("level").is_none() {
            // structured log lines carry a level; anything else is unexpected
            return Err(BackendError::Output(format!("unrecognised record: {line}")));
        }
    }
    Ok(matches)
}

fn trufflehog_match(value: &Value, content: &[u8]) -> Option<BackendMatch> {
    let detector = value.get("DetectorName")?.as_str()?;
    let raw = value.get("Raw").and_then(Value::as_str).unwrap_or_default();
    let verified = value.get("Verified").and_then(Value::as_bool).unwrap_or(false);
    let line = value
        .pointer("/SourceMetadata/Data/Filesystem/line")
        .and_then(Value::as_u64);

    let offset = find_bytes(content, raw.as_bytes())
        .or_else(|| line.map(|l| line_start(content, l)))
        .unwrap_or(0);

    Some(BackendMatch {
        rule_id: detector.to_ascii_lowercase(),
        offset: offset as u64,
        snippet: redact(raw),
        confidence: if verified {
            VERIFIED_CONFIDENCE
        } else {
            UNVERIFIED_CONFIDENCE
        },
    })
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Byte offset of 1-based `line`
fn line_start(content: &[u8], line: u64) -> usize {
    if line <= 1 {
        return 0;
    }
    content
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .nth((line - 2) as usize)
        .map(|(i, _)| i + 1)
        .unwrap_or(0)
}
