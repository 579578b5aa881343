//! Filesystem sink
//!
//! Every file is written to a temporary sibling and renamed into place, so
//! readers never observe a partial file and a crash mid-write leaves the
//! previous version intact.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::layout::{self, CONTENT_FILE, GAP_PREFIX, Layout, PROVENANCE_FILE, SUMMARY_FILE};
use super::{BlobResults, FamilySummary, ResultSink, SinkError, StoredTally};
use crate::model::{CoverageGap, RepoId, ScanFinding};

pub struct FsSink {
    layout: Layout,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(root),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> SinkError {
    let path = path.to_path_buf();
    move |source| SinkError::Io {
        action,
        path,
        source,
    }
}

fn ensure_dir(dir: &Path) -> Result<(), SinkError> {
    std::fs::create_dir_all(dir).map_err(io_err("create", dir))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err("create temp file in", dir))?;
    tmp.write_all(bytes).map_err(io_err("write", tmp.path()))?;
    tmp.flush().map_err(io_err("flush", path))?;
    tmp.persist(path).map_err(|e| SinkError::Io {
        action: "rename into",
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SinkError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

fn remove_if_exists(path: &Path) -> Result<bool, SinkError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err("remove", path)(e)),
    }
}

fn by_rule<'a>(findings: impl Iterator<Item = &'a ScanFinding>) -> BTreeMap<&'a str, Vec<&'a ScanFinding>> {
    let mut grouped: BTreeMap<&str, Vec<&ScanFinding>> = BTreeMap::new();
    for finding in findings {
        grouped.entry(finding.rule_id.as_str()).or_default().push(finding);
    }
    for list in grouped.values_mut() {
        list.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.backend.cmp(&b.backend)));
    }
    grouped
}

impl ResultSink for FsSink {
    fn persist(&self, results: &BlobResults<'_>) -> Result<(), SinkError> {
        let hash = &results.record.hash;

        for (family, findings) in results.findings {
            if findings.is_empty() {
                continue;
            }
            let dir = self.layout.findings_dir(family, results.repo, hash);
            ensure_dir(&dir)?;
            for (rule, list) in by_rule(findings.iter()) {
                write_json(&dir.join(layout::rule_file(rule)), &list)?;
            }
        }

        for family_gap in results.gaps {
            let dir = self.layout.findings_dir(&family_gap.family, results.repo, hash);
            ensure_dir(&dir)?;
            write_json(&dir.join(layout::gap_file(&family_gap.gap.backend)), &family_gap.gap)?;
        }

        for (family, backend) in results.completed {
            let marker = self
                .layout
                .findings_dir(family, results.repo, hash)
                .join(layout::gap_file(backend));
            if remove_if_exists(&marker)? {
                debug!(repo = %results.repo, %hash, backend = %backend, "cleared stale gap marker");
            }
        }

        if !results.has_findings() {
            return Ok(());
        }

        let dir = self.layout.blob_dir(results.repo, hash, results.record.reachable);
        ensure_dir(&dir)?;
        if let Some(content) = results.content {
            write_atomic(&dir.join(CONTENT_FILE), content)?;
        }
        write_json(&dir.join(PROVENANCE_FILE), results.record)?;
        for (rule, list) in by_rule(results.findings.values().flatten()) {
            write_json(&dir.join(layout::rule_file(rule)), &list)?;
        }
        Ok(())
    }

    fn tally(&self, repo: &RepoId, family: &str) -> Result<StoredTally, SinkError> {
        let mut tally = StoredTally::default();
        let family_dir = self.layout.family_dir(family, repo);
        let entries = match std::fs::read_dir(&family_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tally),
            Err(e) => return Err(io_err("list", &family_dir)(e)),
        };

        let mut blob_dirs: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("list", &family_dir))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                blob_dirs.push(entry.path());
            }
        }
        blob_dirs.sort();

        for dir in blob_dirs {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
                .map_err(io_err("list", &dir))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();

            let mut has_findings = false;
            for file in files {
                let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                if name == SUMMARY_FILE {
                    continue;
                }
                let bytes = std::fs::read(&file).map_err(io_err("read", &file))?;
                if name.starts_with(GAP_PREFIX) {
                    let gap: CoverageGap = serde_json::from_slice(&bytes).map_err(|source| SinkError::Decode {
                        path: file.clone(),
                        source,
                    })?;
                    tally.gaps.push(gap);
                } else {
                    let findings: Vec<ScanFinding> =
                        serde_json::from_slice(&bytes).map_err(|source| SinkError::Decode {
                            path: file.clone(),
                            source,
                        })?;
                    for finding in &findings {
                        *tally.findings_by_rule.entry(finding.rule_id.clone()).or_default() += 1;
                    }
                    has_findings |= !findings.is_empty();
                }
            }
            if has_findings {
                tally.blobs_with_findings += 1;
            }
        }

        tally.gaps.sort();
        Ok(tally)
    }

    fn write_summary(&self, repo: &RepoId, summary: &FamilySummary) -> Result<(), SinkError> {
        let path = self.layout.summary_path(&summary.family, repo);
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        write_json(&path, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BlobRecord, Category, Change, Classification, ContentKind, ObjectHash, Provenance,
    };
    use crate::sink::FamilyGap;
    use tempfile::TempDir;

    fn record(reachable: bool) -> BlobRecord {
        BlobRecord {
            hash: ObjectHash::from_bytes([0x11; 20]),
            size: 17,
            reachable,
            deleted_at_tips: false,
            classification: Classification {
                category: Category::EnvFile,
                content: ContentKind::Unprobed,
                oversized: false,
            },
            provenance: vec![Provenance {
                path: ".env".to_string(),
                commit: None,
                change: Change::Added,
                present: true,
            }],
        }
    }

    fn finding(rule: &str, offset: u64) -> ScanFinding {
        ScanFinding {
            blob: ObjectHash::from_bytes([0x11; 20]),
            rule_id: rule.to_string(),
            offset,
            snippet: "SECR***23".to_string(),
            confidence: 0.5,
            repo: RepoId::new("octo", "demo"),
            backend: "custom-rules".to_string(),
            paths: vec![".env".to_string()],
        }
    }

    fn tree_listing(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                    out.push((rel, std::fs::read(&path).unwrap()));
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_persist_layout_and_idempotence() {
        let tmp = TempDir::new().unwrap();
        let sink = FsSink::new(tmp.path());
        let repo = RepoId::new("octo", "demo");
        let record = record(true);
        let mut findings = BTreeMap::new();
        findings.insert(
            "custom_regex".to_string(),
            vec![finding("secret-assignment", 0)],
        );
        let results = BlobResults {
            repo: &repo,
            record: &record,
            content: Some(b"SECRET_KEY=abc123".as_slice()),
            findings: &findings,
            gaps: &[],
            completed: &[("custom_regex".to_string(), "custom-rules".to_string())],
        };

        sink.persist(&results).unwrap();
        let first = tree_listing(tmp.path());
        sink.persist(&results).unwrap();
        assert_eq!(first, tree_listing(tmp.path()));

        let hex = record.hash.to_hex();
        let names: Vec<&str> = first.iter().map(|(p, _)| p.as_str()).collect();
        assert!(names.contains(&format!("custom_regex_findings/octo/demo/{hex}/secret-assignment.json").as_str()));
        assert!(names.contains(&format!("restored_files/octo/demo/{hex}/content").as_str()));
        assert!(names.contains(&format!("restored_files/octo/demo/{hex}/provenance.json").as_str()));
    }

    #[test]
    fn test_no_content_without_findings() {
        let tmp = TempDir::new().unwrap();
        let sink = FsSink::new(tmp.path());
        let repo = RepoId::new("octo", "demo");
        let record = record(false);
        let results = BlobResults {
            repo: &repo,
            record: &record,
            content: Some(b"nothing here".as_slice()),
            findings: &BTreeMap::new(),
            gaps: &[],
            completed: &[],
        };
        sink.persist(&results).unwrap();
        assert!(tree_listing(tmp.path()).is_empty());
    }

    #[test]
    fn test_gap_marker_cleared_on_success() {
        let tmp = TempDir::new().unwrap();
        let sink = FsSink::new(tmp.path());
        let repo = RepoId::new("octo", "demo");
        let record = record(true);
        let gap = FamilyGap {
            family: "trufflehog".to_string(),
            gap: CoverageGap {
                blob: record.hash,
                backend: "trufflehog".to_string(),
                reason: "backend timed out after 1800s".to_string(),
            },
        };
        let empty = BTreeMap::new();

        sink.persist(&BlobResults {
            repo: &repo,
            record: &record,
            content: None,
            findings: &empty,
            gaps: std::slice::from_ref(&gap),
            completed: &[],
        })
        .unwrap();
        let tally = sink.tally(&repo, "trufflehog").unwrap();
        assert_eq!(tally.gaps, vec![gap.gap.clone()]);

        sink.persist(&BlobResults {
            repo: &repo,
            record: &record,
            content: None,
            findings: &empty,
            gaps: &[],
            completed: &[("trufflehog".to_string(), "trufflehog".to_string())],
        })
        .unwrap();
        assert!(sink.tally(&repo, "trufflehog").unwrap().gaps.is_empty());
    }

    #[test]
    fn test_tally_counts_rules() {
        let tmp = TempDir::new().unwrap();
        let sink = FsSink::new(tmp.path());
        let repo = RepoId::new("octo", "demo");
        let record = record(true);
        let mut findings = BTreeMap::new();
        findings.insert(
            "custom_regex".to_string(),
            vec![finding("jwt", 4), finding("secret-assignment", 0), finding("jwt", 40)],
        );
        sink.persist(&BlobResults {
            repo: &repo,
            record: &record,
            content: None,
            findings: &findings,
            gaps: &[],
            completed: &[],
        })
        .unwrap();

        let tally = sink.tally(&repo, "custom_regex").unwrap();
        assert_eq!(tally.blobs_with_findings, 1);
        assert_eq!(tally.findings_by_rule.get("jwt"), Some(&2));
        assert_eq!(tally.findings_by_rule.get("secret-assignment"), Some(&1));
        assert_eq!(sink.tally(&repo, "other").unwrap(), StoredTally::default());
    }
}
