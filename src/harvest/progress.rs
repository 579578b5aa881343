//! Progress reporting for the harvest phases
//!
//! Interactive scans draw indicatif bars; workers log phase boundaries.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub trait ProgressHandle: Send + Sync {
    fn inc(&self, n: u64);
    fn finish(&self);
}

pub trait ProgressReporter: Send + Sync {
    fn start(&self, label: &str, total: u64) -> Box<dyn ProgressHandle>;
}

/// Progress bars on stderr for the one-shot `scan` command. Phases stack
/// under each other and stay visible once done.
#[derive(Default)]
pub struct IndicatifProgress {
    bars: MultiProgress,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for IndicatifProgress {
    fn start(&self, label: &str, total: u64) -> Box<dyn ProgressHandle> {
        let template = if total == 0 {
            "{spinner:.green} {msg:<20} {pos} objects ({elapsed})"
        } else {
            "{spinner:.green} {msg:<20} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, eta {eta})"
        };
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let pb = self.bars.add(ProgressBar::new(total).with_style(style));
        pb.set_message(label.to_string());
        Box::new(IndicatifHandle(pb))
    }
}

struct IndicatifHandle(ProgressBar);

impl ProgressHandle for IndicatifHandle {
    fn inc(&self, n: u64) {
        self.0.inc(n);
    }

    fn finish(&self) {
        self.0.finish();
    }
}

pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn start(&self, _label: &str, _total: u64) -> Box<dyn ProgressHandle> {
        Box::new(NoopHandle)
    }
}

struct NoopHandle;

impl ProgressHandle for NoopHandle {
    fn inc(&self, _n: u64) {}
    fn finish(&self) {}
}

/// Logs each phase once when it finishes
pub struct LogProgress {
    pub repo: String,
}

impl ProgressReporter for LogProgress {
    fn start(&self, label: &str, total: u64) -> Box<dyn ProgressHandle> {
        Box::new(LogHandle {
            repo: self.repo.clone(),
            label: label.to_string(),
            total,
            done: AtomicU64::new(0),
        })
    }
}

struct LogHandle {
    repo: String,
    label: String,
    total: u64,
    done: AtomicU64,
}

impl ProgressHandle for LogHandle {
    fn inc(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }

    fn finish(&self) {
        info!(
            repo = %self.repo,
            phase = %self.label,
            done = self.done.load(Ordering::Relaxed),
            total = self.total,
            "harvest phase finished"
        );
    }
}
