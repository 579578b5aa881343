//! Repository identifier feed for the crawl lane

use std::io::BufRead;
use tracing::{info, warn};

use crate::model::{Lane, ParseRepoIdError, RepoId, RepoJob};
use crate::queue::{BrokerError, SqliteBroker};

/// Parse one feed line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<Result<RepoId, ParseRepoIdError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.parse())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReport {
    pub queued: usize,
    /// Already waiting in the crawl lane
    pub duplicates: usize,
    pub invalid: usize,
}

/// Queue every identifier read from `input`, in order
pub async fn submit<R: BufRead>(broker: &SqliteBroker, input: R) -> Result<SubmitReport, BrokerError> {
    let mut report = SubmitReport::default();
    for (number, line) in input.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(line = number + 1, error = %e, "unreadable feed line");
                report.invalid += 1;
                continue;
            }
        };
        let repo = match parse_line(&line) {
            None => continue,
            Some(Ok(repo)) => repo,
            Some(Err(e)) => {
                warn!(line = number + 1, error = %e, "skipping feed entry");
                report.invalid += 1;
                continue;
            }
        };

        let outcome = broker
            .enqueue(Lane::Crawl, &RepoJob { repo: repo.clone() }, &repo.to_string())
            .await?;
        if outcome.created {
            report.queued += 1;
        } else {
            report.duplicates += 1;
        }
    }
    info!(
        queued = report.queued,
        duplicates = report.duplicates,
        invalid = report.invalid,
        "feed submitted"
    );
    Ok(report)
}
