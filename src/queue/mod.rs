//! Durable two-lane job queue
//!
//! Jobs are leased with a visibility timeout; a lease that is neither
//! acknowledged nor renewed in time returns the job to its lane and counts
//! as a failed delivery. Rate-limit delays and releases after a fatal
//! worker error hand the job back without consuming an attempt.

mod backoff;
mod sqlite;

pub use backoff::Backoff;
pub use sqlite::SqliteBroker;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{JobId, JobState, Lane};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("lease {0} is no longer held")]
    LeaseLost(LeaseId),
    #[error("malformed queue row: {0}")]
    InvalidRow(String),
}

impl From<BrokerError> for PipelineError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Payload(_) | BrokerError::InvalidRow(_) => {
                PipelineError::Permanent(err.to_string())
            }
            _ => PipelineError::TransientInfra(err.to_string()),
        }
    }
}

/// A job handed to exactly one worker until the lease expires
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: JobId,
    pub lane: Lane,
    pub lease_id: LeaseId,
    pub owner: String,
    pub dedupe_key: String,
    /// Failed deliveries recorded before this one
    pub attempts: u32,
    pub max_attempts: u32,
    pub expires_at: i64,
    payload: String,
}

impl LeasedJob {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// True when a retry after this delivery would exceed the budget
    pub fn is_last_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}

/// How a worker hands back a job it did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Consumes an attempt; retried after backoff or dead-lettered
    Retry { error: String },
    /// Rate limited: requeued at `until` (epoch ms), no attempt consumed
    Delay { until: i64, reason: String },
    /// Returned immediately without consuming an attempt
    Release { reason: String },
    DeadLetter { error: String },
}

/// Where a nacked job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackOutcome {
    pub state: JobState,
    pub attempts: u32,
    pub available_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: JobId,
    /// False when an active job with the same key already existed
    pub created: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub leased: u64,
    pub failed: u64,
    pub completed: u64,
    pub dead_letter: u64,
}

impl QueueStats {
    /// Jobs not yet in a terminal state
    pub fn active(&self) -> u64 {
        self.queued + self.leased + self.failed
    }
}

/// Snapshot of one stored job
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub lane: Lane,
    pub state: JobState,
    pub attempts: u32,
    pub available_at: i64,
    pub last_error: Option<String>,
}
