//! Worker pool over the two queue lanes
//!
//! Each worker leases one job at a time, heartbeats the lease while the
//! handler runs and maps the outcome onto a queue [`Disposition`]. Only a
//! fatal error stops a worker; it then hands its job back and waits for
//! [`WorkerPool::resume`].

mod pool;

pub use pool::{PoolOptions, WorkerPool, WorkerState, WorkerStatus};

use async_trait::async_trait;

use crate::error::{ErrorKind, PipelineError};
use crate::model::Lane;
use crate::queue::{Disposition, LeasedJob};

/// Processes jobs from one lane
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn lane(&self) -> Lane;

    async fn handle(&self, job: &LeasedJob) -> Result<(), PipelineError>;
}

/// Queue disposition for a failed delivery
pub fn disposition_for(err: &PipelineError, now_ms: i64) -> Disposition {
    match err {
        PipelineError::RateLimited { reset_at } => Disposition::Delay {
            until: (*reset_at).max(now_ms),
            reason: err.to_string(),
        },
        _ => match err.kind() {
            ErrorKind::Fatal => Disposition::Release {
                reason: err.to_string(),
            },
            ErrorKind::Permanent => Disposition::DeadLetter {
                error: err.to_string(),
            },
            _ => Disposition::Retry {
                error: err.to_string(),
            },
        },
    }
}
