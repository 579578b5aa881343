//! SQLite-backed broker
//!
//! One database file is shared by every worker process. Besides the job
//! table it holds the processed-repository cache and the scan ledger used
//! when redelivered jobs skip work an earlier delivery completed.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Backoff, BrokerError, Disposition, EnqueueOutcome, JobRecord, LeaseId, LeasedJob, NackOutcome,
    QueueStats,
};
use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::dispatch::ScanLedger;
use crate::error::PipelineError;
use crate::model::{JobId, JobState, Lane, ObjectHash, RepoId};

const SCHEMA_VERSION: &str = "1";

pub struct SqliteBroker {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    max_attempts: u32,
}

fn parse_uuid(raw: &str) -> Result<Uuid, BrokerError> {
    Uuid::parse_str(raw).map_err(|e| BrokerError::InvalidRow(format!("bad id {raw:?}: {e}")))
}

struct LapsedLease {
    id: JobId,
    raw_id: String,
    lease_id: String,
    attempts: u32,
    max_attempts: u32,
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteBroker {
    /// Open (creating if needed) the broker database at `path`
    pub async fn open(path: &Path, retry: &RetryConfig, clock: Arc<dyn Clock>) -> Result<Self, BrokerError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| BrokerError::Database(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, retry, clock).await
    }

    /// Private database for tests and one-shot runs
    pub async fn in_memory(retry: &RetryConfig, clock: Arc<dyn Clock>) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, retry, clock).await
    }

    async fn with_pool(pool: Pool<Sqlite>, retry: &RetryConfig, clock: Arc<dyn Clock>) -> Result<Self, BrokerError> {
        let broker = Self {
            pool,
            clock,
            backoff: Backoff::new(retry),
            max_attempts: retry.max_attempts.max(1),
        };
        broker.init_schema().await?;
        Ok(broker)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn init_schema(&self) -> Result<(), BrokerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let stored: Option<String> = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("value"));
        if let Some(version) = stored.as_deref().filter(|v| *v != SCHEMA_VERSION) {
            return Err(BrokerError::InvalidRow(format!(
                "queue schema version {version} is not supported (expected {SCHEMA_VERSION})"
            )));
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                lane TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                lease_id TEXT,
                lease_owner TEXT,
                lease_expires_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // At most one active job per key and lane
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS jobs_active_key
             ON jobs (lane, dedupe_key)
             WHERE state IN ('queued', 'leased', 'failed')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_ready ON jobs (lane, state, available_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_lease ON jobs (lease_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS processed_repos (
                repo TEXT PRIMARY KEY,
                completed_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_ledger (
                repo TEXT NOT NULL,
                hash BLOB NOT NULL,
                backend TEXT NOT NULL,
                PRIMARY KEY (repo, hash, backend)
            )",
        )
        .execute(&self.pool)
        .await?;

        if stored.is_none() {
            sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Add a job unless an active job with the same key exists in the lane
    pub async fn enqueue<T: Serialize>(
        &self,
        lane: Lane,
        payload: &T,
        dedupe_key: &str,
    ) -> Result<EnqueueOutcome, BrokerError> {
        let body = serde_json::to_string(payload)?;

        // The existing job can reach a terminal state between the two
        // statements; a second insert then succeeds.
        for _ in 0..3 {
            let id = JobId::new();
            let now = self.now();
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO jobs
                    (id, lane, dedupe_key, payload, state, attempts, max_attempts,
                     available_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'queued', 0, ?, ?, ?, ?)",
            )
            .bind(id.0.to_string())
            .bind(lane.as_str())
            .bind(dedupe_key)
            .bind(&body)
            .bind(i64::from(self.max_attempts))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted > 0 {
                debug!(%lane, job_id = %id, key = dedupe_key, "enqueued job");
                return Ok(EnqueueOutcome { id, created: true });
            }

            let existing: Option<String> = sqlx::query(
                "SELECT id FROM jobs
                 WHERE lane = ? AND dedupe_key = ? AND state IN ('queued', 'leased', 'failed')",
            )
            .bind(lane.as_str())
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("id"));

            if let Some(raw) = existing {
                let id = JobId(parse_uuid(&raw)?);
                debug!(%lane, job_id = %id, key = dedupe_key, "job already active");
                return Ok(EnqueueOutcome { id, created: false });
            }
        }
        Err(BrokerError::InvalidRow(format!(
            "could not enqueue {dedupe_key:?}: key keeps changing state"
        )))
    }

    /// Return jobs whose lease lapsed to their lane. Expiry counts as a
    /// failed delivery, so a job that keeps timing out is dead-lettered.
    pub async fn resurrect_expired(&self) -> Result<u64, BrokerError> {
        let now = self.now();
        let mut resurrected = 0u64;
        for lapsed in self.lapsed_leases(now).await? {
            if self.expire_lease(&lapsed, now).await? {
                resurrected += 1;
            }
        }
        Ok(resurrected)
    }

    async fn lapsed_leases(&self, now: i64) -> Result<Vec<LapsedLease>, BrokerError> {
        let rows = sqlx::query(
            "SELECT id, lease_id, attempts, max_attempts FROM jobs
             WHERE state = 'leased' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.get("id");
                Ok(LapsedLease {
                    id: JobId(parse_uuid(&raw)?),
                    raw_id: raw,
                    lease_id: row.get("lease_id"),
                    attempts: row.get::<i64, _>("attempts").max(0) as u32 + 1,
                    max_attempts: row.get::<i64, _>("max_attempts").max(1) as u32,
                })
            })
            .collect()
    }

    /// Move one lapsed lease out of `leased`. Returns false when the holder
    /// renewed, acked or nacked it after it was selected.
    async fn expire_lease(&self, lapsed: &LapsedLease, now: i64) -> Result<bool, BrokerError> {
        let (id, attempts) = (lapsed.id, lapsed.attempts);
        let dead = attempts >= lapsed.max_attempts;
        let (state, available_at, error) = if dead {
            ("dead_letter", now, "lease expired (max attempts)")
        } else {
            ("failed", now + self.backoff.delay_ms(id, attempts) as i64, "lease expired")
        };

        let updated = sqlx::query(
            "UPDATE jobs
             SET state = ?, attempts = ?, available_at = ?,
                 lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ? AND state = 'leased' AND lease_id = ? AND lease_expires_at < ?",
        )
        .bind(state)
        .bind(i64::from(attempts))
        .bind(available_at)
        .bind(error)
        .bind(now)
        .bind(&lapsed.raw_id)
        .bind(&lapsed.lease_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            debug!(job_id = %id, "lease changed hands before expiry; left alone");
            return Ok(false);
        }
        if dead {
            warn!(job_id = %id, attempts, "lease expired; job dead-lettered");
            Ok(false)
        } else {
            warn!(job_id = %id, attempts, "lease expired; job returned to lane");
            Ok(true)
        }
    }

    /// Claim the oldest available job in `lane` for `visibility`
    pub async fn lease(
        &self,
        lane: Lane,
        owner: &str,
        visibility: Duration,
    ) -> Result<Option<LeasedJob>, BrokerError> {
        self.resurrect_expired().await?;

        let now = self.now();
        let lease_id = LeaseId::new();
        let expires_at = now.saturating_add(duration_ms(visibility));

        let row = sqlx::query(
            "UPDATE jobs
             SET state = 'leased', lease_id = ?, lease_owner = ?, lease_expires_at = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE lane = ? AND state IN ('queued', 'failed') AND available_at <= ?
                 ORDER BY available_at, created_at, id
                 LIMIT 1
             )
             RETURNING id, dedupe_key, payload, attempts, max_attempts",
        )
        .bind(lease_id.0.to_string())
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .bind(lane.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.get("id");
        let job = LeasedJob {
            id: JobId(parse_uuid(&raw)?),
            lane,
            lease_id,
            owner: owner.to_string(),
            dedupe_key: row.get("dedupe_key"),
            attempts: row.get::<i64, _>("attempts").max(0) as u32,
            max_attempts: row.get::<i64, _>("max_attempts").max(1) as u32,
            expires_at,
            payload: row.get("payload"),
        };
        debug!(%lane, job_id = %job.id, worker = owner, attempts = job.attempts, "leased job");
        Ok(Some(job))
    }

    /// Extend a live lease; returns the new expiry
    pub async fn renew(&self, lease_id: LeaseId, extend_by: Duration) -> Result<i64, BrokerError> {
        let now = self.now();
        let expires_at = now.saturating_add(duration_ms(extend_by));
        let updated = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ?
             WHERE lease_id = ? AND state = 'leased' AND lease_expires_at >= ?",
        )
        .bind(expires_at)
        .bind(now)
        .bind(lease_id.0.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BrokerError::LeaseLost(lease_id));
        }
        Ok(expires_at)
    }

    pub async fn ack(&self, lease_id: LeaseId) -> Result<(), BrokerError> {
        let updated = sqlx::query(
            "UPDATE jobs
             SET state = 'completed', lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL,
                 last_error = NULL, updated_at = ?
             WHERE lease_id = ? AND state = 'leased'",
        )
        .bind(self.now())
        .bind(lease_id.0.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(BrokerError::LeaseLost(lease_id));
        }
        Ok(())
    }

    pub async fn nack(&self, lease_id: LeaseId, disposition: Disposition) -> Result<NackOutcome, BrokerError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id, attempts, max_attempts FROM jobs WHERE lease_id = ? AND state = 'leased'")
            .bind(lease_id.0.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(BrokerError::LeaseLost(lease_id));
        };

        let raw: String = row.get("id");
        let id = JobId(parse_uuid(&raw)?);
        let attempts = row.get::<i64, _>("attempts").max(0) as u32;
        let max_attempts = row.get::<i64, _>("max_attempts").max(1) as u32;
        let now = self.now();

        let (state, attempts, available_at, error) = match disposition {
            Disposition::Retry { error } => {
                let next = attempts + 1;
                if next >= max_attempts {
                    (JobState::DeadLetter, next, now, error)
                } else {
                    let delay = self.backoff.delay_ms(id, next) as i64;
                    (JobState::Failed, next, now + delay, error)
                }
            }
            Disposition::Delay { until, reason } => (JobState::Queued, attempts, until.max(now), reason),
            Disposition::Release { reason } => (JobState::Queued, attempts, now, reason),
            Disposition::DeadLetter { error } => (JobState::DeadLetter, attempts, now, error),
        };

        sqlx::query(
            "UPDATE jobs
             SET state = ?, attempts = ?, available_at = ?, last_error = ?,
                 lease_id = NULL, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(i64::from(attempts))
        .bind(available_at)
        .bind(&error)
        .bind(now)
        .bind(&raw)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if state == JobState::DeadLetter {
            warn!(job_id = %id, attempts, %error, "job dead-lettered");
        } else {
            debug!(job_id = %id, state = state.as_str(), attempts, available_at, "job returned to lane");
        }
        Ok(NackOutcome {
            state,
            attempts,
            available_at,
        })
    }

    /// Queued, failed and leased jobs in a lane
    pub async fn depth(&self, lane: Lane) -> Result<u64, BrokerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE lane = ? AND state IN ('queued', 'leased', 'failed')",
        )
        .bind(lane.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn stats(&self, lane: Lane) -> Result<QueueStats, BrokerError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE lane = ? GROUP BY state")
            .bind(lane.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n = row.get::<i64, _>("n").max(0) as u64;
            match JobState::parse(&state) {
                Some(JobState::Queued) => stats.queued = n,
                Some(JobState::Leased) => stats.leased = n,
                Some(JobState::Failed) => stats.failed = n,
                Some(JobState::Completed) => stats.completed = n,
                Some(JobState::DeadLetter) => stats.dead_letter = n,
                None => return Err(BrokerError::InvalidRow(format!("unknown state {state:?}"))),
            }
        }
        Ok(stats)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, BrokerError> {
        let row = sqlx::query("SELECT id, lane, state, attempts, available_at, last_error FROM jobs WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Jobs in one state, oldest first
    pub async fn jobs_in_state(&self, lane: Lane, state: JobState) -> Result<Vec<JobRecord>, BrokerError> {
        let rows = sqlx::query(
            "SELECT id, lane, state, attempts, available_at, last_error FROM jobs
             WHERE lane = ? AND state = ? ORDER BY created_at, id",
        )
        .bind(lane.as_str())
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn mark_processed(&self, repo: &RepoId) -> Result<(), BrokerError> {
        sqlx::query("INSERT OR REPLACE INTO processed_repos (repo, completed_at) VALUES (?, ?)")
            .bind(repo.to_string())
            .bind(self.now())
            .execute(&self.pool)
            .await?;
        info!(%repo, "repository marked processed");
        Ok(())
    }

    /// True when `repo` completed analysis less than `ttl` ago; a zero TTL disables the cache
    pub async fn recently_processed(&self, repo: &RepoId, ttl: Duration) -> Result<bool, BrokerError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let completed_at: Option<i64> = sqlx::query_scalar("SELECT completed_at FROM processed_repos WHERE repo = ?")
            .bind(repo.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(completed_at.is_some_and(|at| at.saturating_add(duration_ms(ttl)) > self.now()))
    }

    /// Forget ledger rows once a repository's analysis completed
    pub async fn clear_ledger(&self, repo: &RepoId) -> Result<u64, BrokerError> {
        Ok(sqlx::query("DELETE FROM scan_ledger WHERE repo = ?")
            .bind(repo.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, BrokerError> {
    let raw: String = row.get("id");
    let lane: String = row.get("lane");
    let state: String = row.get("state");
    Ok(JobRecord {
        id: JobId(parse_uuid(&raw)?),
        lane: Lane::parse(&lane).ok_or_else(|| BrokerError::InvalidRow(format!("unknown lane {lane:?}")))?,
        state: JobState::parse(&state).ok_or_else(|| BrokerError::InvalidRow(format!("unknown state {state:?}")))?,
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        available_at: row.get("available_at"),
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl ScanLedger for SqliteBroker {
    async fn already_scanned(&self, repo: &RepoId, hash: &ObjectHash, backend: &str) -> Result<bool, PipelineError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM scan_ledger WHERE repo = ? AND hash = ? AND backend = ?")
                .bind(repo.to_string())
                .bind(hash.as_bytes().as_slice())
                .bind(backend)
                .fetch_optional(&self.pool)
                .await
                .map_err(BrokerError::from)?;
        Ok(found.is_some())
    }

    async fn record_scanned(&self, repo: &RepoId, hash: &ObjectHash, backend: &str) -> Result<(), PipelineError> {
        sqlx::query("INSERT OR IGNORE INTO scan_ledger (repo, hash, backend) VALUES (?, ?, ?)")
            .bind(repo.to_string())
            .bind(hash.as_bytes().as_slice())
            .bind(backend)
            .execute(&self.pool)
            .await
            .map_err(BrokerError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::RepoJob;

    const VISIBILITY: Duration = Duration::from_secs(60);

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.2,
        }
    }

    async fn broker() -> (SqliteBroker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let broker = SqliteBroker::in_memory(&retry(), clock.clone()).await.unwrap();
        (broker, clock)
    }

    fn job(name: &str) -> RepoJob {
        RepoJob {
            repo: RepoId::new("octo", name),
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_active_jobs() {
        let (broker, _) = broker().await;
        let first = broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();
        let second = broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);

        // other lane is independent
        assert!(broker.enqueue(Lane::Analyze, &job("a"), "octo/a").await.unwrap().created);

        let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
        broker.ack(lease.lease_id).await.unwrap();
        let third = broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();
        assert!(third.created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let (broker, _) = broker().await;
        broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();

        let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.payload::<RepoJob>().unwrap(), job("a"));
        assert!(broker.lease(Lane::Crawl, "w2", VISIBILITY).await.unwrap().is_none());
        assert!(broker.lease(Lane::Analyze, "w2", VISIBILITY).await.unwrap().is_none());

        broker.ack(lease.lease_id).await.unwrap();
        let stats = broker.stats(Lane::Crawl).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active(), 0);
        assert!(matches!(broker.ack(lease.lease_id).await, Err(BrokerError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn test_retry_backoff_then_dead_letter() {
        let (broker, clock) = broker().await;
        let id = broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap().id;

        let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
        let outcome = broker
            .nack(lease.lease_id, Disposition::Retry { error: "clone failed".into() })
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.available_at > clock.now_ms());

        // not leasable until the backoff elapses
        assert!(broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().is_none());
        clock.advance(20_000);
        let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.attempts, 1);
        assert!(!lease.is_last_attempt());
        broker.nack(lease.lease_id, Disposition::Retry { error: "again".into() }).await.unwrap();

        clock.advance(20_000);
        let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
        assert!(lease.is_last_attempt());
        let outcome = broker
            .nack(lease.lease_id, Disposition::Retry { error: "final".into() })
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::DeadLetter);

        let record = broker.job(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::DeadLetter);
        assert_eq!(record.last_error.as_deref(), Some("final"));
        assert_eq!(broker.depth(Lane::Crawl).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delay_does_not_consume_attempts() {
        let (broker, clock) = broker().await;
        broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();

        for _ in 0..10 {
            let lease = broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().unwrap();
            assert_eq!(lease.attempts, 0);
            let until = clock.now_ms() + 5_000;
            let outcome = broker
                .nack(lease.lease_id, Disposition::Delay { until, reason: "rate limited".into() })
                .await
                .unwrap();
            assert_eq!(outcome.state, JobState::Queued);
            assert_eq!(outcome.available_at, until);
            assert!(broker.lease(Lane::Crawl, "w1", VISIBILITY).await.unwrap().is_none());
            clock.advance(5_000);
        }
    }

    #[tokio::test]
    async fn test_release_and_dead_letter() {
        let (broker, _) = broker().await;
        broker.enqueue(Lane::Analyze, &job("a"), "octo/a").await.unwrap();

        let lease = broker.lease(Lane::Analyze, "w1", VISIBILITY).await.unwrap().unwrap();
        broker.nack(lease.lease_id, Disposition::Release { reason: "disk full".into() }).await.unwrap();
        let lease = broker.lease(Lane::Analyze, "w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(lease.attempts, 0);

        let outcome = broker
            .nack(lease.lease_id, Disposition::DeadLetter { error: "repository gone".into() })
            .await
            .unwrap();
        assert_eq!(outcome.state, JobState::DeadLetter);
        assert_eq!(broker.jobs_in_state(Lane::Analyze, JobState::DeadLetter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivered() {
        let (broker, clock) = broker().await;
        broker.enqueue(Lane::Analyze, &job("a"), "octo/a").await.unwrap();

        let stale = broker.lease(Lane::Analyze, "w1", Duration::from_secs(1)).await.unwrap().unwrap();
        clock.advance(2_000);
        assert!(matches!(
            broker.renew(stale.lease_id, VISIBILITY).await,
            Err(BrokerError::LeaseLost(_))
        ));

        // expiry is a failed delivery with backoff
        assert!(broker.lease(Lane::Analyze, "w2", VISIBILITY).await.unwrap().is_none());
        clock.advance(20_000);
        let fresh = broker.lease(Lane::Analyze, "w2", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(fresh.attempts, 1);
        assert_eq!(fresh.id, stale.id);

        assert!(matches!(broker.ack(stale.lease_id).await, Err(BrokerError::LeaseLost(_))));
        broker.ack(fresh.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_after_expiry_scan_keeps_lease() {
        let (broker, clock) = broker().await;
        broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();
        let lease = broker.lease(Lane::Crawl, "w1", Duration::from_secs(10)).await.unwrap().unwrap();

        clock.advance(10_001);
        let lapsed = broker.lapsed_leases(clock.now_ms()).await.unwrap();
        assert_eq!(lapsed.len(), 1);

        // another process, its clock a little behind, renews in between
        clock.advance(-2);
        broker.renew(lease.lease_id, VISIBILITY).await.unwrap();
        clock.advance(2);

        assert!(!broker.expire_lease(&lapsed[0], clock.now_ms()).await.unwrap());
        let record = broker.job(lease.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Leased);
        assert_eq!(record.attempts, 0);
        broker.ack(lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let (broker, clock) = broker().await;
        broker.enqueue(Lane::Crawl, &job("a"), "octo/a").await.unwrap();
        let lease = broker.lease(Lane::Crawl, "w1", Duration::from_secs(10)).await.unwrap().unwrap();

        clock.advance(8_000);
        broker.renew(lease.lease_id, Duration::from_secs(10)).await.unwrap();
        clock.advance(8_000);
        assert!(broker.lease(Lane::Crawl, "w2", VISIBILITY).await.unwrap().is_none());
        broker.ack(lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_depth_counts_active() {
        let (broker, _) = broker().await;
        for name in ["a", "b", "c"] {
            broker
                .enqueue(Lane::Analyze, &job(name), &format!("octo/{name}"))
                .await
                .unwrap();
        }
        let lease = broker.lease(Lane::Analyze, "w1", VISIBILITY).await.unwrap().unwrap();
        assert_eq!(broker.depth(Lane::Analyze).await.unwrap(), 3);
        broker.ack(lease.lease_id).await.unwrap();
        assert_eq!(broker.depth(Lane::Analyze).await.unwrap(), 2);
        assert_eq!(broker.depth(Lane::Crawl).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_processed_cache_ttl() {
        let (broker, clock) = broker().await;
        let repo = RepoId::new("octo", "a");
        let ttl = Duration::from_secs(60);
        assert!(!broker.recently_processed(&repo, ttl).await.unwrap());

        broker.mark_processed(&repo).await.unwrap();
        assert!(broker.recently_processed(&repo, ttl).await.unwrap());
        assert!(!broker.recently_processed(&repo, Duration::ZERO).await.unwrap());
        clock.advance(61_000);
        assert!(!broker.recently_processed(&repo, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_ledger() {
        let (broker, _) = broker().await;
        let repo = RepoId::new("octo", "a");
        let hash = ObjectHash::from_bytes([3; 20]);

        assert!(!broker.already_scanned(&repo, &hash, "custom-rules").await.unwrap());
        broker.record_scanned(&repo, &hash, "custom-rules").await.unwrap();
        broker.record_scanned(&repo, &hash, "custom-rules").await.unwrap();
        assert!(broker.already_scanned(&repo, &hash, "custom-rules").await.unwrap());
        assert!(!broker.already_scanned(&repo, &hash, "trufflehog").await.unwrap());

        assert_eq!(broker.clear_ledger(&repo).await.unwrap(), 1);
        assert!(!broker.already_scanned(&repo, &hash, "custom-rules").await.unwrap());
    }
}
