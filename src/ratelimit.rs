//! Shared request budget against the hosting service
//!
//! A fixed window counter stored in the broker database, so every crawl
//! worker on every process draws from the same quota. Host responses
//! reconcile the counter with the host's own accounting.

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::PipelineError;
use crate::queue::BrokerError;

#[async_trait]
pub trait RateBudget: Send + Sync {
    /// Take one request from the budget. An exhausted budget reports
    /// [`PipelineError::RateLimited`] with the refill time.
    async fn acquire(&self) -> Result<(), PipelineError>;

    /// Feed back `remaining` requests until `reset_at` (epoch ms) as
    /// reported by the host
    async fn observe(&self, remaining: u32, reset_at: i64) -> Result<(), PipelineError>;
}

pub struct SqliteRateBudget {
    pool: Pool<Sqlite>,
    clock: Arc<dyn Clock>,
    host: String,
    limit: u32,
    window_ms: i64,
}

impl SqliteRateBudget {
    pub async fn new(
        pool: Pool<Sqlite>,
        clock: Arc<dyn Clock>,
        host: impl Into<String>,
        config: &RateLimitConfig,
    ) -> Result<Self, BrokerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_budget (
                host TEXT PRIMARY KEY,
                remaining INTEGER NOT NULL,
                reset_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            clock,
            host: host.into(),
            limit: config.requests_per_window.max(1),
            window_ms: i64::try_from(config.window_secs.max(1) * 1000).unwrap_or(i64::MAX),
        })
    }

    pub async fn remaining(&self) -> Result<Option<(u32, i64)>, BrokerError> {
        let row = sqlx::query("SELECT remaining, reset_at FROM rate_budget WHERE host = ?")
            .bind(&self.host)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>("remaining").max(0) as u32, r.get("reset_at"))))
    }

    async fn try_acquire(&self) -> Result<Result<u32, i64>, BrokerError> {
        let now = self.clock.now_ms();
        let limit = i64::from(self.limit);

        sqlx::query("INSERT OR IGNORE INTO rate_budget (host, remaining, reset_at) VALUES (?1, ?2, ?3)")
            .bind(&self.host)
            .bind(limit)
            .bind(now + self.window_ms)
            .execute(&self.pool)
            .await?;

        // Refill when the window has passed, then take one
        let taken = sqlx::query(
            "UPDATE rate_budget
             SET remaining = CASE WHEN reset_at <= ?2 THEN ?3 - 1 ELSE remaining - 1 END,
                 reset_at = CASE WHEN reset_at <= ?2 THEN ?2 + ?4 ELSE reset_at END
             WHERE host = ?1 AND (reset_at <= ?2 OR remaining > 0)
             RETURNING remaining",
        )
        .bind(&self.host)
        .bind(now)
        .bind(limit)
        .bind(self.window_ms)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = taken {
            return Ok(Ok(row.get::<i64, _>("remaining").max(0) as u32));
        }

        let reset_at: i64 = sqlx::query_scalar("SELECT reset_at FROM rate_budget WHERE host = ?")
            .bind(&self.host)
            .fetch_one(&self.pool)
            .await?;
        Ok(Err(reset_at))
    }
}

#[async_trait]
impl RateBudget for SqliteRateBudget {
    async fn acquire(&self) -> Result<(), PipelineError> {
        match self.try_acquire().await? {
            Ok(remaining) => {
                debug!(host = %self.host, remaining, "request budget taken");
                Ok(())
            }
            Err(reset_at) => {
                warn!(host = %self.host, reset_at, "request budget exhausted");
                Err(PipelineError::RateLimited { reset_at })
            }
        }
    }

    async fn observe(&self, remaining: u32, reset_at: i64) -> Result<(), PipelineError> {
        // A newer window replaces ours; within the same window the lower count wins
        sqlx::query(
            "INSERT INTO rate_budget (host, remaining, reset_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(host) DO UPDATE SET
                 remaining = CASE WHEN excluded.reset_at > rate_budget.reset_at
                                  THEN excluded.remaining
                                  ELSE MIN(rate_budget.remaining, excluded.remaining) END,
                 reset_at = MAX(rate_budget.reset_at, excluded.reset_at)",
        )
        .bind(&self.host)
        .bind(i64::from(remaining))
        .bind(reset_at)
        .execute(&self.pool)
        .await
        .map_err(BrokerError::from)?;
        Ok(())
    }
}
