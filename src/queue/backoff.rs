//! Retry delay schedule
//!
//! `base * 2^(attempt-1)` capped at `max`, then spread over a window of
//! `anchor ± max(anchor * ratio, MIN_JITTER_MS)`. The position inside the
//! window is derived from the job id and attempt number, so the same
//! failure always produces the same delay.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::RetryConfig;
use crate::model::JobId;

const MIN_JITTER_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms.max(config.backoff_base_ms),
            jitter_ratio: f64::from(config.jitter_ratio.max(0.0)),
        }
    }

    fn anchor_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.max_ms as f64).max(0.0) as u64
    }

    /// Delay before delivery `attempt + 1`, where `attempt` failures have been recorded
    pub fn delay_ms(&self, job: JobId, attempt: u32) -> u64 {
        let anchor = self.anchor_ms(attempt);
        if anchor == 0 {
            return 0;
        }

        let span = ((anchor as f64) * self.jitter_ratio)
            .max(MIN_JITTER_MS as f64)
            .min(self.max_ms as f64);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(job, attempt);
        (lower + (upper - lower) * unit).round() as u64
    }
}

fn deterministic_unit(job: JobId, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::default();
    job.0.hash(&mut hasher);
    attempt.hash(&mut hasher);
    (hasher.finish() as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.2,
        })
    }

    #[test]
    fn test_deterministic() {
        let job = JobId::new();
        assert_eq!(backoff().delay_ms(job, 3), backoff().delay_ms(job, 3));
    }

    #[test]
    fn test_within_window() {
        let b = backoff();
        for _ in 0..50 {
            let job = JobId::new();
            let first = b.delay_ms(job, 1);
            assert!((750..=1_250).contains(&first), "{first}");
            let third = b.delay_ms(job, 3);
            assert!((3_200..=4_800).contains(&third), "{third}");
        }
    }

    #[test]
    fn test_capped() {
        let b = backoff();
        let job = JobId::new();
        assert!(b.delay_ms(job, 30) <= 60_000);
        assert!(b.delay_ms(job, 30) >= 48_000);
        assert_eq!(b.delay_ms(job, 0), 0);
    }
}
