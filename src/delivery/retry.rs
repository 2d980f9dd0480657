use chrono::{DateTime, Duration, Utc};

/// Exponent cap; keeps the shift well inside i64 minutes.
const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub jitter_secs: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, jitter_secs: u64) -> Self {
        Self {
            max_attempts,
            jitter_secs,
        }
    }

    /// Delay before the next try, given the attempts made before the one that
    /// just failed: 1, 2, 4, 8... minutes, plus up to `jitter_secs` seconds.
    pub fn backoff(&self, attempts_before: i32) -> Duration {
        let exponent = attempts_before.clamp(0, MAX_BACKOFF_EXPONENT as i32) as u32;
        let base = Duration::minutes(1i64 << exponent);
        if self.jitter_secs == 0 {
            return base;
        }
        base + Duration::seconds(rand::random_range(0..=self.jitter_secs) as i64)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts_before: i32) -> DateTime<Utc> {
        now + self.backoff(attempts_before)
    }

    /// Whether a job that has now made `attempts` attempts must stop retrying.
    pub fn is_exhausted(attempts: i32, max_attempts: i32) -> bool {
        attempts >= max_attempts
    }
}
