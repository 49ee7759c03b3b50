//! Retry schedule and error classification.

use std::time::Duration;

use super::error::JobError;
use crate::gateways::GatewayError;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Delay before attempt `n + 1` after `n` failures: 1m, 5m, 15m, 1h, 6h, 12h, then 1d.
const DEFAULT_SCHEDULE: [Duration; 7] = [
    Duration::from_secs(MINUTE),
    Duration::from_secs(5 * MINUTE),
    Duration::from_secs(15 * MINUTE),
    Duration::from_secs(HOUR),
    Duration::from_secs(6 * HOUR),
    Duration::from_secs(12 * HOUR),
    Duration::from_secs(24 * HOUR),
];

pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Fixed-table backoff with a hard attempt cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule: Vec<Duration>,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Custom schedule; the last entry repeats for later attempts.
    ///
    /// An empty schedule retries immediately.
    pub fn new(schedule: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            schedule,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based). Attempt 0 is treated as 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.schedule
            .get(idx)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default()
    }

    /// HTTP 5xx and 429 are retryable, other HTTP statuses terminal.
    /// Precondition failures are terminal; everything else is assumed transient.
    pub fn classify(error: &JobError) -> ErrorClass {
        match error {
            JobError::Gateway(GatewayError::Http { status, .. }) => classify_status(*status),
            JobError::Precondition(_) => ErrorClass::Terminal,
            JobError::Gateway(_) | JobError::Store(_) | JobError::Timeout(_) => {
                ErrorClass::Retryable
            }
        }
    }

    /// `attempts` is the failure count including the one just observed.
    pub fn decide(&self, error: &JobError, attempts: u32) -> RetryDecision {
        match Self::classify(error) {
            ErrorClass::Retryable if attempts < self.max_attempts => {
                RetryDecision::RetryAfter(self.next_delay(attempts))
            }
            _ => RetryDecision::GiveUp,
        }
    }
}

pub fn classify_status(status: u16) -> ErrorClass {
    if status >= 500 || status == 429 {
        ErrorClass::Retryable
    } else {
        ErrorClass::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    fn http(status: u16) -> JobError {
        JobError::Gateway(GatewayError::Http {
            status,
            body: String::new(),
        })
    }

    #[test]
    fn schedule_matches_table() {
        let policy = BackoffPolicy::default();
        let expected = [
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(900),
            Duration::from_secs(3_600),
            Duration::from_secs(21_600),
            Duration::from_secs(43_200),
        ];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(policy.next_delay(i as u32 + 1), *want, "attempt {}", i + 1);
        }
        assert_eq!(policy.next_delay(7), Duration::from_secs(86_400));
        assert_eq!(policy.next_delay(40), Duration::from_secs(86_400));
        assert_eq!(policy.next_delay(0), Duration::from_secs(60));
    }

    #[test]
    fn http_classification() {
        for status in [500, 502, 503, 429] {
            assert_eq!(BackoffPolicy::classify(&http(status)), ErrorClass::Retryable, "{status}");
        }
        for status in [400, 401, 404, 409, 422] {
            assert_eq!(BackoffPolicy::classify(&http(status)), ErrorClass::Terminal, "{status}");
        }
    }

    #[test]
    fn non_http_classification() {
        assert_eq!(
            BackoffPolicy::classify(&JobError::precondition("no paid payment found")),
            ErrorClass::Terminal
        );
        assert_eq!(
            BackoffPolicy::classify(&JobError::Gateway(GatewayError::Transport("reset".into()))),
            ErrorClass::Retryable
        );
        assert_eq!(
            BackoffPolicy::classify(&JobError::Store(StoreError::Poisoned)),
            ErrorClass::Retryable
        );
        assert_eq!(
            BackoffPolicy::classify(&JobError::Timeout(Duration::from_secs(30))),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn seventh_failure_gives_up() {
        let policy = BackoffPolicy::default();
        let err = http(503);
        assert_eq!(
            policy.decide(&err, 1),
            RetryDecision::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(
            policy.decide(&err, 6),
            RetryDecision::RetryAfter(Duration::from_secs(43_200))
        );
        assert_eq!(policy.decide(&err, 7), RetryDecision::GiveUp);
    }

    #[test]
    fn precondition_gives_up_on_first_attempt() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.decide(&JobError::precondition("invalid amount"), 1),
            RetryDecision::GiveUp
        );
    }
}
