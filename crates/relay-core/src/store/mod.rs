//! Delayed task store implementations: in-memory and SQLite.
//!
//! 両実装は同じライフサイクル (`TaskState`) と同じ失敗時の判定を共有し、
//! `ports::DelayedTaskStore` の裏で差し替え可能。

mod memory;
mod record;
mod retry;
mod sqlite;
mod state;

pub use memory::InMemoryTaskStore;
pub use record::TaskRecord;
pub use retry::RetryPolicy;
pub use sqlite::SqliteTaskStore;
pub use state::{TaskState, UnknownState};

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Tuning shared by every store implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Executions allowed per task before it is dead-lettered.
    pub max_attempts: u32,

    pub retry_policy: RetryPolicy,

    /// Upper bound on how long `lease` sleeps before re-checking for due tasks.
    pub poll_interval: Duration,

    /// How long a delivered task stays visible as `Succeeded`.
    /// Zero removes it on ack.
    pub succeeded_retention: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            retry_policy: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            succeeded_retention: Duration::ZERO,
        }
    }
}

/// What happens to a task after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureResolution {
    Retry { run_at: DateTime<Utc> },
    Dead,
}

pub(crate) fn resolve_failure(
    attempts: u32,
    max_attempts: u32,
    retryable: bool,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> FailureResolution {
    if !retryable || attempts >= max_attempts {
        return FailureResolution::Dead;
    }
    let delay = TimeDelta::from_std(policy.next_delay(attempts)).unwrap_or(TimeDelta::MAX);
    match now.checked_add_signed(delay) {
        Some(run_at) => FailureResolution::Retry { run_at },
        None => FailureResolution::Dead,
    }
}

/// Tasks that succeeded at or before the returned instant may be purged.
///
/// `None` when the retention reaches past the calendar range: nothing expires.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
}

/// How long `lease` should sleep when nothing is due yet.
pub(crate) fn idle_wait(
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> Duration {
    match next_due {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(poll_interval),
        None => poll_interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::domain::RelayError;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn transient_failure_is_retried_with_backoff() {
        let policy = RetryPolicy::default();
        let err = RelayError::forward("orders", "broker down");
        assert_eq!(
            resolve_failure(2, 5, err.is_retryable(), &policy, now()),
            FailureResolution::Retry {
                run_at: now() + TimeDelta::seconds(4)
            }
        );
    }

    #[test]
    fn exhausted_attempts_are_dead() {
        let err = RelayError::forward("orders", "broker down");
        assert_eq!(
            resolve_failure(5, 5, err.is_retryable(), &RetryPolicy::default(), now()),
            FailureResolution::Dead
        );
    }

    #[test]
    fn permanent_failure_is_dead_immediately() {
        let err = RelayError::MalformedEnvelope("bad".into());
        assert_eq!(
            resolve_failure(1, 25, err.is_retryable(), &RetryPolicy::default(), now()),
            FailureResolution::Dead
        );
    }

    #[test]
    fn retention_cutoff_trails_now() {
        assert_eq!(retention_cutoff(now(), Duration::ZERO), Some(now()));
        assert_eq!(
            retention_cutoff(now(), Duration::from_secs(3600)),
            Some(now() - TimeDelta::hours(1))
        );
        assert_eq!(retention_cutoff(now(), Duration::MAX), None);
    }

    #[test]
    fn idle_wait_is_capped_by_poll_interval() {
        let poll = Duration::from_millis(500);
        assert_eq!(idle_wait(None, now(), poll), poll);
        assert_eq!(
            idle_wait(Some(now() + TimeDelta::seconds(60)), now(), poll),
            poll
        );
        assert_eq!(
            idle_wait(Some(now() + TimeDelta::milliseconds(100)), now(), poll),
            Duration::from_millis(100)
        );
        assert_eq!(
            idle_wait(Some(now() - TimeDelta::seconds(1)), now(), poll),
            Duration::ZERO
        );
    }
}
