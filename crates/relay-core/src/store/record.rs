//! Task record: persisted task plus lifecycle metadata.

use chrono::{DateTime, Utc};

use super::TaskState;
use crate::domain::{IdempotencyKey, ScheduledTask};

/// Single source of truth for one task in the in-memory store.
///
/// 状態遷移はすべてここで行う。heap 側は key しか持たない
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub key: IdempotencyKey,
    pub task: ScheduledTask,
    pub state: TaskState,

    /// When the task becomes (or became) due.
    pub run_at: DateTime<Utc>,

    /// Executions started so far, including the current one while Running.
    pub attempts: u32,
    pub max_attempts: u32,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        key: IdempotencyKey,
        task: ScheduledTask,
        run_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            task,
            state: TaskState::Scheduled,
            run_at,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_runnable() && self.run_at <= now
    }

    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Succeeded;
        self.updated_at = now;
    }

    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Dead;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.state = TaskState::RetryScheduled;
        self.run_at = run_at;
        self.last_error = Some(error);
        self.updated_at = now;
    }
}
