//! Task state machine for the delayed task store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a scheduled task.
///
/// State transitions:
/// - Scheduled -> Running -> Succeeded
/// - Scheduled -> Running -> RetryScheduled -> Running (until max_attempts)
/// - Scheduled -> Running -> Dead (max_attempts reached, or permanent failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its execution time.
    Scheduled,

    /// Leased by an executor.
    Running,

    /// Delivered to the destination.
    Succeeded,

    /// Waiting for a retry after a failed execution.
    RetryScheduled,

    /// Gave up.
    Dead,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::RetryScheduled => "retry_scheduled",
            TaskState::Dead => "dead",
        }
    }

    /// Eligible for lease once due.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::RetryScheduled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task state: {}", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for TaskState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskState::Scheduled),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "retry_scheduled" => Ok(TaskState::RetryScheduled),
            "dead" => Ok(TaskState::Dead),
            other => Err(UnknownState(other.to_string())),
        }
    }
}
