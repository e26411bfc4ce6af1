//! DelayedTaskStore port - durable storage of deferred deliveries.
//!
//! The store owns the task lifecycle (Scheduled -> Running -> Succeeded, with
//! RetryScheduled and Dead on failure). Executors only report outcomes.
//!
//! # 不変条件
//! - 同じ key の enqueue は 2 回目以降 `Duplicate`
//! - 配信済みタスクは `succeeded_retention` 経過後に削除される

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{IdempotencyKey, RelayError, ScheduledTask};
use crate::observability::QueueCounts;

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A task with the same key already exists; nothing was written.
    Duplicate,
}

/// A due task handed to one executor.
///
/// The holder must either `ack` or `fail` it.
#[async_trait]
pub trait TaskLease: Send {
    fn key(&self) -> IdempotencyKey;

    fn task(&self) -> &ScheduledTask;

    /// 1-based attempt number of this execution.
    fn attempt(&self) -> u32;

    /// Mark the task delivered. The task is removed once its retention ends.
    async fn ack(self: Box<Self>) -> Result<(), RelayError>;

    /// Report a failed execution; the store decides between retry and dead.
    async fn fail(self: Box<Self>, error: &RelayError) -> Result<(), RelayError>;
}

#[async_trait]
pub trait DelayedTaskStore: Send + Sync {
    /// Persist `task` to become due at `at`, deduplicated by `key`.
    async fn enqueue(
        &self,
        task: ScheduledTask,
        at: DateTime<Utc>,
        key: IdempotencyKey,
    ) -> Result<EnqueueOutcome, RelayError>;

    /// Wait for the next due task and lease it.
    ///
    /// Must be cancel-safe: workers race it against shutdown, and dropping
    /// the future must not leave a task leased to nobody.
    async fn lease(&self) -> Result<Box<dyn TaskLease>, RelayError>;

    async fn counts_by_state(&self) -> Result<QueueCounts, RelayError>;
}
