//! In-memory delayed task store.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{
    FailureResolution, StoreOptions, TaskRecord, TaskState, idle_wait, resolve_failure,
    retention_cutoff,
};
use crate::domain::{IdempotencyKey, RelayError, ScheduledTask};
use crate::observability::QueueCounts;
use crate::ports::{Clock, DelayedTaskStore, EnqueueOutcome, TaskLease};

/// Heap entry; reversed so `BinaryHeap` pops the earliest `run_at` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DueEntry {
    run_at: DateTime<Utc>,
    key: IdempotencyKey,
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.key.cmp(&self.key))
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<IdempotencyKey, TaskRecord>,
    due: BinaryHeap<DueEntry>,
    /// Succeeded keys in completion order, for retention purges.
    finished: VecDeque<(DateTime<Utc>, IdempotencyKey)>,
}

impl StoreState {
    /// Pop the first due, still-runnable record and mark it Running.
    fn claim_due(&mut self, now: DateTime<Utc>) -> Option<(IdempotencyKey, ScheduledTask, u32)> {
        while let Some(entry) = self.due.peek() {
            if entry.run_at > now {
                return None;
            }
            let Some(entry) = self.due.pop() else {
                return None;
            };
            // Entries go stale when a record is rescheduled; the record wins.
            if let Some(record) = self.records.get_mut(&entry.key)
                && record.run_at == entry.run_at
                && record.is_due(now)
            {
                record.start_attempt(now);
                return Some((entry.key, record.task.clone(), record.attempts));
            }
        }
        None
    }

    /// Record a delivery. With zero retention the record is dropped at once.
    fn finish(&mut self, key: IdempotencyKey, now: DateTime<Utc>, retention: Duration) {
        if retention.is_zero() {
            self.records.remove(&key);
            return;
        }
        if let Some(record) = self.records.get_mut(&key) {
            record.mark_succeeded(now);
            self.finished.push_back((now, key));
        }
    }

    /// Drop succeeded records older than `retention`.
    fn purge_succeeded(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Some(cutoff) = retention_cutoff(now, retention) else {
            return 0;
        };
        let mut purged = 0;
        while let Some(&(done_at, key)) = self.finished.front() {
            if done_at > cutoff {
                break;
            }
            self.finished.pop_front();
            if self
                .records
                .get(&key)
                .is_some_and(|record| record.state == TaskState::Succeeded)
            {
                self.records.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::RetryScheduled => counts.retry_scheduled += 1,
                TaskState::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

/// Process-local store for tests and embedding. Not durable.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            notify: Arc::new(Notify::new()),
            clock,
            options,
        }
    }

    /// Snapshot of one record, if present.
    pub async fn record(&self, key: IdempotencyKey) -> Option<TaskRecord> {
        self.state.lock().await.records.get(&key).cloned()
    }
}

#[async_trait]
impl DelayedTaskStore for InMemoryTaskStore {
    async fn enqueue(
        &self,
        task: ScheduledTask,
        at: DateTime<Utc>,
        key: IdempotencyKey,
    ) -> Result<EnqueueOutcome, RelayError> {
        {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&key) {
                return Ok(EnqueueOutcome::Duplicate);
            }
            let record = TaskRecord::new(key, task, at, self.options.max_attempts, self.clock.now());
            state.records.insert(key, record);
            state.due.push(DueEntry { run_at: at, key });
        }
        self.notify.notify_one();
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn lease(&self) -> Result<Box<dyn TaskLease>, RelayError> {
        loop {
            let now = self.clock.now();
            let next_due = {
                // claim はロック内で完結し、この後に await は無い (cancel-safe)
                let mut state = self.state.lock().await;
                state.purge_succeeded(now, self.options.succeeded_retention);
                if let Some((key, task, attempt)) = state.claim_due(now) {
                    debug!(key = %key, attempt, "task leased");
                    return Ok(Box::new(InMemoryLease {
                        key,
                        task,
                        attempt,
                        store: self.clone(),
                    }));
                }
                state.due.peek().map(|entry| entry.run_at)
            };

            let wait = idle_wait(next_due, now, self.options.poll_interval);
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, RelayError> {
        Ok(self.state.lock().await.counts_by_state())
    }
}

struct InMemoryLease {
    key: IdempotencyKey,
    task: ScheduledTask,
    attempt: u32,
    store: InMemoryTaskStore,
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn key(&self) -> IdempotencyKey {
        self.key
    }

    fn task(&self) -> &ScheduledTask {
        &self.task
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), RelayError> {
        let now = self.store.clock.now();
        let retention = self.store.options.succeeded_retention;
        let mut state = self.store.state.lock().await;
        state.finish(self.key, now, retention);
        let purged = state.purge_succeeded(now, retention);
        if purged > 0 {
            debug!(purged, "expired succeeded tasks removed");
        }
        Ok(())
    }

    async fn fail(self: Box<Self>, error: &RelayError) -> Result<(), RelayError> {
        let now = self.store.clock.now();
        let rescheduled = {
            let mut state = self.store.state.lock().await;
            let Some(record) = state.records.get_mut(&self.key) else {
                return Ok(());
            };

            match resolve_failure(
                record.attempts,
                record.max_attempts,
                error.is_retryable(),
                &self.store.options.retry_policy,
                now,
            ) {
                FailureResolution::Dead => {
                    record.mark_dead(error.to_string(), now);
                    false
                }
                FailureResolution::Retry { run_at } => {
                    record.schedule_retry(run_at, error.to_string(), now);
                    state.due.push(DueEntry {
                        run_at,
                        key: self.key,
                    });
                    true
                }
            }
        };

        if rescheduled {
            self.store.notify.notify_one();
        }
        Ok(())
    }
}
