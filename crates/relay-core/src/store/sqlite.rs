//! SQLite-backed delayed task store.
//!
//! One row per task, keyed by its idempotency key. Survives restarts: rows
//! left `running` by a crashed process are returned to `scheduled` on open.
//! Delivered rows are deleted once `succeeded_retention` has passed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use super::{
    FailureResolution, StoreOptions, TaskState, idle_wait, resolve_failure, retention_cutoff,
};
use crate::codec::{decode_task, encode_task};
use crate::domain::{IdempotencyKey, RelayError, ScheduledTask};
use crate::observability::QueueCounts;
use crate::ports::{Clock, DelayedTaskStore, EnqueueOutcome, TaskLease};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS delayed_tasks (
    task_key      TEXT PRIMARY KEY,
    payload       BLOB NOT NULL,              -- JSON ScheduledTask
    state         TEXT NOT NULL,
    run_at_ms     INTEGER NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL,
    last_error    TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delayed_tasks_due ON delayed_tasks (state, run_at_ms);
";

fn store_err(e: rusqlite::Error) -> RelayError {
    RelayError::Store(e.to_string())
}

fn purge_succeeded(conn: &Connection, cutoff_ms: i64) -> Result<usize, RelayError> {
    conn.execute(
        "DELETE FROM delayed_tasks WHERE state = ?1 AND updated_at_ms <= ?2",
        params![TaskState::Succeeded.as_str(), cutoff_ms],
    )
    .map_err(store_err)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, RelayError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RelayError::Store(format!("timestamp out of range: {ms}")))
}

enum Claim {
    Leased {
        key: IdempotencyKey,
        task: ScheduledTask,
        attempt: u32,
        /// State before the claim, restored by `release`.
        prior: TaskState,
    },
    Idle {
        next_due: Option<DateTime<Utc>>,
    },
}

/// Durable store on a single SQLite file.
///
/// Blocking SQLite calls run on the blocking thread pool; the connection is
/// shared behind a mutex.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl SqliteTaskStore {
    /// Open (or create) the store file and recover orphaned tasks.
    pub async fn open(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, RelayError> {
            let conn = Connection::open(&path).map_err(store_err)?;
            conn.busy_timeout(busy_timeout).map_err(store_err)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })
            .map_err(store_err)?;
            Ok(conn)
        })
        .await
        .map_err(|e| RelayError::Store(e.to_string()))??;

        Self::init(conn, clock, options).await
    }

    /// Non-durable store backed by a private in-memory database.
    pub async fn open_in_memory(
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init(conn, clock, options).await
    }

    async fn init(
        conn: Connection,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self, RelayError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
            clock,
            options,
        };

        let now_ms = store.clock.now().timestamp_millis();
        let recovered = store
            .with_conn(move |conn| {
                conn.execute_batch(SCHEMA).map_err(store_err)?;
                conn.execute(
                    "UPDATE delayed_tasks SET state = ?1, updated_at_ms = ?2 WHERE state = ?3",
                    params![
                        TaskState::Scheduled.as_str(),
                        now_ms,
                        TaskState::Running.as_str()
                    ],
                )
                .map_err(store_err)
            })
            .await?;
        if recovered > 0 {
            info!(recovered, "returned interrupted tasks to the schedule");
        }

        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RelayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RelayError::Store("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RelayError::Store(e.to_string()))?
    }

    /// Run `claim` on its own task and hand the result over a channel.
    ///
    /// The blocking claim commits even when the awaiting `lease` future is
    /// dropped (a worker shutting down). A claim nobody receives is released
    /// again, so the row is neither stranded in `running` nor charged an
    /// attempt.
    async fn claim_detached(&self) -> Result<Claim, RelayError> {
        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        tokio::spawn(async move {
            let claimed = store.claim().await;
            if let Err(Ok(Claim::Leased { key, prior, .. })) = tx.send(claimed) {
                match store.release(key, prior).await {
                    Ok(()) => debug!(key = %key, "abandoned claim released"),
                    Err(e) => warn!(key = %key, error = %e, "abandoned claim not released"),
                }
            }
        });
        rx.await
            .map_err(|_| RelayError::Store("claim task ended without a result".to_string()))?
    }

    /// Undo a claim: back to `prior`, attempt refunded.
    async fn release(&self, key: IdempotencyKey, prior: TaskState) -> Result<(), RelayError> {
        let now_ms = self.clock.now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE delayed_tasks
                 SET state = ?1, attempts = MAX(attempts - 1, 0), updated_at_ms = ?2
                 WHERE task_key = ?3 AND state = ?4",
                params![
                    prior.as_str(),
                    now_ms,
                    key.to_string(),
                    TaskState::Running.as_str()
                ],
            )
            .map_err(store_err)
        })
        .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self) -> Result<Claim, RelayError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let cutoff_ms = retention_cutoff(now, self.options.succeeded_retention)
            .map(|cutoff| cutoff.timestamp_millis());
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(store_err)?;
            loop {
                let row: Option<(String, Vec<u8>, u32, String)> = tx
                    .query_row(
                        "SELECT task_key, payload, attempts, state FROM delayed_tasks
                         WHERE state IN (?1, ?2) AND run_at_ms <= ?3
                         ORDER BY run_at_ms, task_key LIMIT 1",
                        params![
                            TaskState::Scheduled.as_str(),
                            TaskState::RetryScheduled.as_str(),
                            now_ms
                        ],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                    )
                    .optional()
                    .map_err(store_err)?;

                let Some((raw_key, payload, attempts, raw_state)) = row else {
                    if let Some(cutoff_ms) = cutoff_ms {
                        purge_succeeded(&tx, cutoff_ms)?;
                    }
                    let next_due: Option<i64> = tx
                        .query_row(
                            "SELECT MIN(run_at_ms) FROM delayed_tasks WHERE state IN (?1, ?2)",
                            params![
                                TaskState::Scheduled.as_str(),
                                TaskState::RetryScheduled.as_str()
                            ],
                            |r| r.get(0),
                        )
                        .map_err(store_err)?;
                    tx.commit().map_err(store_err)?;
                    let next_due = next_due.map(from_millis).transpose()?;
                    return Ok(Claim::Idle { next_due });
                };

                let decoded = raw_key
                    .parse::<IdempotencyKey>()
                    .map_err(|e| RelayError::Store(format!("bad task key {raw_key}: {e}")))
                    .and_then(|key| decode_task(&payload).map(|task| (key, task)));
                let prior = raw_state
                    .parse::<TaskState>()
                    .map_err(|e| RelayError::Store(e.to_string()))?;

                match decoded {
                    Ok((key, task)) => {
                        tx.execute(
                            "UPDATE delayed_tasks
                             SET state = ?1, attempts = attempts + 1, updated_at_ms = ?2
                             WHERE task_key = ?3",
                            params![TaskState::Running.as_str(), now_ms, raw_key],
                        )
                        .map_err(store_err)?;
                        tx.commit().map_err(store_err)?;
                        return Ok(Claim::Leased {
                            key,
                            task,
                            attempt: attempts + 1,
                            prior,
                        });
                    }
                    Err(err) => {
                        // Unreadable rows can never be delivered; park them.
                        warn!(key = %raw_key, error = %err, "unreadable task dead-lettered");
                        tx.execute(
                            "UPDATE delayed_tasks
                             SET state = ?1, last_error = ?2, updated_at_ms = ?3
                             WHERE task_key = ?4",
                            params![TaskState::Dead.as_str(), err.to_string(), now_ms, raw_key],
                        )
                        .map_err(store_err)?;
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl DelayedTaskStore for SqliteTaskStore {
    async fn enqueue(
        &self,
        task: ScheduledTask,
        at: DateTime<Utc>,
        key: IdempotencyKey,
    ) -> Result<EnqueueOutcome, RelayError> {
        let payload = encode_task(&task)?;
        let now_ms = self.clock.now().timestamp_millis();
        let max_attempts = self.options.max_attempts;

        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO delayed_tasks
                     (task_key, payload, state, run_at_ms, attempts, max_attempts,
                      created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
                    params![
                        key.to_string(),
                        payload,
                        TaskState::Scheduled.as_str(),
                        at.timestamp_millis(),
                        max_attempts,
                        now_ms
                    ],
                )
                .map_err(store_err)
            })
            .await?;

        if inserted == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }
        self.notify.notify_one();
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn lease(&self) -> Result<Box<dyn TaskLease>, RelayError> {
        loop {
            let now = self.clock.now();
            match self.claim_detached().await? {
                Claim::Leased {
                    key, task, attempt, ..
                } => {
                    debug!(key = %key, attempt, "task leased");
                    return Ok(Box::new(SqliteLease {
                        key,
                        task,
                        attempt,
                        store: self.clone(),
                    }));
                }
                Claim::Idle { next_due } => {
                    let wait = idle_wait(next_due, now, self.options.poll_interval);
                    tokio::select! {
                        _ = self.notify.notified() => {},
                        _ = tokio::time::sleep(wait) => {},
                    }
                }
            }
        }
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, RelayError> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT state, COUNT(*) FROM delayed_tasks GROUP BY state")
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                    .map_err(store_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_err)?;
                Ok(rows)
            })
            .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            let n = n.max(0) as usize;
            match state
                .parse::<TaskState>()
                .map_err(|e| RelayError::Store(e.to_string()))?
            {
                TaskState::Scheduled => counts.scheduled = n,
                TaskState::Running => counts.running = n,
                TaskState::Succeeded => counts.succeeded = n,
                TaskState::RetryScheduled => counts.retry_scheduled = n,
                TaskState::Dead => counts.dead = n,
            }
        }
        Ok(counts)
    }
}

struct SqliteLease {
    key: IdempotencyKey,
    task: ScheduledTask,
    attempt: u32,
    store: SqliteTaskStore,
}

#[async_trait]
impl TaskLease for SqliteLease {
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
        let key = self.key.to_string();
        let now = self.store.clock.now();
        let now_ms = now.timestamp_millis();
        let retention = self.store.options.succeeded_retention;
        let cutoff_ms = retention_cutoff(now, retention).map(|cutoff| cutoff.timestamp_millis());

        let purged = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(store_err)?;
                if retention.is_zero() {
                    tx.execute(
                        "DELETE FROM delayed_tasks WHERE task_key = ?1 AND state = ?2",
                        params![key, TaskState::Running.as_str()],
                    )
                    .map_err(store_err)?;
                } else {
                    tx.execute(
                        "UPDATE delayed_tasks SET state = ?1, updated_at_ms = ?2
                         WHERE task_key = ?3 AND state = ?4",
                        params![
                            TaskState::Succeeded.as_str(),
                            now_ms,
                            key,
                            TaskState::Running.as_str()
                        ],
                    )
                    .map_err(store_err)?;
                }
                let purged = match cutoff_ms {
                    Some(cutoff_ms) => purge_succeeded(&tx, cutoff_ms)?,
                    None => 0,
                };
                tx.commit().map_err(store_err)?;
                Ok(purged)
            })
            .await?;

        if purged > 0 {
            debug!(purged, "expired succeeded tasks removed");
        }
        Ok(())
    }

    async fn fail(self: Box<Self>, error: &RelayError) -> Result<(), RelayError> {
        let key = self.key.to_string();
        let now = self.store.clock.now();
        let reason = error.to_string();
        let retryable = error.is_retryable();
        let policy = self.store.options.retry_policy.clone();

        let rescheduled = self
            .store
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(store_err)?;
                let row: Option<(u32, u32)> = tx
                    .query_row(
                        "SELECT attempts, max_attempts FROM delayed_tasks WHERE task_key = ?1",
                        params![key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()
                    .map_err(store_err)?;
                let Some((attempts, max_attempts)) = row else {
                    return Ok(false);
                };

                let resolution = resolve_failure(attempts, max_attempts, retryable, &policy, now);
                let rescheduled = match resolution {
                    FailureResolution::Dead => {
                        tx.execute(
                            "UPDATE delayed_tasks SET state = ?1, last_error = ?2, updated_at_ms = ?3
                             WHERE task_key = ?4",
                            params![
                                TaskState::Dead.as_str(),
                                reason,
                                now.timestamp_millis(),
                                key
                            ],
                        )
                        .map_err(store_err)?;
                        false
                    }
                    FailureResolution::Retry { run_at } => {
                        tx.execute(
                            "UPDATE delayed_tasks
                             SET state = ?1, run_at_ms = ?2, last_error = ?3, updated_at_ms = ?4
                             WHERE task_key = ?5",
                            params![
                                TaskState::RetryScheduled.as_str(),
                                run_at.timestamp_millis(),
                                reason,
                                now.timestamp_millis(),
                                key
                            ],
                        )
                        .map_err(store_err)?;
                        true
                    }
                };
                tx.commit().map_err(store_err)?;
                Ok(rescheduled)
            })
            .await?;

        if rescheduled {
            self.store.notify.notify_one();
        }
        Ok(())
    }
}
