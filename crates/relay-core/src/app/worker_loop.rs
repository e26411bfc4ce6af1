//! WorkerGroup - 期限到来タスクの配信ループ
//!
//! # フロー
//! 1. DelayedTaskStore::lease() で due なタスクを取得
//! 2. TaskHandler で配信
//! 3. 成功なら ack、失敗なら fail (retry / dead は store が決める)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::{TaskContext, TaskHandler};
use crate::ports::DelayedTaskStore;

const LEASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Worker group handle: `n` executors sharing one store.
/// - `request_shutdown()` で新しい lease を止める。実行中の handler は最後まで走る
/// - `shutdown_and_join()` は全ワーカーの終了まで待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(
        n: usize,
        store: Arc<dyn DelayedTaskStore>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let store = Arc::clone(&store);
            let handler = Arc::clone(&handler);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, store, handler, &mut rx).await;
            }));
        }
        info!(workers = n, "delivery workers started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "delivery worker panicked");
            }
        }
        info!("delivery workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn DelayedTaskStore>,
    handler: Arc<dyn TaskHandler>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease waits for a due task, so race it against shutdown.
        // 中断された lease は store 側で claim を戻す (cancel-safe)
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped: the group is gone
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = store.lease() => lease,
        };

        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                warn!(worker_id, error = %e, "lease failed");
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(LEASE_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        let ctx = TaskContext {
            key: lease.key(),
            attempt: lease.attempt(),
        };
        debug!(worker_id, key = %ctx.key, attempt = ctx.attempt, "executing task");

        // Not raced against shutdown: a started delivery always settles.
        match handler.handle(ctx, lease.task()).await {
            Ok(()) => {
                if let Err(e) = lease.ack().await {
                    error!(worker_id, key = %ctx.key, error = %e, "ack failed");
                }
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(worker_id, key = %ctx.key, attempt = ctx.attempt, error = %err, "delivery failed, store will retry");
                } else {
                    error!(worker_id, key = %ctx.key, error = %err, "delivery cannot succeed, dead-lettering");
                }
                if let Err(e) = lease.fail(&err).await {
                    error!(worker_id, key = %ctx.key, error = %e, "failure report failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Headers, IdempotencyKey, RelayError, ScheduledTask};
    use crate::ports::{Clock, FixedClock};
    use crate::store::{InMemoryTaskStore, StoreOptions, TaskState};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<fn() -> RelayError>,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _ctx: TaskContext, _task: &ScheduledTask) -> Result<(), RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn setup() -> (InMemoryTaskStore, IdempotencyKey) {
        let clock: Arc<dyn Clock> =
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = InMemoryTaskStore::new(
            clock,
            StoreOptions {
                poll_interval: Duration::from_millis(5),
                ..StoreOptions::default()
            },
        );
        (store, IdempotencyKey::from(Ulid::new()))
    }

    async fn wait_for_state(store: &InMemoryTaskStore, key: IdempotencyKey, state: Option<TaskState>) {
        for _ in 0..200 {
            if store.record(key).await.map(|r| r.state) == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached {state:?}");
    }

    fn task() -> ScheduledTask {
        ScheduledTask {
            topic: "orders".into(),
            body: "aGk=".into(),
            headers: Headers::new(),
        }
    }

    #[tokio::test]
    async fn test_workers_execute_and_ack_due_tasks() {
        let (store, key) = setup();
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        store.enqueue(task(), at, key).await.unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        let group = WorkerGroup::spawn(2, Arc::new(store.clone()), handler.clone());

        // delivered tasks are removed on ack
        wait_for_state(&store, key, None).await;
        group.shutdown_and_join().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_handler_failure_dead_letters() {
        let (store, key) = setup();
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        store.enqueue(task(), at, key).await.unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| RelayError::MalformedEnvelope("corrupt".into())),
        });
        let group = WorkerGroup::spawn(1, Arc::new(store.clone()), handler.clone());

        wait_for_state(&store, key, Some(TaskState::Dead)).await;
        group.shutdown_and_join().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_returns_while_idle() {
        let (store, _) = setup();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        let group = WorkerGroup::spawn(3, Arc::new(store), handler);

        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }
}
