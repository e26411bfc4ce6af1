//! Delivery Executor - 期限の来た ScheduledTask を outbound message に戻して送る

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::codec;
use crate::domain::{DispatchEvent, IdempotencyKey, RelayError, ScheduledTask};
use crate::ports::{EventSink, MessageSink};

/// Identity of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub key: IdempotencyKey,
    /// 1-based.
    pub attempt: u32,
}

/// Executes a leased task.
///
/// `Ok` acknowledges the attempt; `Err` hands the failure to the store, which
/// decides between retry and dead-letter.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: &ScheduledTask) -> Result<(), RelayError>;
}

/// Decodes the task and forwards it to the destination topic.
pub struct DeliveryExecutor {
    sink: Arc<dyn MessageSink>,
    events: Arc<dyn EventSink>,
}

impl DeliveryExecutor {
    pub fn new(sink: Arc<dyn MessageSink>, events: Arc<dyn EventSink>) -> Self {
        Self { sink, events }
    }
}

#[async_trait]
impl TaskHandler for DeliveryExecutor {
    async fn handle(&self, ctx: TaskContext, task: &ScheduledTask) -> Result<(), RelayError> {
        let message = codec::from_task(task)?;
        self.sink.publish(&message).await?;

        debug!(key = %ctx.key, topic = %message.topic, "task forwarded");
        self.events.emit(&DispatchEvent::Delivered {
            topic: message.topic,
            key: ctx.key,
            attempt: ctx.attempt,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{RecordingEventSink, RecordingSink};
    use ulid::Ulid;

    fn ctx() -> TaskContext {
        TaskContext {
            key: IdempotencyKey::from(Ulid::new()),
            attempt: 1,
        }
    }

    fn task(body: &str) -> ScheduledTask {
        ScheduledTask {
            topic: "orders".to_string(),
            body: body.to_string(),
            headers: [("tenant".to_string(), "t1".to_string())].into(),
        }
    }

    #[tokio::test]
    async fn forwards_decoded_task_and_emits_delivered() {
        let sink = RecordingSink::new();
        let events = RecordingEventSink::new();
        let executor = DeliveryExecutor::new(Arc::new(sink.clone()), Arc::new(events.clone()));
        let ctx = ctx();

        executor.handle(ctx, &task("aGVsbG8=")).await.unwrap();

        let published = sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload.as_ref(), b"hello");
        assert_eq!(published[0].headers, task("").headers);
        assert_eq!(
            events.events(),
            vec![DispatchEvent::Delivered {
                topic: "orders".to_string(),
                key: ctx.key,
                attempt: 1,
            }]
        );
    }

    #[tokio::test]
    async fn undecodable_body_is_a_permanent_failure() {
        let sink = RecordingSink::new();
        let executor = DeliveryExecutor::new(Arc::new(sink.clone()), Arc::new(RecordingEventSink::new()));

        let err = executor.handle(ctx(), &task("%%%")).await.unwrap_err();

        assert!(!err.is_retryable());
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_is_retryable() {
        let sink = RecordingSink::new();
        sink.fail_next(1);
        let executor = DeliveryExecutor::new(Arc::new(sink), Arc::new(RecordingEventSink::new()));

        let err = executor.handle(ctx(), &task("aGk=")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
