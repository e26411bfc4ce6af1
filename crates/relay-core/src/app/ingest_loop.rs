//! IngestLoop - Read → Decide → Dispatch → settle, one message at a time.
//!
//! Messages are handled strictly in source order. Each delivery is settled
//! only after its dispatch outcome is known:
//! - Dropped / Forwarded / Scheduled / Duplicate: ack
//! - permanent error: term (the message can never succeed)
//! - anything else: nak (the broker redelivers)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::domain::{
    Dispatch, DispatchEvent, ErrorKind, Headers, IdempotencyKey, InboundEnvelope, RelayError,
    decide,
};
use crate::ports::{
    Clock, DelayedTaskStore, EnqueueOutcome, EventSink, IdGenerator, MessageSink, MessageSource,
    SourceDelivery,
};

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dropped,
    Forwarded,
    Scheduled {
        key: IdempotencyKey,
        at: DateTime<Utc>,
    },
    Duplicate {
        key: IdempotencyKey,
    },
}

/// Why `IngestLoop::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// The source reported end of stream.
    EndOfStream,
    /// The shutdown token was cancelled.
    Shutdown,
}

pub struct IngestLoop {
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn DelayedTaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    read_retry_delay: Duration,
}

impl IngestLoop {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        store: Arc<dyn DelayedTaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sink,
            store,
            clock,
            ids,
            events,
            read_retry_delay: Duration::from_secs(1),
        }
    }

    /// Pause after a failed read before reading again.
    pub fn with_read_retry_delay(mut self, delay: Duration) -> Self {
        self.read_retry_delay = delay;
        self
    }

    /// Read until end of stream or until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between messages: a message already read
    /// is dispatched and settled before the loop exits.
    pub async fn run<S>(&self, source: &mut S, shutdown: CancellationToken) -> IngestExit
    where
        S: MessageSource + ?Sized,
    {
        info!("ingest loop started");
        let exit = loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break IngestExit::Shutdown,
                item = source.next() => item,
            };

            match item {
                None => break IngestExit::EndOfStream,
                Some(Err(e)) => {
                    warn!(error = %e, "source read failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break IngestExit::Shutdown,
                        _ = tokio::time::sleep(self.read_retry_delay) => {}
                    }
                }
                Some(Ok(delivery)) => self.process(delivery).await,
            }
        };
        info!(exit = ?exit, "ingest loop stopped");
        exit
    }

    /// Dispatch one delivery and settle it with the source.
    pub async fn process(&self, delivery: Box<dyn SourceDelivery>) {
        let result = self.handle(delivery.value(), delivery.headers()).await;

        let settled = match &result {
            Ok(outcome) => {
                debug!(subject = delivery.subject(), outcome = ?outcome, "dispatched");
                delivery.ack().await
            }
            Err(e) => {
                self.report(delivery.subject(), delivery.value(), e);
                if e.kind() == ErrorKind::Permanent {
                    delivery.term().await
                } else {
                    delivery.nak().await
                }
            }
        };

        if let Err(e) = settled {
            warn!(error = %e, "failed to settle source message");
        }
    }

    /// Parse, decide and dispatch one raw envelope.
    pub async fn handle(
        &self,
        value: &[u8],
        headers: &Headers,
    ) -> Result<DispatchOutcome, RelayError> {
        let envelope = InboundEnvelope::from_slice(value)?;
        let payload = codec::decode_payload(&envelope.payload)?;

        let now = self.clock.now();
        match decide(&envelope, now)? {
            Dispatch::Drop => {
                self.events.emit(&DispatchEvent::Dropped {
                    topic: envelope.topic.clone(),
                    target: dropped_target(&envelope, now),
                    now,
                });
                Ok(DispatchOutcome::Dropped)
            }
            Dispatch::Immediate => {
                let message = codec::immediate_message(&envelope, payload, headers);
                self.sink.publish(&message).await?;
                self.events.emit(&DispatchEvent::Forwarded {
                    topic: message.topic,
                    bytes: message.payload.len(),
                });
                Ok(DispatchOutcome::Forwarded)
            }
            Dispatch::Delayed { at } => {
                let key = self.ids.generate_key();
                let task = codec::to_task(&envelope, headers);
                match self.store.enqueue(task, at, key).await? {
                    EnqueueOutcome::Enqueued => {
                        self.events.emit(&DispatchEvent::Scheduled {
                            topic: envelope.topic,
                            key,
                            at,
                        });
                        Ok(DispatchOutcome::Scheduled { key, at })
                    }
                    EnqueueOutcome::Duplicate => {
                        self.events.emit(&DispatchEvent::Duplicate {
                            topic: envelope.topic,
                            key,
                        });
                        Ok(DispatchOutcome::Duplicate { key })
                    }
                }
            }
        }
    }

    fn report(&self, subject: &str, value: &[u8], err: &RelayError) {
        let raw = String::from_utf8_lossy(value);
        match err {
            RelayError::InvalidSchedule { .. } => {
                error!(subject, error = %err, value = %raw, "no execution time could be resolved")
            }
            e if e.kind() == ErrorKind::Permanent => {
                warn!(subject, error = %err, value = %raw, "dropping undeliverable message")
            }
            _ => error!(subject, error = %err, "dispatch failed, message will be redelivered"),
        }

        let topic = InboundEnvelope::from_slice(value).ok().map(|e| e.topic);
        self.events.emit(&DispatchEvent::Rejected {
            topic,
            kind: err.kind(),
            reason: err.to_string(),
        });
    }
}

// Only reached after `decide` succeeded, so resolution cannot fail here.
fn dropped_target(envelope: &InboundEnvelope, now: DateTime<Utc>) -> DateTime<Utc> {
    crate::domain::resolve_target_time(envelope, now).unwrap_or(now)
}
