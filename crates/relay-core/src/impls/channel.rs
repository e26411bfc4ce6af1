//! In-process transports over tokio channels.
//!
//! Used by tests and by embedders that feed the relay directly. Every
//! delivery reports how it was settled, so callers can observe the
//! acknowledgment policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::domain::{DispatchEvent, Headers, OutboundMessage, RelayError};
use crate::ports::{EventSink, MessageSink, MessageSource, SourceDelivery};

/// How a delivery was settled by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
    Terminated,
}

type Item = Result<ChannelDelivery, RelayError>;

/// Create a connected sender/source pair. `subject` names the source topic.
pub fn channel(subject: impl Into<String>) -> (ChannelSender, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSender {
            tx,
            subject: subject.into(),
        },
        ChannelSource { rx },
    )
}

/// Producer side. Dropping every sender ends the source stream.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Item>,
    subject: String,
}

impl ChannelSender {
    /// Send one raw message; the receiver resolves once it is settled.
    pub fn send(
        &self,
        value: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<oneshot::Receiver<Settlement>, RelayError> {
        let (settle, settled) = oneshot::channel();
        let delivery = ChannelDelivery {
            value: value.into(),
            headers,
            subject: self.subject.clone(),
            settle,
        };
        self.tx
            .send(Ok(delivery))
            .map_err(|_| RelayError::SourceRead("channel source closed".to_string()))?;
        Ok(settled)
    }

    /// Inject a read failure.
    pub fn send_error(&self, error: RelayError) -> Result<(), RelayError> {
        self.tx
            .send(Err(error))
            .map_err(|_| RelayError::SourceRead("channel source closed".to_string()))
    }
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Item>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next(&mut self) -> Option<Result<Box<dyn SourceDelivery>, RelayError>> {
        let item = self.rx.recv().await?;
        Some(item.map(|d| Box::new(d) as Box<dyn SourceDelivery>))
    }
}

pub struct ChannelDelivery {
    value: Bytes,
    headers: Headers,
    subject: String,
    settle: oneshot::Sender<Settlement>,
}

impl ChannelDelivery {
    fn finish(self, settlement: Settlement) -> Result<(), RelayError> {
        // The producer may have stopped listening; that is not our failure.
        let _ = self.settle.send(settlement);
        Ok(())
    }
}

#[async_trait]
impl SourceDelivery for ChannelDelivery {
    fn value(&self) -> &[u8] {
        &self.value
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    async fn ack(self: Box<Self>) -> Result<(), RelayError> {
        self.finish(Settlement::Acked)
    }

    async fn nak(self: Box<Self>) -> Result<(), RelayError> {
        self.finish(Settlement::Nacked)
    }

    async fn term(self: Box<Self>) -> Result<(), RelayError> {
        self.finish(Settlement::Terminated)
    }
}

/// Sink that keeps every published message in memory.
///
/// `fail_next(n)` makes the next `n` publishes fail with a forward error.
#[derive(Clone, Default)]
pub struct RecordingSink {
    published: Arc<Mutex<Vec<OutboundMessage>>>,
    failures: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `n` messages were published, up to `timeout`.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.published.lock().unwrap_or_else(PoisonError::into_inner).len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), RelayError> {
        let scripted_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(RelayError::forward(&message.topic, "scripted failure"));
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Event sink that keeps every event, for assertions.
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
