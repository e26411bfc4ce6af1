//! RelayBuilder - ingest loop と配信ワーカーのワイヤリング
//!
//! Collaborators are constructed by the caller and injected here; nothing
//! in the core reaches for a process-wide client.
//!
//! # Fail-fast
//! - sink と store は必須。欠けていれば `build()` が `BuildError` を返す
//! - workers = 0 も起動時に弾く

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::executor::{DeliveryExecutor, TaskHandler};
use super::ingest_loop::{IngestExit, IngestLoop};
use super::worker_loop::WorkerGroup;
use crate::domain::RelayError;
use crate::observability::QueueCounts;
use crate::ports::{
    Clock, DelayedTaskStore, EventSink, IdGenerator, MessageSink, MessageSource, SystemClock,
    TracingEventSink, UlidGenerator,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing collaborator: {0}")]
    Missing(&'static str),

    #[error("worker concurrency must be at least 1")]
    NoWorkers,
}

/// Builds a `Relay`.
///
/// ```ignore
/// let relay = RelayBuilder::new()
///     .sink(Arc::new(nats.sink()))
///     .store(Arc::new(store))
///     .workers(10)
///     .build()?;
/// let exit = relay.run(&mut source, shutdown).await;
/// ```
///
/// Defaults: `SystemClock`, ULID keys from that clock, `TracingEventSink`,
/// one worker.
pub struct RelayBuilder {
    sink: Option<Arc<dyn MessageSink>>,
    store: Option<Arc<dyn DelayedTaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Option<Arc<dyn EventSink>>,
    handler: Option<Arc<dyn TaskHandler>>,
    workers: usize,
    read_retry_delay: Duration,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            sink: None,
            store: None,
            clock: None,
            ids: None,
            events: None,
            handler: None,
            workers: 1,
            read_retry_delay: Duration::from_secs(1),
        }
    }

    /// Destination stream, shared by immediate forwarding and the executor.
    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(mut self, store: Arc<dyn DelayedTaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the default `DeliveryExecutor`.
    pub fn task_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn read_retry_delay(mut self, delay: Duration) -> Self {
        self.read_retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<Relay, BuildError> {
        let sink = self.sink.ok_or(BuildError::Missing("sink"))?;
        let store = self.store.ok_or(BuildError::Missing("store"))?;
        if self.workers == 0 {
            return Err(BuildError::NoWorkers);
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));
        let handler = self.handler.unwrap_or_else(|| {
            Arc::new(DeliveryExecutor::new(Arc::clone(&sink), Arc::clone(&events)))
        });

        let ingest = IngestLoop::new(sink, Arc::clone(&store), clock, ids, events)
            .with_read_retry_delay(self.read_retry_delay);

        Ok(Relay {
            ingest,
            store,
            handler,
            workers: self.workers,
        })
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled relay: one ingest loop plus a group of delivery workers.
pub struct Relay {
    ingest: IngestLoop,
    store: Arc<dyn DelayedTaskStore>,
    handler: Arc<dyn TaskHandler>,
    workers: usize,
}

impl Relay {
    pub async fn counts(&self) -> Result<QueueCounts, RelayError> {
        self.store.counts_by_state().await
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The ingest loop and the workers are independent: reaching the end of
    /// the source stream stops ingestion only, and scheduled tasks keep being
    /// delivered until shutdown. On shutdown the in-flight message and every
    /// running delivery finish before this returns.
    pub async fn run<S>(&self, source: &mut S, shutdown: CancellationToken) -> IngestExit
    where
        S: MessageSource + ?Sized,
    {
        let workers = WorkerGroup::spawn(
            self.workers,
            Arc::clone(&self.store),
            Arc::clone(&self.handler),
        );

        let exit = self.ingest.run(source, shutdown.clone()).await;
        if exit == IngestExit::EndOfStream {
            info!("source ended, delivering scheduled tasks until shutdown");
            shutdown.cancelled().await;
        }

        workers.shutdown_and_join().await;
        exit
    }
}
