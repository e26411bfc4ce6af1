//! End-to-end: channel source → decision → task store → workers → sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use relay_core::app::{IngestExit, RelayBuilder};
use relay_core::domain::{DispatchEvent, Headers, InboundEnvelope};
use relay_core::impls::{RecordingEventSink, RecordingSink, Settlement, channel};
use relay_core::ports::{Clock, DelayedTaskStore, FixedClock};
use relay_core::store::{InMemoryTaskStore, SqliteTaskStore, StoreOptions};
use tokio_util::sync::CancellationToken;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn options() -> StoreOptions {
    StoreOptions {
        poll_interval: Duration::from_millis(10),
        ..StoreOptions::default()
    }
}

fn raw(envelope: &InboundEnvelope) -> Vec<u8> {
    serde_json::to_vec(envelope).unwrap()
}

async fn drive(store: Arc<dyn DelayedTaskStore>, clock: FixedClock) {
    let sink = RecordingSink::new();
    let events = RecordingEventSink::new();
    let relay = RelayBuilder::new()
        .sink(Arc::new(sink.clone()))
        .store(Arc::clone(&store))
        .clock(Arc::new(clock.clone()))
        .event_sink(Arc::new(events.clone()))
        .workers(2)
        .build()
        .unwrap();

    let (tx, mut source) = channel("delay_relay.envelopes");
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { relay.run(&mut source, shutdown).await })
    };

    let headers: Headers = [("trace-id".to_string(), "abc".to_string())].into();
    let delayed = tx
        .send(
            raw(&InboundEnvelope::new("billing", "ZGVsYXllZA==").with_process_in(300)),
            headers.clone(),
        )
        .unwrap();
    let immediate = tx
        .send(raw(&InboundEnvelope::new("orders", "aGVsbG8=")), Headers::new())
        .unwrap();
    let dropped = tx
        .send(
            raw(&InboundEnvelope::new("orders", "c3RhbGU=")
                .with_process_at(t0().timestamp() - 600)
                .with_tolerance(300)),
            Headers::new(),
        )
        .unwrap();
    let garbage = tx
        .send(raw(&InboundEnvelope::new("orders", "not-base64!!")), Headers::new())
        .unwrap();

    assert_eq!(delayed.await.unwrap(), Settlement::Acked);
    assert_eq!(immediate.await.unwrap(), Settlement::Acked);
    assert_eq!(dropped.await.unwrap(), Settlement::Acked);
    assert_eq!(garbage.await.unwrap(), Settlement::Terminated);

    // Only the immediate message has gone out so far.
    assert!(sink.wait_for(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let published = sink.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "orders");
    assert_eq!(published[0].payload.as_ref(), b"hello");

    let counts = store.counts_by_state().await.unwrap();
    assert_eq!(counts.scheduled, 1);

    // Time passes; the delayed message becomes due and is delivered once.
    clock.advance(TimeDelta::seconds(300));
    assert!(sink.wait_for(2, Duration::from_secs(2)).await);
    let delivered = &sink.published()[1];
    assert_eq!(delivered.topic, "billing");
    assert_eq!(delivered.payload.as_ref(), b"delayed");
    assert_eq!(delivered.headers, headers);

    // The source ends, but shutdown is what stops the relay.
    drop(tx);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!running.is_finished());
    shutdown.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, IngestExit::EndOfStream);

    // Delivered tasks leave the store on ack.
    let counts = store.counts_by_state().await.unwrap();
    assert_eq!(counts.total(), 0);

    let names: Vec<&str> = events.events().iter().map(DispatchEvent::name).collect();
    assert_eq!(
        names,
        vec!["scheduled", "forwarded", "dropped", "rejected", "delivered"]
    );
}

#[tokio::test]
async fn relay_flow_with_memory_store() {
    let clock = FixedClock::new(t0());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(InMemoryTaskStore::new(shared, options()));
    drive(store, clock).await;
}

#[tokio::test]
async fn relay_flow_with_sqlite_store() {
    let clock = FixedClock::new(t0());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(SqliteTaskStore::open_in_memory(shared, options()).await.unwrap());
    drive(store, clock).await;
}

#[tokio::test]
async fn failed_delivery_is_retried_by_the_store() {
    let clock = FixedClock::new(t0());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(InMemoryTaskStore::new(Arc::clone(&shared), options()));
    let sink = RecordingSink::new();
    let relay = RelayBuilder::new()
        .sink(Arc::new(sink.clone()))
        .store(store.clone())
        .clock(shared)
        .build()
        .unwrap();

    let (tx, mut source) = channel("delay_relay.envelopes");
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { relay.run(&mut source, shutdown).await })
    };

    let settled = tx
        .send(
            raw(&InboundEnvelope::new("billing", "aGk=").with_process_in(10)),
            Headers::new(),
        )
        .unwrap();
    assert_eq!(settled.await.unwrap(), Settlement::Acked);

    sink.fail_next(1);
    clock.advance(TimeDelta::seconds(10));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.published().is_empty());
    assert_eq!(store.counts_by_state().await.unwrap().retry_scheduled, 1);

    // Default backoff: 2s after the first failure.
    clock.advance(TimeDelta::seconds(2));
    assert!(sink.wait_for(1, Duration::from_secs(2)).await);

    shutdown.cancel();
    let exit = running.await.unwrap();
    assert_eq!(exit, IngestExit::Shutdown);
    assert_eq!(store.counts_by_state().await.unwrap().total(), 0);
}
