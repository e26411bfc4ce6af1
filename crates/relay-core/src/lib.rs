//! relay-core
//!
//! Delayed message relay: envelopes read from a source stream are dropped,
//! forwarded immediately, or persisted in a delayed task store and forwarded
//! once due. Delivery is at-least-once.
//!
//! # Modules
//! - **domain**: envelope, scheduled task, keys, dispatch decision, errors, events
//! - **codec**: envelope ↔ task ↔ outbound message conversions
//! - **ports**: source, sink, task store, clock, key generator, event sink
//! - **store**: in-memory and SQLite delayed task stores
//! - **impls**: NATS JetStream and in-process channel transports
//! - **app**: ingest loop, delivery executor, worker group, builder

pub mod app;
pub mod codec;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod store;

pub use app::{Relay, RelayBuilder};
pub use domain::{Dispatch, InboundEnvelope, RelayError, ScheduledTask, decide};
