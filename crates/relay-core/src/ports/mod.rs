//! Ports: the seams between the relay core and the outside world.
//!
//! - source / sink: the streaming platform
//! - task_store: the durable delayed task store
//! - clock / id_generator: time and key injection
//! - event_sink: audit trail

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod sink;
pub mod source;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, TracingEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sink::MessageSink;
pub use self::source::{MessageSource, SourceDelivery};
pub use self::task_store::{DelayedTaskStore, EnqueueOutcome, TaskLease};
