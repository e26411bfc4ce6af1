//! Domain model: envelopes, tasks, keys, the dispatch decision and errors.

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod task;

pub use self::decision::{Dispatch, decide, resolve_target_time};
pub use self::envelope::InboundEnvelope;
pub use self::errors::{ErrorKind, RelayError};
pub use self::events::DispatchEvent;
pub use self::ids::IdempotencyKey;
pub use self::message::{Headers, OutboundMessage};
pub use self::task::ScheduledTask;
