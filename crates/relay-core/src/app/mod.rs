//! App layer: the ingest loop, the delivery executor and their wiring.
//!
//! - **IngestLoop**: Read → Decide → Dispatch → settle, sequential
//! - **DeliveryExecutor**: decode a due task and forward it
//! - **WorkerGroup**: concurrent executors leasing from the store
//! - **RelayBuilder**: fail-fast construction of the whole relay

pub mod builder;
pub mod executor;
pub mod ingest_loop;
pub mod worker_loop;

pub use self::builder::{BuildError, Relay, RelayBuilder};
pub use self::executor::{DeliveryExecutor, TaskContext, TaskHandler};
pub use self::ingest_loop::{DispatchOutcome, IngestExit, IngestLoop};
pub use self::worker_loop::WorkerGroup;
