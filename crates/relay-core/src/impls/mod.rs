//! Transport implementations of the source and sink ports.

pub mod channel;
pub mod nats;

pub use self::channel::{
    ChannelSender, ChannelSource, RecordingEventSink, RecordingSink, Settlement, channel,
};
pub use self::nats::{NatsClient, NatsSink, NatsSource};
