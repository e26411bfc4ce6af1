//! MessageSource port - the stream envelopes are read from.

use async_trait::async_trait;

use crate::domain::{Headers, RelayError};

/// One message read from the source stream.
///
/// The consumer owns the delivery and settles it exactly once: `ack` when the
/// outcome is final, `nak` to have it redelivered, `term` to never see it again.
#[async_trait]
pub trait SourceDelivery: Send + Sync {
    /// Raw message value (the envelope JSON).
    fn value(&self) -> &[u8];

    /// Message metadata, one value per key.
    fn headers(&self) -> &Headers;

    /// Topic the message was read from.
    fn subject(&self) -> &str;

    async fn ack(self: Box<Self>) -> Result<(), RelayError>;

    async fn nak(self: Box<Self>) -> Result<(), RelayError>;

    async fn term(self: Box<Self>) -> Result<(), RelayError>;
}

/// Sequential reader over the source stream.
///
/// - `Some(Ok(_))`: a message
/// - `Some(Err(_))`: a read failed; the caller may keep reading
/// - `None`: the stream has ended
#[async_trait]
pub trait MessageSource: Send {
    async fn next(&mut self) -> Option<Result<Box<dyn SourceDelivery>, RelayError>>;
}
