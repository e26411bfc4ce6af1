//! MessageSink port - the destination stream.

use async_trait::async_trait;

use crate::domain::{OutboundMessage, RelayError};

/// Writes messages to their destination topic.
///
/// `publish` returns only after the destination has accepted the message.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), RelayError>;
}
