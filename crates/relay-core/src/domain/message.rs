//! Outbound message handed to the destination stream.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Message metadata: unique keys, order irrelevant.
pub type Headers = BTreeMap<String, String>;

/// A message ready to be written to a destination topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            headers,
        }
    }
}
