//! Inbound envelope: what a producer asks the relay to deliver, and when.

use serde::{Deserialize, Serialize};

use super::errors::RelayError;

/// Wire form of a delivery request read from the source stream.
///
/// Timing fields:
/// - `process_in > 0` wins: deliver `process_in` seconds after receipt
/// - otherwise `process_at > 0`: deliver at that unix second
/// - otherwise deliver now
///
/// `tolerance_second` is the grace window for late envelopes:
/// - resolved time in the future: enqueue
/// - late by at most `tolerance_second`: deliver now
/// - late by more: drop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Destination topic.
    #[serde(default)]
    pub topic: String,

    /// Base64-encoded raw bytes, kept in its wire encoding.
    #[serde(default)]
    pub payload: String,

    #[serde(rename = "processIn", default)]
    pub process_in: i64,

    #[serde(rename = "processAt", default)]
    pub process_at: i64,

    #[serde(rename = "toleranceSecond", default)]
    pub tolerance_second: i64,
}

impl InboundEnvelope {
    /// Envelope for immediate delivery of an already-encoded payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            process_in: 0,
            process_at: 0,
            tolerance_second: 0,
        }
    }

    pub fn with_process_in(mut self, seconds: i64) -> Self {
        self.process_in = seconds;
        self
    }

    pub fn with_process_at(mut self, epoch_seconds: i64) -> Self {
        self.process_at = epoch_seconds;
        self
    }

    pub fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_second = seconds;
        self
    }

    /// Parse and validate a raw source message value.
    pub fn from_slice(value: &[u8]) -> Result<Self, RelayError> {
        let envelope: Self = serde_json::from_slice(value)
            .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.topic.trim().is_empty() {
            return Err(RelayError::MalformedEnvelope(
                "topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
