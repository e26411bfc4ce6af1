//! Audit events: one per dispatch outcome or delivery.

use chrono::{DateTime, Utc};

use super::errors::ErrorKind;
use super::ids::IdempotencyKey;

/// DispatchEvent records what the relay did with a message.
///
/// Consumed by `ports::EventSink`. A `Dropped` event is an expected outcome,
/// not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Envelope was later than its tolerance window.
    Dropped {
        topic: String,
        target: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// Forwarded straight to the destination topic.
    Forwarded { topic: String, bytes: usize },

    /// Handed to the delayed task store.
    Scheduled {
        topic: String,
        key: IdempotencyKey,
        at: DateTime<Utc>,
    },

    /// The store already held a task with this key.
    Duplicate { topic: String, key: IdempotencyKey },

    /// The envelope could not be processed.
    Rejected {
        topic: Option<String>,
        kind: ErrorKind,
        reason: String,
    },

    /// A scheduled task reached its destination.
    Delivered {
        topic: String,
        key: IdempotencyKey,
        attempt: u32,
    },
}

impl DispatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::Dropped { .. } => "dropped",
            DispatchEvent::Forwarded { .. } => "forwarded",
            DispatchEvent::Scheduled { .. } => "scheduled",
            DispatchEvent::Duplicate { .. } => "duplicate",
            DispatchEvent::Rejected { .. } => "rejected",
            DispatchEvent::Delivered { .. } => "delivered",
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            DispatchEvent::Dropped { topic, .. }
            | DispatchEvent::Forwarded { topic, .. }
            | DispatchEvent::Scheduled { topic, .. }
            | DispatchEvent::Duplicate { topic, .. }
            | DispatchEvent::Delivered { topic, .. } => Some(topic),
            DispatchEvent::Rejected { topic, .. } => topic.as_deref(),
        }
    }
}
