//! EventSink port - audit trail of dispatch outcomes.

use tracing::{info, warn};

use crate::domain::DispatchEvent;

/// Receives one event per dispatch outcome and per delivered task.
///
/// Must not block; called inline on the ingest and executor paths.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DispatchEvent);
}

/// Writes events as structured log lines under the `relay::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Dropped { topic, target, now } => info!(
                target: "relay::audit",
                event = event.name(),
                topic = %topic,
                target_time = %target,
                now = %now,
                "message arrived past its tolerance window, dropped"
            ),
            DispatchEvent::Forwarded { topic, bytes } => info!(
                target: "relay::audit",
                event = event.name(),
                topic = %topic,
                bytes,
                "message forwarded immediately"
            ),
            DispatchEvent::Scheduled { topic, key, at } => info!(
                target: "relay::audit",
                event = event.name(),
                topic = %topic,
                key = %key,
                at = %at,
                "message scheduled"
            ),
            DispatchEvent::Duplicate { topic, key } => info!(
                target: "relay::audit",
                event = event.name(),
                topic = %topic,
                key = %key,
                "task already scheduled"
            ),
            DispatchEvent::Rejected { topic, kind, reason } => warn!(
                target: "relay::audit",
                event = event.name(),
                topic = topic.as_deref().unwrap_or(""),
                kind = ?kind,
                reason = %reason,
                "message rejected"
            ),
            DispatchEvent::Delivered { topic, key, attempt } => info!(
                target: "relay::audit",
                event = event.name(),
                topic = %topic,
                key = %key,
                attempt,
                "scheduled message delivered"
            ),
        }
    }
}
