//! Store snapshots for health and status reporting.

use serde::{Deserialize, Serialize};

/// Number of tasks per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub scheduled: usize,
    pub running: usize,
    pub succeeded: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Tasks still waiting for a successful delivery.
    pub fn pending(&self) -> usize {
        self.scheduled + self.running + self.retry_scheduled
    }

    pub fn total(&self) -> usize {
        self.pending() + self.succeeded + self.dead
    }
}
