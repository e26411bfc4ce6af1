//! IdGenerator port - idempotency key generation.

use ulid::Ulid;

use crate::domain::IdempotencyKey;
use crate::ports::Clock;

/// IdGenerator は scheduled task ごとに新しい key を生成
///
/// Keys must be unique across processes without coordination.
pub trait IdGenerator: Send + Sync {
    fn generate_key(&self) -> IdempotencyKey;
}

/// ULID keys: timestamp from the injected clock plus 80 random bits.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_key(&self) -> IdempotencyKey {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        IdempotencyKey::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn keys_are_unique() {
        let ids = UlidGenerator::new(SystemClock);
        let keys: HashSet<_> = (0..10_000).map(|_| ids.generate_key()).collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn fixed_clock_pins_timestamp_but_not_randomness() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(fixed_time));

        let k1 = ids.generate_key();
        let k2 = ids.generate_key();
        assert_ne!(k1, k2);

        assert_eq!(k1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(k2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn keys_render_with_task_prefix() {
        let key = UlidGenerator::new(SystemClock).generate_key();
        assert!(key.to_string().starts_with("task-"));
    }
}
