//! Idempotency keys for scheduled tasks.
//!
//! # 設計
//! - ULID なので生成時刻順にソートでき、ノード間の調整なしに生成できる
//! - store は この key で enqueue を重複排除する

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

const PREFIX: &str = "task-";

/// Globally unique key assigned to a `ScheduledTask` at creation.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(Ulid);

impl IdempotencyKey {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for IdempotencyKey {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = ulid::DecodeError;

    /// Accepts both the displayed form (`task-<ULID>`) and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_has_prefix_and_parses_back() {
        let key = IdempotencyKey::from_ulid(Ulid::new());
        let shown = key.to_string();
        assert!(shown.starts_with("task-"));
        assert_eq!(shown.parse::<IdempotencyKey>().unwrap(), key);
    }

    #[test]
    fn bare_ulid_parses() {
        let ulid = Ulid::new();
        let key: IdempotencyKey = ulid.to_string().parse().unwrap();
        assert_eq!(key.as_ulid(), ulid);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!("task-not-a-ulid".parse::<IdempotencyKey>().is_err());
    }

    #[test]
    fn keys_sort_by_creation_time() {
        let k1 = IdempotencyKey::from(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let k2 = IdempotencyKey::from(Ulid::new());
        assert!(k1 < k2);
    }

    #[test]
    fn key_is_ulid_sized() {
        assert_eq!(std::mem::size_of::<IdempotencyKey>(), 16);
    }
}
