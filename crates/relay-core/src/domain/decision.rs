//! Dispatch decision: when should an envelope be delivered, if at all.
//!
//! This is a pure function of the envelope and the decision instant. The
//! caller performs whatever the decision asks for.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;

use super::envelope::InboundEnvelope;
use super::errors::RelayError;

/// Outcome of the dispatch decision for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Later than the tolerance window allows; discard.
    Drop,

    /// Due now (or late within tolerance); forward straight away.
    Immediate,

    /// Due in the future; hand to the delayed task store.
    Delayed { at: DateTime<Utc> },
}

impl Dispatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dispatch::Drop => "drop",
            Dispatch::Immediate => "immediate",
            Dispatch::Delayed { .. } => "delayed",
        }
    }
}

impl fmt::Display for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the instant at which the envelope asks to be delivered.
///
/// Exactly one branch applies:
/// 1. `process_in > 0`: `now + process_in` seconds
/// 2. `process_at > 0`: the unix second `process_at`
/// 3. otherwise: `now`
///
/// Fails with `InvalidSchedule` when the chosen branch cannot be represented
/// as a calendar instant.
pub fn resolve_target_time(
    envelope: &InboundEnvelope,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, RelayError> {
    let resolved = if envelope.process_in > 0 {
        TimeDelta::try_seconds(envelope.process_in).and_then(|d| now.checked_add_signed(d))
    } else if envelope.process_at > 0 {
        DateTime::from_timestamp(envelope.process_at, 0)
    } else {
        Some(now)
    };

    resolved.ok_or(RelayError::InvalidSchedule {
        process_in: envelope.process_in,
        process_at: envelope.process_at,
    })
}

/// Classify an envelope received at `now`.
///
/// With `t` the resolved time and `tol` the tolerance:
/// - `t < now - tol`: `Drop`
/// - `t <= now`: `Immediate`
/// - otherwise: `Delayed { at: t }`
pub fn decide(envelope: &InboundEnvelope, now: DateTime<Utc>) -> Result<Dispatch, RelayError> {
    let at = resolve_target_time(envelope, now)?;

    let earliest = TimeDelta::try_seconds(envelope.tolerance_second)
        .and_then(|tolerance| now.checked_sub_signed(tolerance));
    let too_late = match earliest {
        Some(earliest) => at < earliest,
        // Tolerance beyond the calendar range: everything or nothing is late.
        None => envelope.tolerance_second < 0,
    };

    if too_late {
        Ok(Dispatch::Drop)
    } else if at <= now {
        Ok(Dispatch::Immediate)
    } else {
        Ok(Dispatch::Delayed { at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn envelope() -> InboundEnvelope {
        InboundEnvelope::new("orders", "aGVsbG8=")
    }

    #[rstest]
    #[case::no_process_at(0)]
    #[case::past_process_at(1)]
    #[case::future_process_at(4_102_444_800)]
    #[case::negative_process_at(-5)]
    fn process_in_wins_over_process_at(#[case] process_at: i64) {
        let env = envelope().with_process_in(90).with_process_at(process_at);
        let resolved = resolve_target_time(&env, now()).unwrap();
        assert_eq!(resolved, now() + TimeDelta::seconds(90));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-30)]
    fn process_at_is_used_when_process_in_not_positive(#[case] process_in: i64) {
        let at = now().timestamp() + 3600;
        let env = envelope().with_process_in(process_in).with_process_at(at);
        let resolved = resolve_target_time(&env, now()).unwrap();
        assert_eq!(resolved.timestamp(), at);
    }

    #[rstest]
    #[case::zeros(0, 0)]
    #[case::negatives(-1, -1)]
    fn defaults_to_now_and_immediate(#[case] process_in: i64, #[case] process_at: i64) {
        let env = envelope()
            .with_process_in(process_in)
            .with_process_at(process_at);
        assert_eq!(resolve_target_time(&env, now()).unwrap(), now());
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Immediate);
    }

    #[test]
    fn exactly_at_tolerance_edge_is_immediate() {
        let env = envelope()
            .with_process_at(now().timestamp() - 300)
            .with_tolerance(300);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Immediate);
    }

    #[test]
    fn one_second_past_tolerance_edge_is_dropped() {
        let env = envelope()
            .with_process_at(now().timestamp() - 301)
            .with_tolerance(300);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Drop);
    }

    #[test]
    fn resolved_exactly_now_is_immediate_not_delayed() {
        let env = envelope().with_process_at(now().timestamp());
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Immediate);
    }

    #[test]
    fn relative_delay_is_scheduled_at_exact_time() {
        let env = envelope().with_process_in(300);
        assert_eq!(
            decide(&env, now()).unwrap(),
            Dispatch::Delayed {
                at: now() + TimeDelta::seconds(300)
            }
        );
    }

    #[test]
    fn too_late_beyond_tolerance_is_dropped() {
        let env = envelope()
            .with_process_at(now().timestamp() - 600)
            .with_tolerance(300);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Drop);
    }

    #[test]
    fn late_within_tolerance_is_immediate() {
        let env = envelope()
            .with_process_at(now().timestamp() - 200)
            .with_tolerance(300);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Immediate);
    }

    #[test]
    fn late_without_tolerance_is_dropped() {
        let env = envelope().with_process_at(now().timestamp() - 1);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Drop);
    }

    #[test]
    fn negative_tolerance_narrows_window_past_now() {
        let env = envelope().with_tolerance(-10);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Drop);
    }

    #[test]
    fn huge_tolerance_never_drops() {
        let env = envelope().with_process_at(1).with_tolerance(i64::MAX);
        assert_eq!(decide(&env, now()).unwrap(), Dispatch::Immediate);
    }

    #[test]
    fn unrepresentable_process_at_is_invalid_schedule() {
        let env = envelope().with_process_at(i64::MAX);
        let err = decide(&env, now()).unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidSchedule {
                process_in: 0,
                process_at: i64::MAX
            }
        ));
    }

    #[test]
    fn overflowing_process_in_is_invalid_schedule() {
        let env = envelope().with_process_in(i64::MAX);
        assert!(matches!(
            decide(&env, now()),
            Err(RelayError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn decision_names() {
        assert_eq!(Dispatch::Drop.to_string(), "drop");
        assert_eq!(Dispatch::Immediate.as_str(), "immediate");
        assert_eq!(Dispatch::Delayed { at: now() }.as_str(), "delayed");
    }
}
