//! Accounting period boundaries.
//!
//! Periods are anchored to a fixed wall-clock hour in UTC. A new record gets
//! the next anchor after its creation time. From then on the boundary only
//! ever moves forward in whole period lengths, so scheduler latency never
//! shifts when the next period ends.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};

/// Reset cadence and anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodPolicy {
    /// Period length in hours (24 for a daily budget).
    pub length_hours: u32,
    /// UTC hour (0-23) at which periods begin.
    pub anchor_hour_utc: u32,
}

impl Default for PeriodPolicy {
    fn default() -> Self {
        Self {
            length_hours: 24,
            anchor_hour_utc: 0,
        }
    }
}

impl PeriodPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.length_hours == 0 {
            return Err(QuotaError::Config(
                "period.length_hours must be greater than 0".into(),
            ));
        }
        if self.anchor_hour_utc > 23 {
            return Err(QuotaError::Config(format!(
                "period.anchor_hour_utc must be 0-23, got {}",
                self.anchor_hour_utc
            )));
        }
        Ok(())
    }

    pub fn length(&self) -> Duration {
        Duration::hours(i64::from(self.length_hours))
    }

    /// First boundary strictly after `now`, for a freshly provisioned record.
    pub fn initial_reset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let anchor_time = NaiveTime::from_hms_opt(self.anchor_hour_utc.min(23), 0, 0)
            .unwrap_or_default();
        let step = self.length().max(Duration::hours(1));
        let mut boundary = Utc.from_utc_datetime(&now.date_naive().and_time(anchor_time));
        while boundary <= now {
            boundary += step;
        }
        boundary
    }

    /// Boundary after a reset: the first `previous + k * length` (k >= 1)
    /// strictly after `now`.
    ///
    /// A record that is not yet due moves exactly one period. A record that
    /// is several periods overdue catches up in one step, so the new boundary
    /// is always in the future and every step stays on the anchor grid.
    pub fn next_boundary(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.length().max(Duration::hours(1));
        let next = previous + step;
        if next > now {
            return next;
        }
        let missed = (now - previous).num_seconds() / step.num_seconds();
        let mut boundary = previous + Duration::seconds(step.num_seconds().saturating_mul(missed));
        while boundary <= now {
            boundary += step;
        }
        boundary
    }

    /// Boundary for an admin `reset_now`: one full period from `now`.
    pub fn from_now(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_initial_reset_is_next_midnight() {
        let policy = PeriodPolicy::default();
        let now = at("2026-03-10T15:30:00Z");
        assert_eq!(policy.initial_reset_at(now), at("2026-03-11T00:00:00Z"));
    }

    #[test]
    fn test_initial_reset_same_day_anchor() {
        let policy = PeriodPolicy {
            anchor_hour_utc: 6,
            ..Default::default()
        };
        assert_eq!(
            policy.initial_reset_at(at("2026-03-10T05:59:00Z")),
            at("2026-03-10T06:00:00Z")
        );
        // Exactly on the anchor: the period ends one length later.
        assert_eq!(
            policy.initial_reset_at(at("2026-03-10T06:00:00Z")),
            at("2026-03-11T06:00:00Z")
        );
    }

    #[test]
    fn test_next_boundary_is_relative_to_previous_not_now() {
        let policy = PeriodPolicy::default();
        let prev = at("2026-03-10T00:00:00Z");
        // Late scheduler: still exactly one period past the old boundary.
        assert_eq!(
            policy.next_boundary(prev, at("2026-03-10T00:47:13Z")),
            at("2026-03-11T00:00:00Z")
        );
    }

    #[test]
    fn test_next_boundary_not_yet_due_moves_one_period() {
        let policy = PeriodPolicy::default();
        let future = at("2026-03-11T00:00:00Z");
        assert_eq!(
            policy.next_boundary(future, at("2026-03-10T12:00:00Z")),
            at("2026-03-12T00:00:00Z")
        );
    }

    #[test]
    fn test_next_boundary_catches_up_overdue_record() {
        let policy = PeriodPolicy::default();
        let prev = at("2026-03-07T00:00:00Z");
        let now = at("2026-03-10T09:30:00Z");
        let next = policy.next_boundary(prev, now);
        assert_eq!(next, at("2026-03-11T00:00:00Z"));
        assert!(next > now);

        // A boundary landing exactly on `now` is already due, so skip past it.
        assert_eq!(
            policy.next_boundary(prev, at("2026-03-10T00:00:00Z")),
            at("2026-03-11T00:00:00Z")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PeriodPolicy {
            length_hours: 0,
            anchor_hour_utc: 0
        }
        .validate()
        .is_err());
        assert!(PeriodPolicy {
            length_hours: 24,
            anchor_hour_utc: 24
        }
        .validate()
        .is_err());
        assert!(PeriodPolicy::default().validate().is_ok());
    }
}
