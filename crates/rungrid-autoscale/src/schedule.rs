//! Scheduled minimum-replica overrides.
//!
//! An override is a `[start, end)` window, optionally repeated daily,
//! weekly, monthly or yearly until `until_time`. For a given instant the
//! resolver reports the active occurrence (if any) and the next one to
//! start.

use chrono::{DateTime, Duration, Months, Utc};
use rungrid_state::{Frequency, OverridePeriod, ScheduledOverride};

/// Iteration bound for recurrences that cannot be skipped ahead
/// arithmetically (monthly, yearly).
const MAX_OCCURRENCES: u32 = 100_000;

/// Result of matching every override against one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideMatch {
    /// Minimum replicas from the winning active override.
    pub min_replicas: Option<u32>,
    pub active: Option<OverridePeriod>,
    pub upcoming: Option<OverridePeriod>,
}

/// Resolve all overrides at `now`.
///
/// When several overrides are active the one whose occurrence started
/// earliest wins; ties go to the one declared first. The upcoming period is
/// the nearest future start across all overrides.
pub fn match_overrides(overrides: &[ScheduledOverride], now: DateTime<Utc>) -> OverrideMatch {
    let mut result = OverrideMatch::default();
    for o in overrides {
        let (active, upcoming) = match_schedule(o, now);
        if let Some(a) = active
            && result
                .active
                .as_ref()
                .is_none_or(|cur| a.start_time < cur.start_time)
        {
            result.min_replicas = Some(a.min_replicas);
            result.active = Some(a);
        }
        if let Some(u) = upcoming
            && result
                .upcoming
                .as_ref()
                .is_none_or(|cur| u.start_time < cur.start_time)
        {
            result.upcoming = Some(u);
        }
    }
    result
}

/// Active and upcoming occurrence of a single override.
pub fn match_schedule(
    o: &ScheduledOverride,
    now: DateTime<Utc>,
) -> (Option<OverridePeriod>, Option<OverridePeriod>) {
    let period = |start, end| OverridePeriod {
        start_time: start,
        end_time: end,
        min_replicas: o.min_replicas,
    };

    let Some(rule) = &o.recurrence else {
        if o.start_time <= now && now < o.end_time {
            return (Some(period(o.start_time, o.end_time)), None);
        }
        if now < o.start_time {
            return (None, Some(period(o.start_time, o.end_time)));
        }
        return (None, None);
    };

    let mut active = None;
    let mut upcoming = None;
    let first = skip_ahead(rule.frequency, o, now);
    for i in first..first.saturating_add(MAX_OCCURRENCES) {
        let Some((start, end)) = occurrence(rule.frequency, o, i) else {
            break;
        };
        if rule.until_time.is_some_and(|until| start > until) {
            break;
        }
        if now < start {
            upcoming = Some(period(start, end));
            break;
        }
        if now < end && active.is_none() {
            active = Some(period(start, end));
        }
    }
    (active, upcoming)
}

/// The `i`-th occurrence of a recurring override.
fn occurrence(
    freq: Frequency,
    o: &ScheduledOverride,
    i: u32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let shift = |t: DateTime<Utc>| -> Option<DateTime<Utc>> {
        match freq {
            Frequency::Daily => t.checked_add_signed(Duration::days(i64::from(i))),
            Frequency::Weekly => t.checked_add_signed(Duration::weeks(i64::from(i))),
            Frequency::Monthly => t.checked_add_months(Months::new(i)),
            Frequency::Yearly => t.checked_add_months(Months::new(i.checked_mul(12)?)),
        }
    };
    Some((shift(o.start_time)?, shift(o.end_time)?))
}

/// First occurrence index that can still be active or upcoming at `now`.
/// Fixed-length periods jump straight past occurrences that already ended.
fn skip_ahead(freq: Frequency, o: &ScheduledOverride, now: DateTime<Utc>) -> u32 {
    let step = match freq {
        Frequency::Daily => Duration::days(1),
        Frequency::Weekly => Duration::weeks(1),
        Frequency::Monthly | Frequency::Yearly => return 0,
    };
    let elapsed = now - o.end_time;
    if elapsed <= Duration::zero() {
        return 0;
    }
    let n = elapsed.num_seconds() / step.num_seconds();
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rungrid_state::RecurrenceRule;

    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn window(start: DateTime<Utc>, hours: i64, min: u32, freq: Option<Frequency>) -> ScheduledOverride {
        ScheduledOverride {
            start_time: start,
            end_time: start + Duration::hours(hours),
            min_replicas: min,
            recurrence: freq.map(|frequency| RecurrenceRule {
                frequency,
                until_time: None,
            }),
        }
    }

    #[test]
    fn one_shot_window() {
        let o = window(at(2024, 5, 1, 9), 8, 5, None);

        let (a, u) = match_schedule(&o, at(2024, 5, 1, 8));
        assert!(a.is_none());
        assert_eq!(u.unwrap().start_time, at(2024, 5, 1, 9));

        let (a, u) = match_schedule(&o, at(2024, 5, 1, 9));
        assert_eq!(a.unwrap().min_replicas, 5);
        assert!(u.is_none());

        // End is exclusive.
        let (a, u) = match_schedule(&o, at(2024, 5, 1, 17));
        assert!(a.is_none() && u.is_none());
    }

    #[test]
    fn daily_recurrence_far_in_the_future() {
        let o = window(at(2020, 1, 1, 9), 8, 3, Some(Frequency::Daily));
        let (a, u) = match_schedule(&o, at(2024, 5, 10, 12));
        let a = a.unwrap();
        assert_eq!(a.start_time, at(2024, 5, 10, 9));
        assert_eq!(a.end_time, at(2024, 5, 10, 17));
        assert_eq!(u.unwrap().start_time, at(2024, 5, 11, 9));
    }

    #[test]
    fn weekly_recurrence_between_windows() {
        // Monday 2024-04-29 09:00 for 8 hours, weekly.
        let o = window(at(2024, 4, 29, 9), 8, 3, Some(Frequency::Weekly));
        let (a, u) = match_schedule(&o, at(2024, 5, 1, 12));
        assert!(a.is_none());
        assert_eq!(u.unwrap().start_time, at(2024, 5, 6, 9));
    }

    #[test]
    fn monthly_recurrence() {
        let o = window(at(2024, 1, 15, 0), 24, 2, Some(Frequency::Monthly));
        let (a, _) = match_schedule(&o, at(2024, 6, 15, 10));
        assert_eq!(a.unwrap().start_time, at(2024, 6, 15, 0));
    }

    #[test]
    fn until_time_stops_recurrence() {
        let mut o = window(at(2024, 5, 1, 9), 8, 3, Some(Frequency::Daily));
        o.recurrence.as_mut().unwrap().until_time = Some(at(2024, 5, 3, 0));
        let (a, u) = match_schedule(&o, at(2024, 5, 4, 10));
        assert!(a.is_none() && u.is_none());
        let (a, _) = match_schedule(&o, at(2024, 5, 2, 10));
        assert!(a.is_some());
    }

    #[test]
    fn earliest_starting_active_override_wins() {
        let later = window(at(2024, 5, 1, 10), 8, 7, None);
        let earlier = window(at(2024, 5, 1, 8), 8, 4, None);
        let m = match_overrides(&[later, earlier], at(2024, 5, 1, 12));
        assert_eq!(m.min_replicas, Some(4));
        assert_eq!(m.active.unwrap().start_time, at(2024, 5, 1, 8));
    }

    #[test]
    fn nearest_upcoming_is_reported() {
        let far = window(at(2024, 6, 1, 0), 1, 1, None);
        let near = window(at(2024, 5, 2, 0), 1, 1, None);
        let m = match_overrides(&[far, near], at(2024, 5, 1, 0));
        assert!(m.active.is_none());
        assert_eq!(m.min_replicas, None);
        assert_eq!(m.upcoming.unwrap().start_time, at(2024, 5, 2, 0));
    }
}
