//! Job scheduling math
//!
//! Interval jobs advance `next_run` by a fixed duration; weekly-scheduled
//! jobs advance to the earliest `(day_of_week, time_of_day)` slot strictly in
//! the future, evaluated in UTC. Monday is day 1.

use chrono::{DateTime, Datelike, Days, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::JobType;

/// One weekly slot of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// ISO day of week, Monday = 1 through Sunday = 7
    pub day_of_week: u8,
    pub time_of_day: NaiveTime,
}

impl ScheduleEntry {
    pub fn new(day_of_week: u8, time_of_day: NaiveTime) -> Self {
        Self {
            day_of_week,
            time_of_day,
        }
    }

    /// The earliest occurrence of this slot strictly after `now`, in UTC
    fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.weekday().number_from_monday() as i64;
        let days_ahead = (self.day_of_week as i64 - today).rem_euclid(7) as u64;
        let candidate = (now.date_naive() + Days::new(days_ahead))
            .and_time(self.time_of_day)
            .and_utc();
        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(7)
        }
    }
}

/// Validate a weekly schedule: non-empty, all days in 1..=7, no duplicates
pub fn validate_schedule(entries: &[ScheduleEntry]) -> Result<(), ScheduleError> {
    if entries.is_empty() {
        return Err(ScheduleError::Empty);
    }
    for (i, entry) in entries.iter().enumerate() {
        if !(1..=7).contains(&entry.day_of_week) {
            return Err(ScheduleError::DayOutOfRange(entry.day_of_week));
        }
        if entries[..i].contains(entry) {
            return Err(ScheduleError::DuplicateEntry {
                day_of_week: entry.day_of_week,
                time_of_day: entry.time_of_day,
            });
        }
    }
    Ok(())
}

/// The earliest weekly slot strictly after `now` across all entries
pub fn next_run_weekly(
    now: DateTime<Utc>,
    entries: &[ScheduleEntry],
) -> Result<DateTime<Utc>, ScheduleError> {
    validate_schedule(entries)?;
    entries
        .iter()
        .map(|entry| entry.next_occurrence(now))
        .min()
        .ok_or(ScheduleError::Empty)
}

/// How a job computes its next run: exactly one of interval or weekly schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPlan {
    Interval(Duration),
    Weekly(Vec<ScheduleEntry>),
}

impl JobPlan {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Interval(_) => JobType::Interval,
            Self::Weekly(_) => JobType::Scheduled,
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Interval(interval) => {
                if *interval <= Duration::zero() {
                    return Err(ScheduleError::NonPositiveInterval);
                }
                Ok(())
            }
            Self::Weekly(entries) => validate_schedule(entries),
        }
    }

    /// Advance a job's `next_run` after firing.
    ///
    /// Interval jobs step from the previous `next_run` so slots stay anchored;
    /// weekly jobs take the schedule function's absolute result.
    pub fn advance(
        &self,
        previous_next_run: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Self::Interval(interval) => Ok(previous_next_run + *interval),
            Self::Weekly(entries) => next_run_weekly(now, entries),
        }
    }
}

/// Schedule and interval validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("job schedule must not be empty")]
    Empty,

    #[error("day of week {0} outside 1..=7")]
    DayOutOfRange(u8),

    #[error("duplicate schedule entry: day {day_of_week} at {time_of_day}")]
    DuplicateEntry {
        day_of_week: u8,
        time_of_day: NaiveTime,
    },

    #[error("job interval must be positive")]
    NonPositiveInterval,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wednesday_noon() -> DateTime<Utc> {
        // 2024-01-03 is a Wednesday
        Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()
    }

    fn midnight() -> NaiveTime {
        NaiveTime::from_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_next_run_weekly_picks_earliest_future_slot() {
        // Monday and Tuesday at midnight, evaluated on a Wednesday:
        // both slots this week are in the past, so next Monday wins.
        let entries = vec![
            ScheduleEntry::new(1, midnight()),
            ScheduleEntry::new(2, midnight()),
        ];
        let next = next_run_weekly(wednesday_noon(), &entries).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_weekly_same_day_future_time() {
        let entries = vec![ScheduleEntry::new(
            3,
            NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
        )];
        let next = next_run_weekly(wednesday_noon(), &entries).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 3, 18, 30, 0).unwrap());
    }

    #[test]
    fn test_next_run_weekly_same_day_past_time_wraps_a_week() {
        let entries = vec![ScheduleEntry::new(
            3,
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        )];
        let next = next_run_weekly(wednesday_noon(), &entries).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_weekly_exact_now_is_not_returned() {
        // A slot equal to `now` is not "strictly in the future".
        let entries = vec![ScheduleEntry::new(
            3,
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        )];
        let next = next_run_weekly(wednesday_noon(), &entries).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_validate_schedule_rejects_bad_input() {
        assert_eq!(validate_schedule(&[]), Err(ScheduleError::Empty));
        assert_eq!(
            validate_schedule(&[ScheduleEntry::new(8, midnight())]),
            Err(ScheduleError::DayOutOfRange(8))
        );
        assert_eq!(
            validate_schedule(&[ScheduleEntry::new(0, midnight())]),
            Err(ScheduleError::DayOutOfRange(0))
        );
        let dup = ScheduleEntry::new(2, midnight());
        assert!(matches!(
            validate_schedule(&[dup, dup]),
            Err(ScheduleError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_interval_plan_advances_from_previous_slot() {
        let plan = JobPlan::Interval(Duration::hours(6));
        let previous = wednesday_noon();
        let next = plan.advance(previous, wednesday_noon()).unwrap();
        assert_eq!(next, previous + Duration::hours(6));
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        assert_eq!(
            JobPlan::Interval(Duration::zero()).validate(),
            Err(ScheduleError::NonPositiveInterval)
        );
        assert_eq!(
            JobPlan::Interval(Duration::seconds(-1)).validate(),
            Err(ScheduleError::NonPositiveInterval)
        );
        assert!(JobPlan::Interval(Duration::minutes(5)).validate().is_ok());
    }
}
