// Trigger construction and fire time calculation
//
// Supports three trigger kinds: Interval, Cron and Date. Each is a pure
// function from (previous fire time, now) to the next fire time.

use crate::errors::TriggerError;
use crate::models::Trigger;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Longest accepted interval: one thousand years
pub const MAX_INTERVAL_SECONDS: u64 = 1000 * 366 * 24 * 60 * 60;

/// FireTimeCalculator defines how a trigger computes its next fire time
pub trait FireTimeCalculator {
    /// Next fire time strictly after `previous` (or the first fire time at or
    /// after `now` when there is no previous fire). `None` means the trigger
    /// is exhausted.
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError>;

    /// Latest fire time reachable from the due fire `first` that is still at
    /// or before `now`. Returns `first` when no later fire is due.
    fn last_due_fire_time(
        &self,
        first: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TriggerError>;
}

fn interval_delta(interval_seconds: u64) -> Result<Duration, TriggerError> {
    if interval_seconds == 0 {
        return Err(TriggerError::InvalidConfiguration(
            "interval must be at least one second".to_string(),
        ));
    }
    if interval_seconds > MAX_INTERVAL_SECONDS {
        return Err(TriggerError::InvalidConfiguration(format!(
            "interval of {interval_seconds}s exceeds the maximum of {MAX_INTERVAL_SECONDS}s"
        )));
    }
    i64::try_from(interval_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            TriggerError::InvalidConfiguration(format!("interval of {interval_seconds}s is out of range"))
        })
}

fn shift(time: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, TriggerError> {
    time.checked_add_signed(by).ok_or_else(|| {
        TriggerError::InvalidConfiguration(format!("fire time {time} + {by} is out of range"))
    })
}

impl Trigger {
    /// Interval trigger whose first fire is one interval from now
    pub fn interval(every: std::time::Duration) -> Result<Self, TriggerError> {
        let start_date = shift(Utc::now(), interval_delta(every.as_secs())?)?;
        Self::interval_from(start_date, every)
    }

    /// Interval trigger aligned on `start_date`
    pub fn interval_from(
        start_date: DateTime<Utc>,
        every: std::time::Duration,
    ) -> Result<Self, TriggerError> {
        let trigger = Trigger::Interval {
            interval_seconds: every.as_secs(),
            start_date,
            end_date: None,
        };
        trigger.validate()?;
        Ok(trigger)
    }

    /// Cron trigger evaluated in `timezone`
    pub fn cron(expression: &str, timezone: &str) -> Result<Self, TriggerError> {
        let timezone = parse_timezone(timezone)?;
        let trigger = Trigger::Cron {
            expression: expression.to_string(),
            timezone,
            start_date: None,
            end_date: None,
        };
        trigger.validate()?;
        Ok(trigger)
    }

    /// One-shot trigger
    pub fn date(run_date: DateTime<Utc>) -> Self {
        Trigger::Date { run_date }
    }

    /// Stop firing after `end` (interval and cron triggers only)
    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        match &mut self {
            Trigger::Interval { end_date, .. } | Trigger::Cron { end_date, .. } => {
                *end_date = Some(end)
            }
            Trigger::Date { .. } => {}
        }
        self
    }

    /// Do not fire before `start` (cron triggers only; interval triggers carry their own start)
    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        if let Trigger::Cron { start_date, .. } = &mut self {
            *start_date = Some(start);
        }
        self
    }

    /// Short kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval { .. } => "interval",
            Trigger::Cron { .. } => "cron",
            Trigger::Date { .. } => "date",
        }
    }

    /// Check trigger parameters
    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            Trigger::Interval {
                interval_seconds,
                start_date,
                end_date,
            } => {
                interval_delta(*interval_seconds)?;
                if matches!(end_date, Some(end) if end < start_date) {
                    return Err(TriggerError::InvalidConfiguration(
                        "end_date precedes start_date".to_string(),
                    ));
                }
                Ok(())
            }
            Trigger::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
            Trigger::Date { .. } => Ok(()),
        }
    }
}

impl FireTimeCalculator for Trigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::Interval {
                interval_seconds,
                start_date,
                end_date,
            } => calculate_interval_next_fire(
                *interval_seconds,
                *start_date,
                *end_date,
                previous,
                now,
            ),

            Trigger::Cron {
                expression,
                timezone,
                start_date,
                end_date,
            } => calculate_cron_next_fire(expression, *timezone, *start_date, *end_date, previous, now),

            Trigger::Date { run_date } => Ok(match previous {
                Some(_) => None,
                None => Some(*run_date),
            }),
        }
    }

    fn last_due_fire_time(
        &self,
        first: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TriggerError> {
        match self {
            Trigger::Interval {
                interval_seconds,
                end_date,
                ..
            } => {
                let interval = interval_delta(*interval_seconds)?;
                let bound = end_date.map_or(now, |end| end.min(now));
                if bound <= first {
                    return Ok(first);
                }
                let periods = (bound - first).num_seconds() / interval.num_seconds();
                let offset = periods
                    .checked_mul(interval.num_seconds())
                    .and_then(Duration::try_seconds)
                    .ok_or_else(|| {
                        TriggerError::InvalidConfiguration("interval backlog is out of range".to_string())
                    })?;
                shift(first, offset)
            }

            Trigger::Cron {
                expression,
                timezone,
                end_date,
                ..
            } => {
                let schedule = parse_cron_expression(expression)?;
                let bound = end_date.map_or(now, |end| end.min(now));
                let last = schedule
                    .after(&first.with_timezone(timezone))
                    .map(|next| next.with_timezone(&Utc))
                    .take_while(|next| *next <= bound)
                    .last();
                Ok(last.map_or(first, |last| last.max(first)))
            }

            Trigger::Date { .. } => Ok(first),
        }
    }
}

/// Parse and validate a cron expression
///
/// Expressions carry a leading seconds field, e.g. `0 */5 * * * *`.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, TriggerError> {
    CronSchedule::from_str(expression).map_err(|e| TriggerError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, TriggerError> {
    Tz::from_str(name).map_err(|_| TriggerError::InvalidTimezone(name.to_string()))
}

/// Interval fires stay on the grid `start_date + k * interval`.
///
/// Without a previous fire, the first grid point at or after `now` is used so
/// a job registered long after its start date does not replay the gap.
fn calculate_interval_next_fire(
    interval_seconds: u64,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    let interval = interval_delta(interval_seconds)?;

    let next = match previous {
        Some(previous) => shift(previous, interval)?,
        None if start_date > now => start_date,
        None => {
            let elapsed_ms = (now - start_date).num_milliseconds();
            let interval_ms = interval.num_milliseconds();
            let periods = elapsed_ms / interval_ms + i64::from(elapsed_ms % interval_ms != 0);
            let offset = periods
                .checked_mul(interval_ms)
                .and_then(Duration::try_milliseconds)
                .ok_or_else(|| {
                    TriggerError::InvalidConfiguration("interval grid is out of range".to_string())
                })?;
            shift(start_date, offset)?
        }
    };

    Ok(match end_date {
        Some(end) if next > end => None,
        _ => Some(next),
    })
}

/// Cron fires are computed in the trigger's timezone and converted back to UTC.
///
/// With a previous fire, every slot after it is enumerated even when it is
/// already in the past; the dispatch loop applies the misfire policy.
fn calculate_cron_next_fire(
    expression: &str,
    timezone: Tz,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    let schedule = parse_cron_expression(expression)?;

    // Exclusive lower bound for the search
    let after = match previous {
        Some(previous) => previous.min(now - Duration::microseconds(1)),
        None => start_date.map_or(now, |start| start.max(now)) - Duration::microseconds(1),
    };

    let next = schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|next| next.with_timezone(&Utc));

    Ok(match (next, end_date) {
        (Some(next), Some(end)) if next > end => None,
        (next, _) => next,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn every(seconds: u64) -> std::time::Duration {
        std::time::Duration::from_secs(seconds)
    }

    #[test]
    fn test_parse_valid_cron_expression() {
        assert!(parse_cron_expression("0 0 12 * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        assert!(matches!(
            Trigger::cron("0 0 12 * * *", "Mars/Olympus"),
            Err(TriggerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Trigger::interval_from(at(0, 0, 0), every(0)).is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        assert!(Trigger::interval_from(at(0, 0, 0), every(u64::MAX / 2)).is_err());
        assert!(Trigger::interval_from(at(0, 0, 0), every(u64::MAX)).is_err());
        assert!(Trigger::interval(every(MAX_INTERVAL_SECONDS + 1)).is_err());
        assert!(Trigger::interval_from(at(0, 0, 0), every(MAX_INTERVAL_SECONDS)).is_ok());
    }

    #[test]
    fn test_unvalidated_huge_interval_errors_instead_of_panicking() {
        let trigger = Trigger::Interval {
            interval_seconds: u64::MAX,
            start_date: at(0, 0, 0),
            end_date: None,
        };
        assert!(trigger.next_fire_time(Some(at(0, 0, 0)), at(0, 0, 0)).is_err());
        assert!(trigger.next_fire_time(None, at(1, 0, 0)).is_err());
        assert!(trigger.last_due_fire_time(at(0, 0, 0), at(1, 0, 0)).is_err());
    }

    #[test]
    fn test_next_fire_past_representable_range_is_error() {
        let trigger = Trigger::interval_from(at(0, 0, 0), every(MAX_INTERVAL_SECONDS)).unwrap();
        assert!(trigger
            .next_fire_time(Some(DateTime::<Utc>::MAX_UTC - Duration::days(1)), at(0, 0, 0))
            .is_err());
    }

    #[test]
    fn test_last_due_fire_time_jumps_to_latest_grid_point() {
        let trigger = Trigger::interval_from(at(0, 0, 0), every(1)).unwrap();
        let now = at(0, 0, 0) + Duration::days(365);
        assert_eq!(trigger.last_due_fire_time(at(0, 0, 0), now).unwrap(), now);

        let trigger = Trigger::interval_from(at(12, 0, 0), every(10)).unwrap();
        assert_eq!(
            trigger.last_due_fire_time(at(12, 0, 0), at(12, 0, 45)).unwrap(),
            at(12, 0, 40)
        );
        assert_eq!(
            trigger.last_due_fire_time(at(12, 0, 0), at(12, 0, 5)).unwrap(),
            at(12, 0, 0)
        );
    }

    #[test]
    fn test_last_due_fire_time_respects_end_date() {
        let trigger = Trigger::interval_from(at(12, 0, 0), every(10))
            .unwrap()
            .with_end_date(at(12, 0, 25));
        assert_eq!(
            trigger.last_due_fire_time(at(12, 0, 0), at(13, 0, 0)).unwrap(),
            at(12, 0, 20)
        );
    }

    #[test]
    fn test_cron_last_due_fire_time() {
        let trigger = Trigger::cron("0 */5 * * * *", "UTC").unwrap();
        assert_eq!(
            trigger.last_due_fire_time(at(10, 5, 0), at(10, 32, 0)).unwrap(),
            at(10, 30, 0)
        );
        assert_eq!(
            Trigger::date(at(9, 0, 0))
                .last_due_fire_time(at(9, 0, 0), at(10, 0, 0))
                .unwrap(),
            at(9, 0, 0)
        );
    }

    #[test]
    fn test_interval_first_fire_is_start_date_when_in_future() {
        let trigger = Trigger::interval_from(at(12, 0, 0), every(10)).unwrap();
        let next = trigger.next_fire_time(None, at(11, 0, 0)).unwrap();
        assert_eq!(next, Some(at(12, 0, 0)));
    }

    #[test]
    fn test_interval_first_fire_snaps_to_grid() {
        let trigger = Trigger::interval_from(at(12, 0, 0), every(10)).unwrap();
        let next = trigger.next_fire_time(None, at(12, 0, 25)).unwrap();
        assert_eq!(next, Some(at(12, 0, 30)));
    }

    #[test]
    fn test_interval_subsequent_fire_is_relative_to_previous() {
        let trigger = Trigger::interval_from(at(12, 0, 0), every(60)).unwrap();
        let next = trigger
            .next_fire_time(Some(at(12, 0, 0)), at(12, 0, 20))
            .unwrap();
        assert_eq!(next, Some(at(12, 1, 0)));
    }

    #[test]
    fn test_interval_respects_end_date() {
        let trigger = Trigger::interval_from(at(12, 0, 0), every(60))
            .unwrap()
            .with_end_date(at(12, 0, 30));
        let next = trigger
            .next_fire_time(Some(at(12, 0, 0)), at(12, 0, 0))
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_date_fires_once() {
        let trigger = Trigger::date(at(9, 0, 0));
        assert_eq!(
            trigger.next_fire_time(None, at(8, 0, 0)).unwrap(),
            Some(at(9, 0, 0))
        );
        assert_eq!(
            trigger.next_fire_time(Some(at(9, 0, 0)), at(9, 0, 1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_cron_first_fire_at_or_after_now() {
        let trigger = Trigger::cron("0 */5 * * * *", "UTC").unwrap();
        assert_eq!(
            trigger.next_fire_time(None, at(10, 2, 0)).unwrap(),
            Some(at(10, 5, 0))
        );
        assert_eq!(
            trigger.next_fire_time(None, at(10, 5, 0)).unwrap(),
            Some(at(10, 5, 0))
        );
    }

    #[test]
    fn test_cron_enumerates_missed_slots_after_previous() {
        let trigger = Trigger::cron("0 */5 * * * *", "UTC").unwrap();
        let next = trigger
            .next_fire_time(Some(at(10, 5, 0)), at(10, 30, 0))
            .unwrap();
        assert_eq!(next, Some(at(10, 10, 0)));
    }

    #[test]
    fn test_cron_evaluated_in_timezone() {
        // Noon in Ho Chi Minh City is 05:00 UTC
        let trigger = Trigger::cron("0 0 12 * * *", "Asia/Ho_Chi_Minh").unwrap();
        let next = trigger.next_fire_time(None, at(0, 0, 0)).unwrap();
        assert_eq!(next, Some(at(5, 0, 0)));
    }

    #[test]
    fn test_cron_with_end_date_in_past() {
        let trigger = Trigger::cron("0 0 12 * * *", "UTC")
            .unwrap()
            .with_end_date(at(0, 0, 0) - Duration::days(1));
        assert_eq!(trigger.next_fire_time(None, at(0, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_cron_start_date_delays_first_fire() {
        let trigger = Trigger::cron("0 0 * * * *", "UTC")
            .unwrap()
            .with_start_date(at(15, 30, 0));
        assert_eq!(
            trigger.next_fire_time(None, at(10, 0, 0)).unwrap(),
            Some(at(16, 0, 0))
        );
    }
}
