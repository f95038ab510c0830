// THEORY:
// The `schedule_clock` module answers the two time questions the engine asks on
// every frame:
//
// 1.  **Has a new calendar day begun?** If so, yesterday's activation flag and
//     event log are cleared in one step so the feeder can fire again today.
// 2.  **Is the feeding window open?** The window opens the second after the
//     configured feeding time and stays open until the date rolls over. There
//     is no wraparound logic: midnight is handled purely by the daily reset.
//
// Wall-clock time is read through the `Clock` trait so the whole engine can be
// driven by a `ManualClock` in tests.

use crate::core_modules::shared_state::{ScheduleState, SharedState};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Canonical rendering of a feeding time, as shown on the control page.
pub const FEEDING_TIME_FORMAT: &str = "%H:%M:%S";

const ACCEPTED_FORMATS: [&str; 2] = [FEEDING_TIME_FORMAT, "%H:%M"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("`{0}` is not a time of day (expected HH:MM:SS)")]
    InvalidFeedingTime(String),
}

/// Parses a user-supplied feeding time. Accepts `HH:MM:SS` and `HH:MM`.
pub fn parse_feeding_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let trimmed = raw.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(trimmed, format).ok())
        .map(|time| time.with_nanosecond(0).unwrap_or(time))
        .ok_or_else(|| ScheduleError::InvalidFeedingTime(trimmed.to_string()))
}

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The host's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Date-boundary and feeding-window decisions over an injectable clock.
#[derive(Clone)]
pub struct ScheduleClock {
    clock: Arc<dyn Clock>,
}

impl ScheduleClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date()
    }

    /// Clears the activation flag and the log when the calendar date differs
    /// from the last reset date. Returns whether anything changed; repeated
    /// calls on the same date are no-ops.
    pub fn check_daily_reset(&self, state: &SharedState) -> bool {
        self.check_daily_reset_at(state, self.now())
    }

    /// `check_daily_reset` against a clock reading the caller already took,
    /// so one loop iteration sees a single date.
    pub fn check_daily_reset_at(&self, state: &SharedState, now: NaiveDateTime) -> bool {
        let today = now.date();
        let changed = state.with_lock(|schedule| schedule.roll_over(today));
        if changed {
            tracing::info!(%today, "new day: activation flag and event log cleared");
        }
        changed
    }

    /// True iff `now`, at whole-second resolution, is strictly after the
    /// configured feeding time.
    pub fn is_feeding_window_open(schedule: &ScheduleState, now: NaiveDateTime) -> bool {
        let time_of_day = now.time();
        let time_of_day = time_of_day.with_nanosecond(0).unwrap_or(time_of_day);
        time_of_day > schedule.feeding_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn parses_both_accepted_formats() {
        assert_eq!(parse_feeding_time("12:00:00").unwrap(), hms(12, 0, 0));
        assert_eq!(parse_feeding_time(" 07:30 ").unwrap(), hms(7, 30, 0));
    }

    #[test]
    fn rejects_garbage_feeding_times() {
        for raw in ["notatime", "25:00:00", "12:61", "", "12:00:00pm"] {
            assert!(matches!(
                parse_feeding_time(raw),
                Err(ScheduleError::InvalidFeedingTime(_))
            ));
        }
    }

    #[test]
    fn window_opens_strictly_after_feeding_time() {
        let schedule = ScheduleState::new(hms(12, 0, 0), at(1, 0, 0, 0).date());
        assert!(!ScheduleClock::is_feeding_window_open(&schedule, at(1, 11, 59, 59)));
        assert!(!ScheduleClock::is_feeding_window_open(&schedule, at(1, 12, 0, 0)));
        assert!(ScheduleClock::is_feeding_window_open(&schedule, at(1, 12, 0, 1)));
        assert!(ScheduleClock::is_feeding_window_open(&schedule, at(1, 23, 59, 59)));
    }

    #[test]
    fn sub_second_precision_does_not_open_the_window_early() {
        let schedule = ScheduleState::new(hms(12, 0, 0), at(1, 0, 0, 0).date());
        let half_past = at(1, 12, 0, 0) + chrono::Duration::milliseconds(500);
        assert!(!ScheduleClock::is_feeding_window_open(&schedule, half_past));
    }

    #[test]
    fn window_does_not_reopen_after_midnight() {
        let schedule = ScheduleState::new(hms(23, 59, 59), at(1, 0, 0, 0).date());
        assert!(!ScheduleClock::is_feeding_window_open(&schedule, at(2, 0, 0, 1)));
    }

    #[test]
    fn daily_reset_is_idempotent_within_a_date() {
        let clock = ManualClock::new(at(1, 8, 0, 0));
        let schedule_clock = ScheduleClock::new(Arc::new(clock.clone()));
        let state = SharedState::new(hms(12, 0, 0), at(1, 0, 0, 0).date());
        state.with_lock(|s| s.mark_activated());

        assert!(!schedule_clock.check_daily_reset(&state));
        assert!(state.snapshot().activated_today);

        clock.set(at(2, 0, 0, 1));
        assert!(schedule_clock.check_daily_reset(&state));
        let after_first = state.snapshot();
        assert!(!after_first.activated_today);
        assert_eq!(after_first.last_reset_date, at(2, 0, 0, 0).date());

        assert!(!schedule_clock.check_daily_reset(&state));
        assert_eq!(state.snapshot(), after_first);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(at(1, 23, 59, 59));
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(clock.now(), at(2, 0, 0, 1));
    }
}
