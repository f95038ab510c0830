// THEORY:
// `SharedState` is the single source of truth for everything that both the
// frame pump and the control surface touch: the feeding time, the daily
// activation flag, the date of the last reset and the event log.
//
// All of it sits behind one lock. Readers get an owned `StateSnapshot`, so a
// page render never observes a half-applied update, and compound mutations
// (daily reset, manual reset, "dispensed + activated") run inside a single
// `with_lock` closure. Nothing outside this module holds a reference into the
// guarded `ScheduleState` past the end of that closure.

use crate::core_modules::actuation::ActuationOrigin;
use crate::core_modules::schedule_clock::{ScheduleError, parse_feeding_time};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Detected { class_name: String },
    Dispensed { origin: ActuationOrigin },
    Fault { message: String },
}

/// One entry in the append-only event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionEvent {
    pub timestamp: NaiveDateTime,
    pub kind: EventKind,
}

impl DetectionEvent {
    pub fn detected(timestamp: NaiveDateTime, class_name: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind: EventKind::Detected {
                class_name: class_name.into(),
            },
        }
    }

    pub fn dispensed(timestamp: NaiveDateTime, origin: ActuationOrigin) -> Self {
        Self {
            timestamp,
            kind: EventKind::Dispensed { origin },
        }
    }

    pub fn fault(timestamp: NaiveDateTime, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind: EventKind::Fault {
                message: message.into(),
            },
        }
    }

    pub fn is_dispensed(&self) -> bool {
        matches!(self.kind, EventKind::Dispensed { .. })
    }

    pub fn is_detected(&self) -> bool {
        matches!(self.kind, EventKind::Detected { .. })
    }
}

impl fmt::Display for DetectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.timestamp.format(LOG_TIMESTAMP_FORMAT);
        match &self.kind {
            EventKind::Detected { class_name } => {
                write!(f, "{} detected at {at}", capitalize(class_name))
            }
            EventKind::Dispensed {
                origin: ActuationOrigin::Scheduled,
            } => write!(f, "Food dispensed at {at}"),
            EventKind::Dispensed {
                origin: ActuationOrigin::Manual,
            } => write!(f, "Food dispensed at {at} (manual)"),
            EventKind::Fault { message } => write!(f, "Feeder fault at {at}: {message}"),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// The guarded schedule. Only reachable through `SharedState::with_lock`.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    feeding_time: NaiveTime,
    last_reset_date: NaiveDate,
    activated_today: bool,
    log: Vec<DetectionEvent>,
}

impl ScheduleState {
    pub fn new(feeding_time: NaiveTime, today: NaiveDate) -> Self {
        Self {
            feeding_time,
            last_reset_date: today,
            activated_today: false,
            log: Vec::new(),
        }
    }

    pub fn feeding_time(&self) -> NaiveTime {
        self.feeding_time
    }

    pub fn last_reset_date(&self) -> NaiveDate {
        self.last_reset_date
    }

    pub fn activated_today(&self) -> bool {
        self.activated_today
    }

    pub fn log(&self) -> &[DetectionEvent] {
        &self.log
    }

    pub fn set_feeding_time(&mut self, feeding_time: NaiveTime) {
        self.feeding_time = feeding_time;
    }

    pub fn mark_activated(&mut self) {
        self.activated_today = true;
    }

    pub fn append(&mut self, event: DetectionEvent) {
        self.log.push(event);
    }

    /// Clears the activation flag and the log together.
    pub fn reset(&mut self) {
        self.activated_today = false;
        self.log.clear();
    }

    /// Daily reset: clears flag and log and records `today` when the date has
    /// changed since the last reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.last_reset_date {
            return false;
        }
        self.reset();
        self.last_reset_date = today;
        true
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            feeding_time: self.feeding_time,
            last_reset_date: self.last_reset_date,
            activated_today: self.activated_today,
            log: self.log.clone(),
        }
    }
}

/// An owned, point-in-time copy of the schedule for rendering and assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub feeding_time: NaiveTime,
    pub last_reset_date: NaiveDate,
    pub activated_today: bool,
    pub log: Vec<DetectionEvent>,
}

impl StateSnapshot {
    pub fn dispensed_count(&self) -> usize {
        self.log.iter().filter(|e| e.is_dispensed()).count()
    }

    pub fn detected_count(&self) -> usize {
        self.log.iter().filter(|e| e.is_detected()).count()
    }
}

#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<ScheduleState>>,
}

impl SharedState {
    pub fn new(feeding_time: NaiveTime, today: NaiveDate) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScheduleState::new(feeding_time, today))),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.with_lock(|schedule| schedule.snapshot())
    }

    /// Runs `mutate` with exclusive access to the schedule. Keep the closure
    /// short: the frame pump and every HTTP handler contend on this lock.
    pub fn with_lock<R>(&self, mutate: impl FnOnce(&mut ScheduleState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        mutate(&mut guard)
    }

    /// Validates and stores a new feeding time. The previous value is kept when
    /// `raw` is not a time of day.
    pub fn set_feeding_time(&self, raw: &str) -> Result<NaiveTime, ScheduleError> {
        let feeding_time = parse_feeding_time(raw)?;
        self.with_lock(|schedule| schedule.set_feeding_time(feeding_time));
        tracing::info!(%feeding_time, "feeding time updated");
        Ok(feeding_time)
    }

    pub fn reset(&self) {
        self.with_lock(ScheduleState::reset);
        tracing::info!("activation flag and event log reset");
    }

    pub fn append(&self, event: DetectionEvent) {
        self.with_lock(|schedule| schedule.append(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn fresh() -> SharedState {
        SharedState::new(
            NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            ts(0, 0, 0).date(),
        )
    }

    #[test]
    fn log_lines_match_the_original_wording() {
        assert_eq!(
            DetectionEvent::detected(ts(12, 0, 1), "dog").to_string(),
            "Dog detected at 2024-05-01 12:00:01"
        );
        assert_eq!(
            DetectionEvent::dispensed(ts(12, 0, 1), ActuationOrigin::Scheduled).to_string(),
            "Food dispensed at 2024-05-01 12:00:01"
        );
        assert_eq!(
            DetectionEvent::dispensed(ts(8, 5, 0), ActuationOrigin::Manual).to_string(),
            "Food dispensed at 2024-05-01 08:05:00 (manual)"
        );
        assert_eq!(
            DetectionEvent::fault(ts(9, 0, 0), "servo stalled").to_string(),
            "Feeder fault at 2024-05-01 09:00:00: servo stalled"
        );
    }

    #[test]
    fn invalid_feeding_time_keeps_previous_value() {
        let state = fresh();
        state.set_feeding_time("12:00:00").unwrap();
        assert!(state.set_feeding_time("notatime").is_err());
        assert_eq!(
            state.snapshot().feeding_time,
            NaiveTime::from_hms_opt(12, 0, 0).unwrap()
        );
    }

    #[test]
    fn reset_clears_flag_and_log_in_one_snapshot() {
        let state = fresh();
        state.with_lock(|s| {
            s.append(DetectionEvent::detected(ts(12, 0, 1), "dog"));
            s.append(DetectionEvent::dispensed(ts(12, 0, 1), ActuationOrigin::Scheduled));
            s.mark_activated();
        });

        state.reset();

        let snapshot = state.snapshot();
        assert!(snapshot.log.is_empty());
        assert!(!snapshot.activated_today);
    }

    #[test]
    fn observers_never_see_a_half_applied_reset() {
        let state = fresh();
        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    state.with_lock(|s| {
                        s.append(DetectionEvent::detected(ts(12, 0, i % 60), "dog"));
                        s.mark_activated();
                    });
                    state.reset();
                }
            })
        };

        for _ in 0..2_000 {
            let snapshot = state.snapshot();
            // Every write pairs a log entry with the flag, and reset clears both.
            assert_eq!(snapshot.activated_today, !snapshot.log.is_empty());
        }
        writer.join().unwrap();
    }

    #[test]
    fn log_keeps_append_order() {
        let state = fresh();
        state.append(DetectionEvent::detected(ts(12, 0, 5), "dog"));
        state.append(DetectionEvent::dispensed(ts(12, 0, 2), ActuationOrigin::Manual));
        let log = state.snapshot().log;
        assert!(log[0].is_detected());
        assert!(log[1].is_dispensed());
    }

    #[test]
    fn roll_over_only_fires_on_a_new_date() {
        let mut schedule = ScheduleState::new(NaiveTime::MIN, ts(0, 0, 0).date());
        schedule.mark_activated();
        assert!(!schedule.roll_over(ts(0, 0, 0).date()));
        assert!(schedule.activated_today());

        let tomorrow = ts(0, 0, 0).date().succ_opt().unwrap();
        assert!(schedule.roll_over(tomorrow));
        assert!(!schedule.activated_today());
        assert_eq!(schedule.last_reset_date(), tomorrow);
    }
}
