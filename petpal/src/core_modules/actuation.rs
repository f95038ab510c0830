// THEORY:
// The `ActuationController` owns the feeder's servo and decides when it moves.
//
// States:
// - `Idle`: nothing running, today's scheduled feeding has not happened.
// - `Activated`: today's feeding has happened (flag set in `SharedState`).
// - `Actuating`: a move-hold-return sequence holds the actuator lock.
//
// Key rules:
// 1.  **One sequence at a time.** The actuator sits behind an async mutex. A
//     trigger takes the lock with `try_lock`; if a sequence is already running
//     the request is rejected with `Busy` instead of interleaving servo
//     commands.
// 2.  **At most one scheduled feeding per day.** A scheduled trigger re-reads
//     the activation flag *after* taking the actuator lock, and a successful
//     sequence sets the flag before releasing it. Two racing scheduled
//     triggers therefore cannot both dispense.
// 3.  **Manual is unconditional.** A manual trigger ignores the window, the
//     detector and the flag, and still sets the flag afterwards.
// 4.  **Faults don't count.** If the servo errors out the sequence aborts, a
//     fault is logged, the flag stays clear and the next trigger may retry.
// 5.  **Never inline.** The dwell is an async sleep inside a spawned task that
//     holds only the actuator lock, and each servo command runs on the
//     blocking pool, so frame production and HTTP handlers keep running while
//     the feeder moves.
// 6.  **A sequence belongs to the day it started.** If the date rolls over
//     while the feeder is moving, the daily reset has already cleared the new
//     day; the finished sequence neither sets the new day's flag nor writes
//     yesterday's entry into the new day's log.

use crate::core_modules::schedule_clock::Clock;
use crate::core_modules::shared_state::{DetectionEvent, SharedState};
use chrono::NaiveDateTime;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationOrigin {
    Scheduled,
    Manual,
}

impl fmt::Display for ActuationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuationOrigin::Scheduled => f.write_str("scheduled"),
            ActuationOrigin::Manual => f.write_str("manual"),
        }
    }
}

/// A request to run the actuation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuationCommand {
    pub origin: ActuationOrigin,
    pub issued_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("actuator fault: {0}")]
    Fault(String),
    #[error("actuator i/o error: {0}")]
    Io(String),
}

/// The physical feeder mechanism. Calls may block; the controller always
/// makes them from the blocking pool.
pub trait Actuator: Send {
    /// Moves to `angle` degrees.
    fn move_to(&mut self, angle: f32) -> Result<(), ActuatorError>;

    /// Stops driving the mechanism. Called once, on shutdown.
    fn release(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuationConfig {
    pub triggered_angle: f32,
    pub neutral_angle: f32,
    pub dwell: Duration,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            triggered_angle: -90.0,
            neutral_angle: 90.0,
            dwell: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActuationError {
    #[error("an actuation sequence is already running")]
    Busy,
    #[error("the feeder has already fired today")]
    AlreadyActivated,
    #[error("the actuator has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActuationOutcome {
    Dispensed(ActuationCommand),
    Faulted {
        command: ActuationCommand,
        error: ActuatorError,
    },
}

impl ActuationOutcome {
    pub fn dispensed(&self) -> bool {
        matches!(self, ActuationOutcome::Dispensed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Activated,
    Actuating,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Activated => "activated",
            ControllerState::Actuating => "actuating",
        }
    }
}

type SharedActuator = Arc<StdMutex<Box<dyn Actuator>>>;

struct ActuatorSlot {
    actuator: SharedActuator,
    shut_down: bool,
}

/// Runs one actuator call on the blocking pool.
async fn on_actuator<F>(actuator: &SharedActuator, call: F) -> Result<(), ActuatorError>
where
    F: FnOnce(&mut dyn Actuator) -> Result<(), ActuatorError> + Send + 'static,
{
    let actuator = Arc::clone(actuator);
    tokio::task::spawn_blocking(move || {
        let mut actuator = actuator.lock().unwrap_or_else(PoisonError::into_inner);
        call(&mut **actuator)
    })
    .await
    .unwrap_or_else(|e| Err(ActuatorError::Fault(format!("actuator task failed: {e}"))))
}

#[derive(Clone)]
pub struct ActuationController {
    slot: Arc<Mutex<ActuatorSlot>>,
    in_flight: Arc<StdMutex<Option<AbortHandle>>>,
    state: SharedState,
    clock: Arc<dyn Clock>,
    config: Arc<ActuationConfig>,
}

impl ActuationController {
    pub fn new(
        actuator: Box<dyn Actuator>,
        state: SharedState,
        clock: Arc<dyn Clock>,
        config: ActuationConfig,
    ) -> Self {
        Self {
            slot: Arc::new(Mutex::new(ActuatorSlot {
                actuator: Arc::new(StdMutex::new(actuator)),
                shut_down: false,
            })),
            in_flight: Arc::new(StdMutex::new(None)),
            state,
            clock,
            config: Arc::new(config),
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.slot.try_lock().is_err() {
            return ControllerState::Actuating;
        }
        if self.state.with_lock(|schedule| schedule.activated_today()) {
            ControllerState::Activated
        } else {
            ControllerState::Idle
        }
    }

    /// Scheduled path: the caller has already seen an open window and a
    /// detection hit. Rejected when today's feeding already happened.
    pub fn trigger_scheduled(&self) -> Result<JoinHandle<ActuationOutcome>, ActuationError> {
        self.trigger(ActuationOrigin::Scheduled)
    }

    /// Manual path: runs regardless of window, detection or activation flag.
    pub fn trigger_manual(&self) -> Result<JoinHandle<ActuationOutcome>, ActuationError> {
        self.trigger(ActuationOrigin::Manual)
    }

    /// Takes the actuator lock and spawns the sequence. Must be called from
    /// within a tokio runtime.
    pub fn trigger(
        &self,
        origin: ActuationOrigin,
    ) -> Result<JoinHandle<ActuationOutcome>, ActuationError> {
        let slot = Arc::clone(&self.slot)
            .try_lock_owned()
            .map_err(|_| ActuationError::Busy)?;
        if slot.shut_down {
            return Err(ActuationError::ShutDown);
        }
        if origin == ActuationOrigin::Scheduled
            && self.state.with_lock(|schedule| schedule.activated_today())
        {
            return Err(ActuationError::AlreadyActivated);
        }

        let command = ActuationCommand {
            origin,
            issued_at: self.clock.now(),
        };
        tracing::info!(%origin, "actuation sequence starting");

        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.run_sequence(slot, command).await });
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
        Ok(handle)
    }

    async fn run_sequence(
        &self,
        slot: OwnedMutexGuard<ActuatorSlot>,
        command: ActuationCommand,
    ) -> ActuationOutcome {
        match self.drive(&slot).await {
            Ok(()) => {
                let same_day = self.state.with_lock(|schedule| {
                    if schedule.last_reset_date() != command.issued_at.date() {
                        return false;
                    }
                    schedule.append(DetectionEvent::dispensed(command.issued_at, command.origin));
                    schedule.mark_activated();
                    true
                });
                if same_day {
                    tracing::info!(origin = %command.origin, "food dispensed");
                } else {
                    tracing::warn!(
                        origin = %command.origin,
                        issued_at = %command.issued_at,
                        "food dispensed across midnight, not counted for the new day"
                    );
                }
                ActuationOutcome::Dispensed(command)
            }
            Err(error) => {
                let neutral = self.config.neutral_angle;
                if let Err(park_error) =
                    on_actuator(&slot.actuator, move |actuator| actuator.move_to(neutral)).await
                {
                    tracing::warn!(error = %park_error, "could not return feeder to neutral");
                }
                self.state
                    .append(DetectionEvent::fault(self.clock.now(), error.to_string()));
                tracing::warn!(origin = %command.origin, %error, "actuation aborted");
                ActuationOutcome::Faulted { command, error }
            }
        }
    }

    async fn drive(&self, slot: &ActuatorSlot) -> Result<(), ActuatorError> {
        let (triggered, neutral) = (self.config.triggered_angle, self.config.neutral_angle);
        on_actuator(&slot.actuator, move |actuator| actuator.move_to(triggered)).await?;
        tokio::time::sleep(self.config.dwell).await;
        on_actuator(&slot.actuator, move |actuator| actuator.move_to(neutral)).await
    }

    /// Waits up to `timeout` for a running sequence, aborts it if it is still
    /// going, then releases the actuator. Later triggers fail with `ShutDown`.
    pub async fn shutdown(&self, timeout: Duration) {
        let waited = tokio::time::timeout(timeout, Arc::clone(&self.slot).lock_owned()).await;
        let (mut slot, aborted) = match waited {
            Ok(slot) => (slot, false),
            Err(_) => {
                tracing::warn!(?timeout, "actuation still running at shutdown, aborting it");
                let in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(handle) = in_flight {
                    handle.abort();
                }
                (Arc::clone(&self.slot).lock_owned().await, true)
            }
        };

        if slot.shut_down {
            return;
        }
        slot.shut_down = true;
        if aborted {
            let neutral = self.config.neutral_angle;
            if let Err(error) =
                on_actuator(&slot.actuator, move |actuator| actuator.move_to(neutral)).await
            {
                tracing::warn!(%error, "could not return feeder to neutral");
            }
        }
        match on_actuator(&slot.actuator, |actuator| actuator.release()).await {
            Ok(()) => tracing::info!("actuator released"),
            Err(error) => tracing::error!(%error, "actuator release failed"),
        }
    }
}
