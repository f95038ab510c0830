// THEORY:
// The `engine` module assembles the services into a running feeder and owns
// the shutdown order:
//
// 1.  stop the frame pump (no new frames, no new scheduled triggers);
// 2.  wait for an in-flight actuation, or abort it after the timeout, then
//     release the actuator;
// 3.  release the camera;
// 4.  close the stream hub so every viewer's stream ends.
//
// `EngineHandle` is cheap to clone and is what the control surface holds.

use crate::config::EngineConfig;
use crate::core_modules::actuation::{
    ActuationController, ActuationError, ActuationOutcome, Actuator, ControllerState,
};
use crate::core_modules::capture_broker::{CaptureBroker, FrameSource};
use crate::core_modules::detector::{Detector, DetectorAdapter};
use crate::core_modules::schedule_clock::{Clock, ScheduleClock, ScheduleError};
use crate::core_modules::shared_state::{SharedState, StateSnapshot};
use crate::core_modules::stream_hub::{StreamHub, ViewerSubscription};
use crate::pipeline::{FramePump, PumpStats, PumpStatsSnapshot};
use chrono::NaiveTime;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The three external devices the engine drives.
pub struct Hardware {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
    pub actuator: Box<dyn Actuator>,
}

/// Everything the status endpoint reports, read in one go.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub schedule: StateSnapshot,
    pub controller: ControllerState,
    pub viewers: usize,
    pub pump: PumpStatsSnapshot,
}

pub struct Engine;

impl Engine {
    /// Spawns the frame pump. Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig, hardware: Hardware, clock: Arc<dyn Clock>) -> EngineHandle {
        let schedule = ScheduleClock::new(clock);
        let state = SharedState::new(config.default_feeding_time, schedule.today());
        let broker = CaptureBroker::new(hardware.source, schedule.clock());
        let controller = ActuationController::new(
            hardware.actuator,
            state.clone(),
            schedule.clock(),
            config.actuation.clone(),
        );
        let hub = StreamHub::new(config.viewer_buffer);
        let detector = DetectorAdapter::new(hardware.detector, config.detection.clone());
        let shutdown_timeout = config.shutdown_timeout;

        let pump = FramePump::new(
            broker.clone(),
            detector,
            controller.clone(),
            state.clone(),
            schedule,
            hub.clone(),
            Arc::new(config),
        );
        let stats = pump.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let pump_task = tokio::spawn(pump.run(shutdown_rx));

        EngineHandle {
            state,
            controller,
            hub,
            broker,
            stats,
            shutdown_timeout,
            shutdown_tx: Arc::new(shutdown_tx),
            stopped_tx: Arc::new(stopped_tx),
            stopped_rx,
            pump_task: Arc::new(Mutex::new(Some(pump_task))),
            shutdown_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    state: SharedState,
    controller: ActuationController,
    hub: StreamHub,
    broker: CaptureBroker,
    stats: Arc<PumpStats>,
    shutdown_timeout: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    stopped_tx: Arc<watch::Sender<bool>>,
    stopped_rx: watch::Receiver<bool>,
    pump_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_lock: Arc<tokio::sync::Mutex<()>>,
}

impl EngineHandle {
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn set_feeding_time(&self, raw: &str) -> Result<NaiveTime, ScheduleError> {
        self.state.set_feeding_time(raw)
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    pub fn manual_trigger(&self) -> Result<JoinHandle<ActuationOutcome>, ActuationError> {
        self.controller.trigger_manual()
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn subscribe(&self) -> Option<ViewerSubscription> {
        self.hub.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            schedule: self.state.snapshot(),
            controller: self.controller.state(),
            viewers: self.hub.viewer_count(),
            pump: self.stats.snapshot(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped_rx.borrow()
    }

    /// Resolves once `shutdown` has finished releasing the hardware.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped_rx.clone();
        // The sender lives in `self`, so this only ends once the flag flips.
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Stops the pump and releases actuator, camera and viewers, in that
    /// order. Concurrent and repeated calls are safe.
    pub async fn shutdown(&self) {
        let _serialized = self.shutdown_lock.lock().await;
        if self.is_stopped() {
            return;
        }
        tracing::info!("engine shutting down");

        let _ = self.shutdown_tx.send(true);
        let pump_task = self
            .pump_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump_task) = pump_task {
            if let Err(error) = pump_task.await {
                tracing::error!(%error, "frame pump ended abnormally");
            }
        }

        self.controller.shutdown(self.shutdown_timeout).await;
        self.broker.release().await;
        self.hub.close();

        let _ = self.stopped_tx.send(true);
        tracing::info!("engine stopped");
    }
}
