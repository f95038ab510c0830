// THEORY:
// This file is the entry point for the `petpal` engine crate. It exposes the
// detection-triggered feeding engine as a small set of cooperating services:
//
// - `core_modules` holds the building blocks: the schedule clock, the shared
//   schedule/log state, the detector adapter, the actuation controller, the
//   capture broker and the stream hub.
// - `pipeline` is the single frame pump that wires those blocks together once
//   per camera frame.
// - `engine` starts the pump and tears everything down in order on shutdown.
//
// Hardware (camera, detector model, servo) and the HTTP surface live in other
// crates and only meet this one through the `FrameSource`, `Detector` and
// `Actuator` traits.

pub mod config;
pub mod core_modules;
pub mod engine;
pub mod pipeline;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{DetectionLogMode, EngineConfig};
pub use core_modules::actuation::{
    ActuationCommand, ActuationConfig, ActuationController, ActuationError, ActuationOrigin,
    ActuationOutcome, Actuator, ActuatorError, ControllerState,
};
pub use core_modules::capture_broker::{CaptureBroker, CaptureError, Frame, FrameSource};
pub use core_modules::detector::{
    BoundingBox, DetectError, Detection, DetectionParams, Detector, DetectorAdapter,
};
pub use core_modules::schedule_clock::{
    Clock, FEEDING_TIME_FORMAT, ManualClock, ScheduleClock, ScheduleError, SystemClock,
    parse_feeding_time,
};
pub use core_modules::shared_state::{
    DetectionEvent, EventKind, ScheduleState, SharedState, StateSnapshot,
};
pub use core_modules::stream_hub::{FramePacket, StreamHub, ViewerSubscription};
pub use engine::{Engine, EngineHandle, EngineStatus, Hardware};
pub use pipeline::{Decision, FramePump, FrameReport, PumpStats, PumpStatsSnapshot};
