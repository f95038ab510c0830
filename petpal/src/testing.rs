//! In-memory stand-ins for the camera, the detector and the servo.
//!
//! Each double comes with a cloneable handle so a test can steer it (queue
//! detections, inject faults) and inspect what the engine did with it.

use crate::core_modules::actuation::{Actuator, ActuatorError};
use crate::core_modules::capture_broker::{CaptureError, FrameSource};
use crate::core_modules::detector::{BoundingBox, DetectError, Detection, DetectionParams, Detector};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A qualifying "dog" detection in the middle of a 640x480 frame.
pub fn dog(confidence: f32) -> Detection {
    Detection {
        class_name: "dog".to_string(),
        confidence,
        bbox: BoundingBox {
            x: 200,
            y: 150,
            width: 160,
            height: 120,
        },
    }
}

/// Returns the same solid-colour frame forever, optionally failing first.
pub struct StaticSource {
    width: u32,
    height: u32,
    failures_left: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct SourceProbe {
    failures_left: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl StaticSource {
    pub fn new(width: u32, height: u32) -> (Self, SourceProbe) {
        let probe = SourceProbe {
            failures_left: Arc::new(AtomicUsize::new(0)),
            captures: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let source = Self {
            width,
            height,
            failures_left: Arc::clone(&probe.failures_left),
            captures: Arc::clone(&probe.captures),
            stopped: Arc::clone(&probe.stopped),
        };
        (source, probe)
    }
}

impl FrameSource for StaticSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CaptureError::Read("scripted camera failure".into()));
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(RgbImage::from_pixel(self.width, self.height, Rgb([90, 120, 60])))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl SourceProbe {
    pub fn fail_next_captures(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

type Scripted = Result<Vec<Detection>, DetectError>;

/// Plays back queued results, then repeats a steady-state answer.
pub struct ScriptedDetector {
    script: DetectorScript,
}

#[derive(Clone)]
pub struct DetectorScript {
    queue: Arc<Mutex<VecDeque<Scripted>>>,
    steady: Arc<Mutex<Vec<Detection>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new() -> (Self, DetectorScript) {
        let script = DetectorScript {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            steady: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        (
            Self {
                script: script.clone(),
            },
            script,
        )
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &mut self,
        _frame: &RgbImage,
        _params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self
            .script
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match queued {
            Some(result) => result,
            None => Ok(self
                .script
                .steady
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }
}

impl DetectorScript {
    pub fn push(&self, detections: Vec<Detection>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(detections));
    }

    pub fn push_failure(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(DetectError::Inference("scripted detector failure".into())));
    }

    /// What every frame reports once the queue is empty.
    pub fn set_steady(&self, detections: Vec<Detection>) {
        *self.steady.lock().unwrap_or_else(PoisonError::into_inner) = detections;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Records every commanded angle and can be told to fault.
pub struct RecordingActuator {
    probe: ActuatorProbe,
}

#[derive(Clone)]
pub struct ActuatorProbe {
    moves: Arc<Mutex<Vec<f32>>>,
    failures_left: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl RecordingActuator {
    pub fn new() -> (Self, ActuatorProbe) {
        let probe = ActuatorProbe {
            moves: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_concurrent: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        };
        (
            Self {
                probe: probe.clone(),
            },
            probe,
        )
    }
}

impl Actuator for RecordingActuator {
    fn move_to(&mut self, angle: f32) -> Result<(), ActuatorError> {
        let failing = self
            .probe
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ActuatorError::Fault("scripted servo fault".into()));
        }

        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.probe
            .moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(angle);
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.probe.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ActuatorProbe {
    pub fn moves(&self) -> Vec<f32> {
        self.moves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Completed move-hold-return sequences, counted as returns to neutral.
    pub fn sequences(&self, neutral: f32) -> usize {
        self.moves().iter().filter(|angle| **angle == neutral).count()
    }

    pub fn fail_next_moves(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
