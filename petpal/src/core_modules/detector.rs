// THEORY:
// The engine treats object detection as a black box behind the `Detector`
// trait. Whatever model sits behind it, the `DetectorAdapter` enforces the
// contract the rest of the engine relies on:
//
// - only detections whose class is in the target set and whose confidence
//   clears the threshold come out, even if the model reports every class;
// - inference runs on the blocking pool so a slow model never stalls the
//   async runtime;
// - the frame counts as a "hit" iff at least one qualifying detection exists.

use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Knobs handed to the detector on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub target_classes: Vec<String>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.45,
            nms_threshold: 0.2,
            target_classes: vec!["dog".to_string()],
        }
    }
}

impl DetectionParams {
    pub fn qualifies(&self, detection: &Detection) -> bool {
        detection.confidence >= self.confidence_threshold
            && self
                .target_classes
                .iter()
                .any(|class| class.eq_ignore_ascii_case(&detection.class_name))
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

pub trait Detector: Send {
    fn detect(
        &mut self,
        frame: &RgbImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectError>;
}

/// Serializes calls into a `Detector` and filters its output.
#[derive(Clone)]
pub struct DetectorAdapter {
    detector: Arc<Mutex<Box<dyn Detector>>>,
    params: Arc<DetectionParams>,
}

impl DetectorAdapter {
    pub fn new(detector: Box<dyn Detector>, params: DetectionParams) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
            params: Arc::new(params),
        }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    pub async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<Detection>, DetectError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectError::MalformedFrame("frame has no pixels".into()));
        }

        let detector = Arc::clone(&self.detector);
        let params = Arc::clone(&self.params);
        let raw = tokio::task::spawn_blocking(move || {
            let mut detector = detector.lock().unwrap_or_else(PoisonError::into_inner);
            detector.detect(&frame, &params)
        })
        .await
        .map_err(|e| DetectError::Inference(format!("detector task failed: {e}")))??;

        Ok(raw
            .into_iter()
            .filter(|detection| self.params.qualifies(detection))
            .collect())
    }
}
