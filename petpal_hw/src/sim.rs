//! Stand-in devices for running without a camera, a model or a servo.

use image::{Rgb, RgbImage};
use petpal::{
    Actuator, ActuatorError, BoundingBox, CaptureError, DetectError, Detection, DetectionParams,
    Detector, FrameSource,
};
use std::time::Duration;

const SQUARE: u32 = 96;

/// A gradient background with a bright square sweeping across it, paced like
/// a real camera.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_period: Duration,
    tick: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_period: Duration::from_millis(1000 / u64::from(fps.max(1))),
            tick: 0,
        }
    }

    /// Where the sweeping square is on frame `tick`.
    pub fn square_at(&self, tick: u32) -> BoundingBox {
        let travel = self.width.saturating_sub(SQUARE).max(1);
        BoundingBox {
            x: (tick.wrapping_mul(8) % travel) as i32,
            y: (self.height.saturating_sub(SQUARE) / 2) as i32,
            width: SQUARE.min(self.width),
            height: SQUARE.min(self.height),
        }
    }
}

impl FrameSource for TestPatternSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        std::thread::sleep(self.frame_period);
        let square = self.square_at(self.tick);
        self.tick = self.tick.wrapping_add(1);

        let (width, height) = (self.width, self.height);
        Ok(RgbImage::from_fn(width, height, |x, y| {
            let inside = x as i32 >= square.x
                && (x as i32) < square.x + square.width as i32
                && y as i32 >= square.y
                && (y as i32) < square.y + square.height as i32;
            if inside {
                Rgb([240, 220, 180])
            } else {
                Rgb([
                    (x * 255 / width.max(1)) as u8,
                    (y * 255 / height.max(1)) as u8,
                    96,
                ])
            }
        }))
    }
}

/// Reports a dog for `visible_frames` out of every `cycle_frames` frames.
pub struct SimulatedDetector {
    visible_frames: u32,
    cycle_frames: u32,
    tick: u32,
}

impl SimulatedDetector {
    pub fn new(visible_frames: u32, cycle_frames: u32) -> Self {
        Self {
            visible_frames,
            cycle_frames: cycle_frames.max(1),
            tick: 0,
        }
    }
}

impl Default for SimulatedDetector {
    fn default() -> Self {
        // About three seconds of dog every thirty at 30 fps.
        Self::new(90, 900)
    }
}

impl Detector for SimulatedDetector {
    fn detect(
        &mut self,
        frame: &RgbImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, DetectError> {
        let phase = self.tick % self.cycle_frames;
        self.tick = self.tick.wrapping_add(1);
        if phase >= self.visible_frames {
            return Ok(Vec::new());
        }

        let class_name = params
            .target_classes
            .first()
            .cloned()
            .unwrap_or_else(|| "dog".to_string());
        Ok(vec![Detection {
            class_name,
            confidence: 0.9,
            bbox: BoundingBox {
                x: (frame.width() / 4) as i32,
                y: (frame.height() / 4) as i32,
                width: frame.width() / 2,
                height: frame.height() / 2,
            },
        }])
    }
}

/// Logs servo commands instead of driving a pin.
#[derive(Debug, Default)]
pub struct SimulatedServo {
    angle: Option<f32>,
}

impl SimulatedServo {
    pub fn angle(&self) -> Option<f32> {
        self.angle
    }
}

impl Actuator for SimulatedServo {
    fn move_to(&mut self, angle: f32) -> Result<(), ActuatorError> {
        tracing::info!(angle, "simulated servo move");
        self.angle = Some(angle);
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        tracing::info!("simulated servo released");
        Ok(())
    }
}
