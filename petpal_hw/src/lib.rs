// THEORY:
// `petpal_hw` holds the concrete devices behind the engine's `FrameSource`,
// `Detector` and `Actuator` traits.
//
// - `servo` drives the feeder servo through the Linux sysfs PWM interface.
// - `sim` provides a test-pattern camera, a duty-cycled fake detector and a
//   logging servo so the whole stack runs on a laptop.
// - `camera` and `dnn` (feature `opencv`) capture from a V4L2/USB camera and
//   run the SSD-MobileNet COCO model through OpenCV's DNN module.

pub mod servo;
pub mod sim;

#[cfg(feature = "opencv")]
pub mod camera;
#[cfg(feature = "opencv")]
pub mod dnn;

pub use servo::{ServoConfig, SysfsPwmServo};
pub use sim::{SimulatedDetector, SimulatedServo, TestPatternSource};

#[cfg(feature = "opencv")]
pub use camera::OpenCvCamera;
#[cfg(feature = "opencv")]
pub use dnn::{DnnConfig, DnnDetector};
