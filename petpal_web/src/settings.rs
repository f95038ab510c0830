use chrono::NaiveTime;
use clap::{Parser, ValueEnum};
use petpal::{
    ActuationConfig, DetectionLogMode, DetectionParams, EngineConfig, Hardware,
    parse_feeding_time,
};
use petpal_hw::{ServoConfig, SimulatedDetector, SimulatedServo, TestPatternSource};
use std::path::PathBuf;
use std::time::Duration;

use crate::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Test-pattern camera, duty-cycled fake detector and a logging servo.
    Sim,
    /// OpenCV camera and detector with a sysfs PWM servo.
    Hardware,
}

/// Command-line and `PETPAL_*` environment settings.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "petpal",
    about = "Camera-watched pet feeder that fires at most once a day",
    version
)]
pub struct Settings {
    /// Address the control page is served on
    #[arg(long, env = "PETPAL_BIND", default_value = "0.0.0.0:5000")]
    pub bind: String,

    #[arg(long, env = "PETPAL_BACKEND", value_enum, default_value_t = Backend::Sim)]
    pub backend: Backend,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "PETPAL_LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,

    #[arg(long, env = "PETPAL_CAMERA_INDEX", default_value_t = 0)]
    pub camera_index: i32,

    #[arg(long, env = "PETPAL_CAPTURE_WIDTH", default_value_t = 640)]
    pub capture_width: u32,

    #[arg(long, env = "PETPAL_CAPTURE_HEIGHT", default_value_t = 480)]
    pub capture_height: u32,

    #[arg(long, env = "PETPAL_CONFIDENCE", default_value_t = 0.45)]
    pub confidence_threshold: f32,

    #[arg(long, env = "PETPAL_NMS", default_value_t = 0.2)]
    pub nms_threshold: f32,

    /// Classes that count as "the pet", comma separated
    #[arg(long, env = "PETPAL_TARGET_CLASSES", value_delimiter = ',', default_value = "dog")]
    pub target_classes: Vec<String>,

    /// Directory holding the frozen graph, its pbtxt and coco.names
    #[arg(long, env = "PETPAL_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    #[arg(long, env = "PETPAL_INPUT_SIZE", default_value_t = 320)]
    pub input_size: i32,

    #[arg(long, env = "PETPAL_INPUT_SCALE", default_value_t = 1.0 / 127.5)]
    pub input_scale: f64,

    #[arg(long, env = "PETPAL_INPUT_MEAN", default_value_t = 127.5)]
    pub input_mean: f64,

    #[arg(long, env = "PETPAL_SWAP_RB", default_value_t = true, action = clap::ArgAction::Set)]
    pub swap_rb: bool,

    /// Time the feeder holds the triggered position, in milliseconds
    #[arg(long, env = "PETPAL_DWELL_MS", default_value_t = 1000)]
    pub dwell_ms: u64,

    #[arg(long, env = "PETPAL_TRIGGERED_ANGLE", default_value_t = -90.0, allow_negative_numbers = true)]
    pub triggered_angle: f32,

    #[arg(long, env = "PETPAL_NEUTRAL_ANGLE", default_value_t = 90.0, allow_negative_numbers = true)]
    pub neutral_angle: f32,

    #[arg(long, env = "PETPAL_PWM_CHIP", default_value_t = 0)]
    pub pwm_chip: u32,

    #[arg(long, env = "PETPAL_PWM_CHANNEL", default_value_t = 0)]
    pub pwm_channel: u32,

    /// Feeding time at start-up, HH:MM:SS or HH:MM
    #[arg(long, env = "PETPAL_FEEDING_TIME", default_value = "23:59:59", value_parser = parse_feeding_time)]
    pub feeding_time: NaiveTime,

    #[arg(long, env = "PETPAL_FRAME_INTERVAL_MS", default_value_t = 33)]
    pub frame_interval_ms: u64,

    /// Frames a slow viewer may fall behind before the oldest are dropped
    #[arg(long, env = "PETPAL_VIEWER_BUFFER", default_value_t = 2)]
    pub viewer_buffer: usize,

    #[arg(long, env = "PETPAL_JPEG_QUALITY", default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Draw detection boxes on the stream
    #[arg(long, env = "PETPAL_ANNOTATE", default_value_t = true, action = clap::ArgAction::Set)]
    pub annotate: bool,

    /// `every-frame` logs each sighting while the window is open,
    /// `transitions` only when the pet appears
    #[arg(long, env = "PETPAL_DETECTION_LOG", default_value = "every-frame")]
    pub detection_log: DetectionLogMode,

    #[arg(long, env = "PETPAL_SHUTDOWN_TIMEOUT_MS", default_value_t = 5000)]
    pub shutdown_timeout_ms: u64,
}

impl Settings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            detection: DetectionParams {
                confidence_threshold: self.confidence_threshold,
                nms_threshold: self.nms_threshold,
                target_classes: self.target_classes.clone(),
            },
            actuation: ActuationConfig {
                triggered_angle: self.triggered_angle,
                neutral_angle: self.neutral_angle,
                dwell: Duration::from_millis(self.dwell_ms),
            },
            default_feeding_time: self.feeding_time,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            viewer_buffer: self.viewer_buffer,
            jpeg_quality: self.jpeg_quality,
            annotate: self.annotate,
            detection_log: self.detection_log,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            ..EngineConfig::default()
        }
    }

    pub fn servo_config(&self) -> ServoConfig {
        ServoConfig {
            chip: self.pwm_chip,
            channel: self.pwm_channel,
            initial_angle: self.neutral_angle,
            ..ServoConfig::default()
        }
    }

    #[cfg(feature = "opencv")]
    pub fn dnn_config(&self) -> petpal_hw::DnnConfig {
        petpal_hw::DnnConfig {
            input_size: self.input_size,
            input_scale: self.input_scale,
            input_mean: self.input_mean,
            swap_rb: self.swap_rb,
            ..petpal_hw::DnnConfig::in_dir(&self.model_dir)
        }
    }

    /// Opens the devices for the selected backend. Any failure here is fatal.
    pub fn hardware(&self) -> anyhow::Result<Hardware> {
        match self.backend {
            Backend::Sim => {
                let fps = (1000 / self.frame_interval_ms.max(1)).max(1) as u32;
                Ok(Hardware {
                    source: Box::new(TestPatternSource::new(
                        self.capture_width,
                        self.capture_height,
                        fps,
                    )),
                    detector: Box::new(SimulatedDetector::default()),
                    actuator: Box::new(SimulatedServo::default()),
                })
            }
            Backend::Hardware => self.real_hardware(),
        }
    }

    #[cfg(feature = "opencv")]
    fn real_hardware(&self) -> anyhow::Result<Hardware> {
        let source = petpal_hw::OpenCvCamera::open(
            self.camera_index,
            self.capture_width,
            self.capture_height,
        )?;
        let detector = petpal_hw::DnnDetector::load(&self.dnn_config())?;
        let actuator = petpal_hw::SysfsPwmServo::open(self.servo_config()).map_err(|e| {
            anyhow::anyhow!(
                "opening PWM chip {} channel {}: {e}",
                self.pwm_chip,
                self.pwm_channel
            )
        })?;
        Ok(Hardware {
            source: Box::new(source),
            detector: Box::new(detector),
            actuator: Box::new(actuator),
        })
    }

    #[cfg(not(feature = "opencv"))]
    fn real_hardware(&self) -> anyhow::Result<Hardware> {
        anyhow::bail!("the hardware backend needs petpal to be built with the `opencv` feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petpal::FrameSource;

    #[test]
    fn defaults_match_the_engine_defaults() {
        let settings = Settings::try_parse_from(["petpal"]).unwrap();
        let config = settings.engine_config();
        let defaults = EngineConfig::default();

        assert_eq!(settings.bind, "0.0.0.0:5000");
        assert_eq!(settings.backend, Backend::Sim);
        assert_eq!(config.default_feeding_time, defaults.default_feeding_time);
        assert_eq!(config.detection.target_classes, vec!["dog".to_string()]);
        assert_eq!(config.detection.confidence_threshold, 0.45);
        assert_eq!(config.actuation.dwell, Duration::from_secs(1));
        assert_eq!(config.actuation.triggered_angle, -90.0);
        assert_eq!(config.viewer_buffer, 2);
        assert_eq!(config.detection_log, DetectionLogMode::EveryFrame);
    }

    #[test]
    fn flags_override_defaults() {
        let settings = Settings::try_parse_from([
            "petpal",
            "--feeding-time",
            "07:30",
            "--target-classes",
            "dog,cat",
            "--triggered-angle",
            "-45",
            "--detection-log",
            "transitions",
            "--annotate",
            "false",
        ])
        .unwrap();
        let config = settings.engine_config();

        assert_eq!(
            config.default_feeding_time,
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );
        assert_eq!(config.detection.target_classes, vec!["dog", "cat"]);
        assert_eq!(config.actuation.triggered_angle, -45.0);
        assert_eq!(config.detection_log, DetectionLogMode::Transitions);
        assert!(!config.annotate);
    }

    #[test]
    fn malformed_feeding_time_is_rejected() {
        assert!(Settings::try_parse_from(["petpal", "--feeding-time", "noon"]).is_err());
    }

    #[test]
    fn servo_parks_at_the_neutral_angle() {
        let settings = Settings::try_parse_from(["petpal", "--neutral-angle", "45"]).unwrap();
        assert_eq!(settings.servo_config().initial_angle, 45.0);
    }

    #[test]
    fn sim_backend_builds_without_devices() {
        let settings = Settings::try_parse_from(["petpal"]).unwrap();
        assert!(settings.hardware().is_ok());
    }

    #[test]
    fn capture_resolution_reaches_the_camera() {
        let settings = Settings::try_parse_from([
            "petpal",
            "--capture-width",
            "160",
            "--capture-height",
            "120",
        ])
        .unwrap();
        let mut hardware = settings.hardware().unwrap();
        let frame = hardware.source.capture().unwrap();
        assert_eq!(frame.dimensions(), (160, 120));
    }
}
