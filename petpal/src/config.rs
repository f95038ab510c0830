use crate::core_modules::actuation::ActuationConfig;
use crate::core_modules::detector::DetectionParams;
use chrono::NaiveTime;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How "detected" events reach the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionLogMode {
    /// One event per qualifying detection on every frame while the window is
    /// open. Can grow the log at camera frame rate.
    #[default]
    EveryFrame,
    /// Only when a target appears after a frame without one.
    Transitions,
}

impl FromStr for DetectionLogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every-frame" | "every_frame" | "all" => Ok(Self::EveryFrame),
            "transitions" | "transition" => Ok(Self::Transitions),
            other => Err(format!(
                "unknown detection log mode `{other}` (expected `every-frame` or `transitions`)"
            )),
        }
    }
}

impl fmt::Display for DetectionLogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryFrame => f.write_str("every-frame"),
            Self::Transitions => f.write_str("transitions"),
        }
    }
}

/// Configuration for the engine, allowing for tunable behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub detection: DetectionParams,
    pub actuation: ActuationConfig,
    /// Feeding time in effect at start-up.
    pub default_feeding_time: NaiveTime,
    /// Minimum time between frames; the camera may be slower.
    pub frame_interval: Duration,
    /// Back-off after a failed camera read.
    pub capture_retry_delay: Duration,
    /// Per-viewer backlog before the oldest frames are dropped.
    pub viewer_buffer: usize,
    pub jpeg_quality: u8,
    /// Draw detection boxes onto streamed frames.
    pub annotate: bool,
    pub detection_log: DetectionLogMode,
    /// How long shutdown waits for a running actuation sequence.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection: DetectionParams::default(),
            actuation: ActuationConfig::default(),
            default_feeding_time: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            frame_interval: Duration::from_millis(33),
            capture_retry_delay: Duration::from_millis(500),
            viewer_buffer: 2,
            jpeg_quality: 80,
            annotate: true,
            detection_log: DetectionLogMode::EveryFrame,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
