use petpal::{Actuator, ActuatorError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hobby-servo geometry and the PWM channel it hangs off.
#[derive(Debug, Clone)]
pub struct ServoConfig {
    /// Root of the PWM class, normally `/sys/class/pwm`.
    pub sysfs_root: PathBuf,
    pub chip: u32,
    pub channel: u32,
    pub period: Duration,
    pub min_pulse: Duration,
    pub max_pulse: Duration,
    pub min_angle: f32,
    pub max_angle: f32,
    pub initial_angle: f32,
}

impl Default for ServoConfig {
    fn default() -> Self {
        // GPIO12 is PWM0 channel 0 on a Raspberry Pi.
        Self {
            sysfs_root: PathBuf::from("/sys/class/pwm"),
            chip: 0,
            channel: 0,
            period: Duration::from_millis(20),
            min_pulse: Duration::from_micros(500),
            max_pulse: Duration::from_micros(2500),
            min_angle: -90.0,
            max_angle: 90.0,
            initial_angle: 90.0,
        }
    }
}

impl ServoConfig {
    /// Pulse width for `angle`, clamped to the servo's range.
    pub fn pulse_for(&self, angle: f32) -> Duration {
        let span = self.max_angle - self.min_angle;
        let ratio = if span == 0.0 {
            0.0
        } else {
            ((angle - self.min_angle) / span).clamp(0.0, 1.0)
        };
        let min = self.min_pulse.as_nanos() as f64;
        let max = self.max_pulse.as_nanos() as f64;
        Duration::from_nanos((min + (max - min) * f64::from(ratio)).round() as u64)
    }
}

/// A servo on a sysfs PWM channel.
pub struct SysfsPwmServo {
    channel_dir: PathBuf,
    config: ServoConfig,
}

impl SysfsPwmServo {
    /// Exports the channel if needed, sets the period, parks the servo at its
    /// initial angle and enables output.
    pub fn open(config: ServoConfig) -> Result<Self, ActuatorError> {
        let chip_dir = config.sysfs_root.join(format!("pwmchip{}", config.chip));
        let channel_dir = chip_dir.join(format!("pwm{}", config.channel));
        if !channel_dir.exists() {
            write_attr(&chip_dir.join("export"), config.channel)?;
        }

        let mut servo = Self {
            channel_dir,
            config,
        };
        servo.write("period", servo.config.period.as_nanos())?;
        servo.move_to(servo.config.initial_angle)?;
        servo.write("enable", 1)?;
        tracing::info!(
            channel = %servo.channel_dir.display(),
            "servo ready"
        );
        Ok(servo)
    }

    fn write(&self, attr: &str, value: impl std::fmt::Display) -> Result<(), ActuatorError> {
        write_attr(&self.channel_dir.join(attr), value)
    }
}

fn write_attr(path: &Path, value: impl std::fmt::Display) -> Result<(), ActuatorError> {
    fs::write(path, value.to_string())
        .map_err(|e| ActuatorError::Io(format!("{}: {e}", path.display())))
}

impl Actuator for SysfsPwmServo {
    fn move_to(&mut self, angle: f32) -> Result<(), ActuatorError> {
        let pulse = self.config.pulse_for(angle);
        tracing::debug!(angle, pulse_us = pulse.as_micros() as u64, "servo move");
        self.write("duty_cycle", pulse.as_nanos())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.write("enable", 0)
    }
}
