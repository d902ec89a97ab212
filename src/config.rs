// Defaults, tick rates, geometry and the runtime config file
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::motor::PinMap;

// Actuation loop frequency
pub const UPDATE_HZ: u32 = 50;

// Time for the duty ramp to travel from start to target
pub const RAMP_TIME_S: f32 = 1.0;

// Command WebSocket endpoint
pub const BIND_ADDR: &str = "0.0.0.0";
pub const CMD_PORT: u16 = 9000;

// Differential drive geometry (meters)
pub const WHEEL_BASE: f32 = 0.15;
pub const WHEEL_RADIUS: f32 = 0.065;

// Velocity smoother limits
pub const MAX_ACCEL: f32 = 0.5; // m/s^2
pub const MAX_ANG_ACCEL: f32 = 2.0; // rad/s^2

// Duty limits: motors stall below MIN_DUTY
pub const MIN_DUTY: f32 = 40.0;
pub const MAX_DUTY: f32 = 100.0;

// Telemetry periods
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const VELOCITY_UPDATE_HZ: u32 = 10;

// Bounded in-memory command history
pub const COMMAND_LOG_CAPACITY: usize = 256;

// H-bridge wiring (BCM numbering)
pub const LEFT_PWM_PIN: u8 = 12;
pub const LEFT_IN1_PIN: u8 = 23;
pub const LEFT_IN2_PIN: u8 = 24;
pub const RIGHT_PWM_PIN: u8 = 13;
pub const RIGHT_IN1_PIN: u8 = 8;
pub const RIGHT_IN2_PIN: u8 = 7;
pub const PWM_FREQ_HZ: f64 = 1000.0;

// Zenoh topics for the passive telemetry mirror
pub const TOPIC_VELOCITY: &str = "rover/state/velocity";
pub const TOPIC_HEALTH: &str = "rover/state/health";

const TRIM_RANGE: (f32, f32) = (0.5, 1.5);
const HEALTH_INTERVAL_RANGE: (f32, f32) = (0.1, 3600.0);
const PWM_FREQ_RANGE: (f64, f64) = (10.0, 20_000.0);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration. Every field falls back to the constants above, so
/// a config file only needs the values it wants to change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bind_addr: String,
    pub cmd_port: u16,
    pub update_hz: u32,
    pub ramp_time_s: f32,
    pub wheel_base: f32,
    pub wheel_radius: f32,
    pub max_accel: f32,
    pub max_ang_accel: f32,
    pub min_duty: f32,
    pub max_duty: f32,
    /// Per-side correction applied to the duty at output write
    pub trim_left: f32,
    pub trim_right: f32,
    pub health_interval_s: f32,
    pub velocity_hz: u32,
    /// Stop the robot if no motion command arrives within this window
    pub cmd_timeout_ms: Option<u64>,
    pub command_log_capacity: usize,
    pub pins: PinMap,
    pub pwm_freq_hz: f64,
    /// Use the simulated output instead of the GPIO pins
    pub simulate: bool,
    pub zenoh_mirror: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: BIND_ADDR.to_string(),
            cmd_port: CMD_PORT,
            update_hz: UPDATE_HZ,
            ramp_time_s: RAMP_TIME_S,
            wheel_base: WHEEL_BASE,
            wheel_radius: WHEEL_RADIUS,
            max_accel: MAX_ACCEL,
            max_ang_accel: MAX_ANG_ACCEL,
            min_duty: MIN_DUTY,
            max_duty: MAX_DUTY,
            trim_left: 1.0,
            trim_right: 1.0,
            health_interval_s: HEALTH_CHECK_INTERVAL.as_secs_f32(),
            velocity_hz: VELOCITY_UPDATE_HZ,
            cmd_timeout_ms: None,
            command_log_capacity: COMMAND_LOG_CAPACITY,
            pins: PinMap::default(),
            pwm_freq_hz: PWM_FREQ_HZ,
            simulate: false,
            zenoh_mirror: false,
        }
    }
}

impl RuntimeConfig {
    /// Load a TOML config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Clamp every value into a range the actuators can live with.
    /// Bad values are corrected rather than rejected so the robot always
    /// starts with a sane configuration.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        let (min_duty, max_duty) = sanitize_duty_limits(self.min_duty, self.max_duty);
        self.min_duty = min_duty;
        self.max_duty = max_duty;

        self.update_hz = self.update_hz.clamp(1, 1000);
        self.velocity_hz = self.velocity_hz.clamp(1, 100);
        self.command_log_capacity = self.command_log_capacity.max(1);

        self.ramp_time_s = positive_or(self.ramp_time_s, defaults.ramp_time_s);
        self.wheel_base = positive_or(self.wheel_base, defaults.wheel_base);
        self.wheel_radius = positive_or(self.wheel_radius, defaults.wheel_radius);
        self.max_accel = positive_or(self.max_accel, defaults.max_accel);
        self.max_ang_accel = positive_or(self.max_ang_accel, defaults.max_ang_accel);
        self.health_interval_s = positive_or(self.health_interval_s, defaults.health_interval_s)
            .clamp(HEALTH_INTERVAL_RANGE.0, HEALTH_INTERVAL_RANGE.1);
        self.pwm_freq_hz = if self.pwm_freq_hz.is_finite() {
            self.pwm_freq_hz.clamp(PWM_FREQ_RANGE.0, PWM_FREQ_RANGE.1)
        } else {
            defaults.pwm_freq_hz
        };

        self.trim_left = trim_or_default(self.trim_left);
        self.trim_right = trim_or_default(self.trim_right);
        self
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_hz as f64)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs_f32(self.health_interval_s)
    }

    pub fn velocity_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.velocity_hz as f64)
    }

    pub fn cmd_timeout(&self) -> Option<Duration> {
        self.cmd_timeout_ms.map(Duration::from_millis)
    }
}

/// Order and clamp a pair of duty limits into `[0, 100]`.
pub fn sanitize_duty_limits(a: f32, b: f32) -> (f32, f32) {
    let a = if a.is_finite() { a.clamp(0.0, 100.0) } else { MIN_DUTY };
    let b = if b.is_finite() { b.clamp(0.0, 100.0) } else { MAX_DUTY };
    (a.min(b), a.max(b))
}

fn positive_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

fn trim_or_default(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(TRIM_RANGE.0, TRIM_RANGE.1)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = RuntimeConfig::from_toml("cmd_port = 9100\nmin_duty = 30.0\n").unwrap();
        assert_eq!(cfg.cmd_port, 9100);
        assert_eq!(cfg.min_duty, 30.0);
        assert_eq!(cfg.update_hz, UPDATE_HZ);
        assert_eq!(cfg.wheel_base, WHEEL_BASE);
        assert!(cfg.cmd_timeout_ms.is_none());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let err = RuntimeConfig::from_toml("cmd_port = \"not a port\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_sanitize_swaps_and_clamps_duty() {
        let cfg = RuntimeConfig {
            min_duty: 120.0,
            max_duty: -5.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.min_duty, 0.0);
        assert_eq!(cfg.max_duty, 100.0);
    }

    #[test]
    fn test_sanitize_rejects_nonsense_geometry() {
        let cfg = RuntimeConfig {
            wheel_radius: 0.0,
            wheel_base: f32::NAN,
            update_hz: 0,
            trim_left: 3.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(cfg.wheel_radius, WHEEL_RADIUS);
        assert_eq!(cfg.wheel_base, WHEEL_BASE);
        assert_eq!(cfg.update_hz, 1);
        assert_eq!(cfg.trim_left, 1.5);
    }

    #[test]
    fn test_sanitize_bounds_health_interval() {
        let tiny = RuntimeConfig {
            health_interval_s: 1e-12,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(tiny.health_interval(), Duration::from_secs_f32(0.1));

        let huge = RuntimeConfig {
            health_interval_s: f32::MAX,
            pwm_freq_hz: f64::INFINITY,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(huge.health_interval(), Duration::from_secs(3600));
        assert_eq!(huge.pwm_freq_hz, PWM_FREQ_HZ);
    }

    #[test]
    fn test_tick_period_matches_rate() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.tick_period(), Duration::from_millis(20));
    }
}
