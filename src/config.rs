// Loop timing, safety thresholds, ports, topics and motor configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::control::pid::PidGains;
use crate::motor::{ControlMode, MotorConfig, MotorFamily};
use crate::sensor::{CalibrationEntry, CalibrationError, CalibrationTable};

// Control loop frequency (10 ms cycle)
pub const LOOP_HZ: u64 = 100;

// Per-call bound on blocking transport I/O, as a fraction of the cycle
pub const IO_TIMEOUT_FRACTION: f32 = 0.25;

// Consecutive cycles without a valid pressure frame before faulting
pub const STALENESS_THRESHOLD: u32 = 10;

// Consecutive cycles without valid motor feedback before faulting
pub const FEEDBACK_LOSS_THRESHOLD: u32 = 10;

// Motor temperature limit (MOS or rotor)
pub const MAX_TEMPERATURE_C: f32 = 80.0;

// Measured torque more than this fraction above the torque limit is a fault
pub const TORQUE_FAULT_MARGIN: f32 = 0.1;

// Integral accumulator bound (N·s)
pub const INTEGRAL_LIMIT: f32 = 1.0;

// Time allowed to collect the zero-offset window
pub const ZERO_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5);

// Default grip target and gains
pub const DEFAULT_TARGET_FORCE_N: f32 = 0.15;
pub const DEFAULT_GAINS: PidGains = PidGains {
    kp: 2.0,
    ki: 0.1,
    kd: 0.0,
};

// Serial ports
pub const SENSOR_PORT: &str = "/dev/ttyUSB0";
pub const SENSOR_BAUDRATE: u32 = 460_800;
pub const CAN_ADAPTER_PORT: &str = "/dev/ttyACM0";
pub const CAN_ADAPTER_BAUDRATE: u32 = 921_600;

// Motor on the gripper joint
pub const MOTOR_CAN_ID: u32 = 0x01;
pub const MOTOR_MASTER_ID: u32 = 0x11;

// Zenoh topics
pub const TOPIC_CMD: &str = "gripper/cmd"; // session commands
pub const TOPIC_STATUS: &str = "gripper/state/status"; // controller snapshots
pub const TOPIC_HEALTH: &str = "gripper/state/health"; // health status

// Status publish rate
pub const STATUS_HZ: u64 = 20;

// Time allowed for the motor to report disabled during shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid calibration table: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Control loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub loop_hz: u64,
    pub io_timeout_fraction: f32,
    pub staleness_threshold: u32,
    pub feedback_loss_threshold: u32,
    pub max_temperature_c: f32,
    pub torque_fault_margin: f32,
    pub integral_limit: f32,
    /// Optional tighter torque bound; the motor's rated torque always applies
    pub torque_limit_nm: Option<f32>,
    pub zero_calibration_timeout_ms: u64,
    pub target_force_n: f32,
    pub gains: PidGains,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_hz: LOOP_HZ,
            io_timeout_fraction: IO_TIMEOUT_FRACTION,
            staleness_threshold: STALENESS_THRESHOLD,
            feedback_loss_threshold: FEEDBACK_LOSS_THRESHOLD,
            max_temperature_c: MAX_TEMPERATURE_C,
            torque_fault_margin: TORQUE_FAULT_MARGIN,
            integral_limit: INTEGRAL_LIMIT,
            torque_limit_nm: None,
            zero_calibration_timeout_ms: ZERO_CALIBRATION_TIMEOUT.as_millis() as u64,
            target_force_n: DEFAULT_TARGET_FORCE_N,
            gains: DEFAULT_GAINS,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_hz)
    }

    pub fn io_timeout(&self) -> Duration {
        let period_us = self.period().as_micros() as f32;
        Duration::from_micros((period_us * self.io_timeout_fraction) as u64)
    }

    /// Cycles allowed for the zero-offset window (at least one)
    pub fn zero_calibration_cycles(&self) -> u64 {
        let period_us = self.period().as_micros().max(1) as u64;
        (self.zero_calibration_timeout_ms * 1000 / period_us).max(1)
    }
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub sensor_port: String,
    pub sensor_baudrate: u32,
    pub can_port: String,
    pub can_baudrate: u32,
    /// USB serial number the CAN adapter must report
    pub adapter_serial: Option<String>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            sensor_port: SENSOR_PORT.to_string(),
            sensor_baudrate: SENSOR_BAUDRATE,
            can_port: CAN_ADAPTER_PORT.to_string(),
            can_baudrate: CAN_ADAPTER_BAUDRATE,
            adapter_serial: None,
        }
    }
}

/// Everything the runtime needs, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    pub ports: PortConfig,
    pub motor: MotorConfig,
    /// Replaces the factory calibration table when present (36 entries)
    pub calibration: Option<Vec<CalibrationEntry>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            ports: PortConfig::default(),
            motor: MotorConfig {
                family: MotorFamily::Dm4310,
                mode: ControlMode::Mit,
                can_id: MOTOR_CAN_ID,
                master_id: MOTOR_MASTER_ID,
            },
            calibration: None,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.control;
        if !(50..=1000).contains(&c.loop_hz) {
            return Err(ConfigError::Invalid(format!(
                "loop_hz {} outside 50..=1000 (1-20 ms cycle)",
                c.loop_hz
            )));
        }
        if !(c.io_timeout_fraction > 0.0 && c.io_timeout_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "io_timeout_fraction {} must be in (0, 1)",
                c.io_timeout_fraction
            )));
        }
        if c.staleness_threshold == 0 || c.feedback_loss_threshold == 0 {
            return Err(ConfigError::Invalid("fault thresholds must be at least 1".into()));
        }
        if !(c.torque_fault_margin >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "torque_fault_margin {} must be non-negative",
                c.torque_fault_margin
            )));
        }
        if c.integral_limit < 0.0 {
            return Err(ConfigError::Invalid("integral_limit must be non-negative".into()));
        }
        if let Some(limit) = c.torque_limit_nm {
            if limit <= 0.0 {
                return Err(ConfigError::Invalid(format!("torque_limit_nm {} must be positive", limit)));
            }
        }
        if self.motor.mode != ControlMode::Mit {
            return Err(ConfigError::Invalid(format!(
                "force control drives the motor in MIT mode, got {:?}",
                self.motor.mode
            )));
        }
        if self.motor.can_id > 0x0F {
            return Err(ConfigError::Invalid(format!(
                "motor can_id 0x{:X} does not fit the feedback ID nibble",
                self.motor.can_id
            )));
        }
        if let Some(entries) = &self.calibration {
            CalibrationTable::from_entries(entries)?;
        }
        Ok(())
    }

    pub fn calibration_table(&self) -> Result<CalibrationTable, ConfigError> {
        match &self.calibration {
            Some(entries) => Ok(CalibrationTable::from_entries(entries)?),
            None => Ok(CalibrationTable::factory()),
        }
    }

    /// Effective torque bound: the motor's rated torque, tightened by config
    pub fn torque_limit(&self) -> f32 {
        let rated = self.motor.limits().rated_torque();
        match self.control.torque_limit_nm {
            Some(limit) => limit.min(rated),
            None => rated,
        }
    }
}
