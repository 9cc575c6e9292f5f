// Pressure array side of the gripper
//
// Provides:
// - 78-byte serial frame parser with resynchronization
// - Per-site linear calibration, zero offset and force aggregation
// - Serial port source feeding the parser

pub mod calibration;
pub mod frame;
mod serial;

use std::time::Duration;

pub use calibration::{
    AggregateForce, CalibrationEntry, CalibrationError, CalibrationTable, ZeroOffset, aggregate, to_force,
    zero_calibrate,
};
pub use frame::{FrameParser, ParseError, ParserStats, PressureFrame, SENSOR_COUNT};
pub use serial::SerialPressureSource;

/// Error types for the pressure link
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sensor disconnected")]
    Disconnected,
}

/// Anything that yields pressure frames
pub trait PressureSource: Send {
    /// Newest valid frame that arrived within `timeout`; `Ok(None)` when none did
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<PressureFrame>, SensorError>;

    fn stats(&self) -> ParserStats;
}

impl<S: PressureSource + ?Sized> PressureSource for Box<S> {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<PressureFrame>, SensorError> {
        (**self).read_frame(timeout)
    }

    fn stats(&self) -> ParserStats {
        (**self).stats()
    }
}
