// Transport abstraction between the control loop and the CAN adapter
//
// The loop only ever needs three capabilities: send a frame, receive a frame
// with a bounded wait, and report which physical adapter it is talking to.

use std::time::Duration;
use tracing::info;

use super::damiao::CanFrame;

/// Error types for CAN transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CAN adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Adapter identity mismatch: expected {expected}, found {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Frame rejected by adapter: {0}")]
    InvalidFrame(String),

    #[error("Transport disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A CAN link to the motor
pub trait Transport: Send {
    /// Serial number (or other stable identity) of the adapter
    fn identify(&mut self) -> Result<String>;

    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout
    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn identify(&mut self) -> Result<String> {
        (**self).identify()
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        (**self).receive(timeout)
    }
}

/// Check the adapter identity once at startup
///
/// With no expected identity configured the check only logs what was found.
pub fn verify_identity<T: Transport + ?Sized>(transport: &mut T, expected: Option<&str>) -> Result<String> {
    let actual = transport.identify()?;

    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            Err(TransportError::IdentityMismatch {
                expected: expected.to_string(),
                actual,
            })
        }
        Some(_) => {
            info!("CAN adapter {} verified", actual);
            Ok(actual)
        }
        None => {
            info!("CAN adapter {} (no expected serial configured)", actual);
            Ok(actual)
        }
    }
}
