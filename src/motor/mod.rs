// Motor side of the gripper: DM-series joint motor on a CAN bus
//
// Provides:
// - DM MIT-mode frame codec (command, feedback, enable/disable control frames)
// - Transport abstraction over the CAN adapter
// - Serial USB-CAN adapter implementation

pub mod damiao;
pub mod transport;
pub mod usb_can;

pub use damiao::{
    CanFrame, ControlMode, DecodeError, MotorCommand, MotorConfig, MotorFamily, MotorFeedback, MotorLimits,
    MotorStatus,
};
pub use transport::{Transport, TransportError, verify_identity};
pub use usb_can::UsbCanAdapter;
