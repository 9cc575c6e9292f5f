// Controller state owned by the control loop, plus the motor enable state machine
//
//   Disabled --enable--> Enabled --disable--> Disabled
//   Enabled  --fault---> Faulted --acknowledge--> Disabled
//
// Faulted only leaves through an operator acknowledgement; enabling again is a
// separate, explicit request.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pid::{PidGains, PidState};
use crate::motor::MotorStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorState {
    Disabled,
    Enabled,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorEvent {
    Enable,
    Disable,
    Fault,
    Acknowledge,
}

impl MotorState {
    /// Next state for `event`, or `None` when the event is not allowed here
    pub fn on(self, event: MotorEvent) -> Option<MotorState> {
        use MotorEvent::*;
        use MotorState::*;

        match (self, event) {
            (Disabled, Enable) => Some(Enabled),
            (Enabled, Disable) => Some(Disabled),
            // A failed enable attempt leaves the motor in an unknown state
            (Enabled | Disabled, Fault) => Some(Faulted),
            (Faulted, Acknowledge) => Some(Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotorState::Disabled => "disabled",
            MotorState::Enabled => "enabled",
            MotorState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Why the controller faulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultReason {
    SensorStale { cycles: u32 },
    FeedbackLost { cycles: u32 },
    OverTemperature { celsius: f32 },
    OverTorque { torque_nm: f32 },
    MotorReported { status: MotorStatus },
    Transport { message: String },
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::SensorStale { cycles } => write!(f, "no pressure frame for {} cycles", cycles),
            FaultReason::FeedbackLost { cycles } => write!(f, "no motor feedback for {} cycles", cycles),
            FaultReason::OverTemperature { celsius } => write!(f, "motor temperature {:.0}°C", celsius),
            FaultReason::OverTorque { torque_nm } => write!(f, "measured torque {:.2} N·m", torque_nm),
            FaultReason::MotorReported { status } => write!(f, "motor reported {}", status),
            FaultReason::Transport { message } => write!(f, "transport failure: {}", message),
        }
    }
}

/// What the torque command tracks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GripMode {
    /// Closed loop on aggregate grip force
    ForceTracking,
    /// Fixed torque, e.g. to open the gripper
    ManualTorque { torque_nm: f32 },
}

/// Progress of the zero-offset calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CalibrationStatus {
    Uncalibrated,
    Collecting { frames: usize, needed: usize },
    Calibrated,
    /// Last attempt failed; any earlier offset stays in use
    Failed { frames: usize, needed: usize, has_offset: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub motor_state: MotorState,
    pub fault: Option<FaultReason>,
    pub mode: GripMode,
    pub target_force_n: f32,
    pub gains: PidGains,
    pub pid: PidState,
    pub output_torque_nm: f32,
}

impl ControllerState {
    pub fn new(target_force_n: f32, gains: PidGains) -> Self {
        Self {
            motor_state: MotorState::Disabled,
            fault: None,
            mode: GripMode::ForceTracking,
            target_force_n,
            gains,
            pid: PidState::default(),
            output_torque_nm: 0.0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.motor_state == MotorState::Enabled
    }

    /// Apply a state machine event; returns false when it was not allowed
    pub fn apply(&mut self, event: MotorEvent, reason: Option<FaultReason>) -> bool {
        let Some(next) = self.motor_state.on(event) else {
            return false;
        };

        self.motor_state = next;
        self.output_torque_nm = 0.0;
        match next {
            MotorState::Faulted => self.fault = reason,
            MotorState::Disabled => self.fault = None,
            MotorState::Enabled => self.pid = PidState::default(),
        }
        true
    }

    pub fn reset_pid(&mut self) {
        self.pid = PidState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_cycle() {
        assert_eq!(MotorState::Disabled.on(MotorEvent::Enable), Some(MotorState::Enabled));
        assert_eq!(MotorState::Enabled.on(MotorEvent::Disable), Some(MotorState::Disabled));
    }

    #[test]
    fn test_faulted_needs_acknowledgement() {
        let faulted = MotorState::Enabled.on(MotorEvent::Fault).unwrap();
        assert_eq!(faulted, MotorState::Faulted);
        assert_eq!(faulted.on(MotorEvent::Enable), None);
        assert_eq!(faulted.on(MotorEvent::Disable), None);
        assert_eq!(faulted.on(MotorEvent::Fault), None);
        assert_eq!(faulted.on(MotorEvent::Acknowledge), Some(MotorState::Disabled));
    }

    #[test]
    fn test_enabled_is_false_while_fault_is_set() {
        let mut state = ControllerState::new(0.15, PidGains::new(2.0, 0.1, 0.0));
        assert!(state.apply(MotorEvent::Enable, None));
        state.pid.integral = 0.4;

        assert!(state.apply(MotorEvent::Fault, Some(FaultReason::SensorStale { cycles: 11 })));
        assert!(!state.enabled());
        assert!(state.fault.is_some());

        assert!(!state.apply(MotorEvent::Enable, None));
        assert!(state.apply(MotorEvent::Acknowledge, None));
        assert_eq!(state.fault, None);
        assert!(state.apply(MotorEvent::Enable, None));
        assert_eq!(state.pid, PidState::default());
    }

    #[test]
    fn test_fault_reason_serializes_with_kind() {
        let json = serde_json::to_string(&FaultReason::FeedbackLost { cycles: 12 }).unwrap();
        assert_eq!(json, r#"{"kind":"feedback_lost","cycles":12}"#);
    }
}
