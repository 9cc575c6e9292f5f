// Message types exchanged between the runtime and its operators (GUI, console, scripts)

use serde::{Deserialize, Serialize};

use crate::control::state::{CalibrationStatus, ControllerState, MotorState};
use crate::motor::MotorFeedback;
use crate::sensor::{AggregateForce, ParserStats};

/// Session command from operator -> control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum GripperCommand {
    Enable,
    Disable,
    AcknowledgeFault,
    SetTarget {
        force_n: f32,
    },
    SetGains {
        kp: f32,
        ki: f32,
        kd: f32,
        #[serde(default)]
        reset_integral: bool,
    },
    SetManualTorque {
        torque_nm: f32,
    },
    ZeroCalibrate,
}

/// Consistent view of one control cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub cycle: u64,
    pub controller: ControllerState,
    pub force: Option<AggregateForce>,
    pub feedback: Option<MotorFeedback>,
    pub calibration: CalibrationStatus,
    pub stale_cycles: u32,
    pub missed_feedback: u32,
    pub sensor: ParserStats,
}

impl StatusSnapshot {
    pub fn initial(controller: ControllerState) -> Self {
        Self {
            cycle: 0,
            controller,
            force: None,
            feedback: None,
            calibration: CalibrationStatus::Uncalibrated,
            stale_cycles: 0,
            missed_feedback: 0,
            sensor: ParserStats::default(),
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        match self.controller.motor_state {
            MotorState::Faulted => RuntimeHealth::Faulted,
            // One missed frame is normal jitter once a force estimate exists
            _ if self.stale_cycles > 1 || (self.stale_cycles > 0 && self.force.is_none()) => {
                RuntimeHealth::SensorStale
            }
            _ if matches!(
                self.calibration,
                CalibrationStatus::Uncalibrated | CalibrationStatus::Failed { has_offset: false, .. }
            ) =>
            {
                RuntimeHealth::Uncalibrated
            }
            MotorState::Disabled => RuntimeHealth::Disabled,
            MotorState::Enabled => RuntimeHealth::Ok,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    Disabled,
    Uncalibrated,
    SensorStale,
    Faulted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::pid::PidGains;

    #[test]
    fn test_command_json_shape() {
        let cmd: GripperCommand = serde_json::from_str(r#"{"cmd":"set_target","force_n":0.2}"#).unwrap();
        assert_eq!(cmd, GripperCommand::SetTarget { force_n: 0.2 });

        let cmd: GripperCommand = serde_json::from_str(r#"{"cmd":"set_gains","kp":1.0,"ki":0.0,"kd":0.5}"#).unwrap();
        assert_eq!(
            cmd,
            GripperCommand::SetGains { kp: 1.0, ki: 0.0, kd: 0.5, reset_integral: false }
        );

        assert_eq!(serde_json::to_string(&GripperCommand::Enable).unwrap(), r#"{"cmd":"enable"}"#);
    }

    #[test]
    fn test_health_priorities() {
        let mut snapshot = StatusSnapshot::initial(ControllerState::new(0.15, PidGains::default()));
        assert_eq!(snapshot.health(), RuntimeHealth::Uncalibrated);

        snapshot.calibration = CalibrationStatus::Calibrated;
        assert_eq!(snapshot.health(), RuntimeHealth::Disabled);

        snapshot.controller.motor_state = MotorState::Enabled;
        assert_eq!(snapshot.health(), RuntimeHealth::Ok);

        snapshot.stale_cycles = 3;
        assert_eq!(snapshot.health(), RuntimeHealth::SensorStale);

        snapshot.controller.motor_state = MotorState::Faulted;
        assert_eq!(snapshot.health(), RuntimeHealth::Faulted);
    }
}
