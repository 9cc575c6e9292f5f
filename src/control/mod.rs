// Force control side of the gripper
//
// Provides:
// - PID step with anti-windup
// - Motor enable state machine and controller state
// - Fixed-period scheduler running on its own thread
// - Handle for submitting commands, reading status and shutting down

pub mod pid;
pub mod scheduler;
pub mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub use pid::{PidGains, PidLimits, PidState};
pub use scheduler::Scheduler;
pub use state::{CalibrationStatus, ControllerState, FaultReason, GripMode, MotorEvent, MotorState};

use crate::config::{ConfigError, RuntimeConfig};
use crate::messages::{GripperCommand, StatusSnapshot};
use crate::motor::{Transport, TransportError, damiao, verify_identity};
use crate::sensor::PressureSource;

/// Error types for starting and stopping the control loop
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to spawn control thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Control loop is not running")]
    LoopStopped,

    #[error("Motor still enabled after {0:?}, loop stopped anyway")]
    ShutdownTimeout(Duration),
}

/// Verify the adapter, put the motor in a known disabled state and start the loop thread
pub fn start<T, S>(config: &RuntimeConfig, mut transport: T, sensor: S) -> Result<ControlHandle, ControlError>
where
    T: Transport + 'static,
    S: PressureSource + 'static,
{
    config.validate()?;
    verify_identity(&mut transport, config.ports.adapter_serial.as_deref())?;
    transport.send(&damiao::disable_frame(&config.motor))?;

    let (commands, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(config, transport, sensor, rx)?;
    let status = scheduler.subscribe();
    let stop = Arc::new(AtomicBool::new(false));

    let stop_flag = stop.clone();
    let thread = std::thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || scheduler.run(stop_flag))?;

    Ok(ControlHandle {
        commands,
        status,
        stop,
        thread: Some(thread),
        period: config.control.period(),
    })
}

/// Owner-side handle to a running control loop
///
/// Dropping the handle stops the loop; the loop disables the motor on its way out.
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<GripperCommand>,
    status: watch::Receiver<StatusSnapshot>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    period: Duration,
}

impl ControlHandle {
    /// Queue a command; it takes effect at the start of the next cycle
    pub fn submit(&self, cmd: GripperCommand) -> Result<(), ControlError> {
        self.commands.send(cmd).map_err(|_| ControlError::LoopStopped)
    }

    pub fn enable(&self) -> Result<(), ControlError> {
        self.submit(GripperCommand::Enable)
    }

    pub fn disable(&self) -> Result<(), ControlError> {
        self.submit(GripperCommand::Disable)
    }

    pub fn acknowledge_fault(&self) -> Result<(), ControlError> {
        self.submit(GripperCommand::AcknowledgeFault)
    }

    pub fn set_target(&self, force_n: f32) -> Result<(), ControlError> {
        self.submit(GripperCommand::SetTarget { force_n })
    }

    pub fn set_gains(&self, gains: PidGains, reset_integral: bool) -> Result<(), ControlError> {
        self.submit(GripperCommand::SetGains {
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            reset_integral,
        })
    }

    pub fn set_manual_torque(&self, torque_nm: f32) -> Result<(), ControlError> {
        self.submit(GripperCommand::SetManualTorque { torque_nm })
    }

    pub fn zero_calibrate(&self) -> Result<(), ControlError> {
        self.submit(GripperCommand::ZeroCalibrate)
    }

    /// Latest published snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Two-phase stop: disable through the loop and wait until the snapshot shows it,
    /// then stop and join the loop thread
    pub fn shutdown(mut self, timeout: Duration) -> Result<(), ControlError> {
        let deadline = Instant::now() + timeout;
        let mut disabled = true;

        if self.status().controller.motor_state == MotorState::Enabled {
            info!("Shutdown: disabling motor");
            if self.disable().is_ok() {
                disabled = self.wait_until_not_enabled(deadline);
            } else {
                disabled = false;
            }
        }

        self.stop.store(true, Ordering::Release);
        let joined = match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        };
        info!("Control loop joined");

        if !joined {
            return Err(ControlError::LoopStopped);
        }
        if !disabled {
            warn!("Motor did not report disabled within {:?}", timeout);
            return Err(ControlError::ShutdownTimeout(timeout));
        }
        Ok(())
    }

    fn wait_until_not_enabled(&self, deadline: Instant) -> bool {
        loop {
            if self.status().controller.motor_state != MotorState::Enabled {
                return true;
            }
            if Instant::now() >= deadline || !self.is_running() {
                return false;
            }
            std::thread::sleep(self.period);
        }
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::damiao::ControlFrame;
    use crate::sensor::SENSOR_COUNT;
    use crate::sim::{SIM_IDENTITY, SimMotor, SimSensor};

    fn wait_for(handle: &ControlHandle, what: impl Fn(&StatusSnapshot) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what(&handle.status()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_identity_mismatch_sends_nothing() {
        let mut config = RuntimeConfig::default();
        config.ports.adapter_serial = Some(SIM_IDENTITY.to_string());
        let (motor, bus) = SimMotor::with_identity(config.motor, "SOME-OTHER-ADAPTER");

        let result = start(&config, motor, SimSensor::constant([0; SENSOR_COUNT]));
        assert!(matches!(
            result,
            Err(ControlError::Transport(TransportError::IdentityMismatch { .. }))
        ));
        assert!(bus.sent_frames().is_empty());
    }

    #[test]
    fn test_start_disables_before_first_cycle() {
        let mut config = RuntimeConfig::default();
        config.ports.adapter_serial = Some(SIM_IDENTITY.to_lowercase());
        let (motor, bus) = SimMotor::new(config.motor);

        let handle = start(&config, motor, SimSensor::constant([0; SENSOR_COUNT])).unwrap();
        let first = bus.sent_frames().first().cloned().unwrap();
        assert_eq!(damiao::control_kind(&first), Some(ControlFrame::Disable));
        handle.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_shutdown_disables_then_joins() {
        let config = RuntimeConfig::default();
        let (motor, bus) = SimMotor::new(config.motor);
        let handle = start(&config, motor, SimSensor::constant([300; SENSOR_COUNT])).unwrap();

        handle.enable().unwrap();
        assert!(wait_for(&handle, |s| s.controller.motor_state == MotorState::Enabled));
        assert!(wait_for(&handle, |s| s.cycle > 2));
        assert!(bus.count_commands() > 0);

        handle.shutdown(Duration::from_secs(1)).unwrap();
        assert!(!bus.is_enabled());
        let last = bus.sent_frames().pop().unwrap();
        assert_eq!(damiao::control_kind(&last), Some(ControlFrame::Disable));
    }

    #[test]
    fn test_drop_leaves_motor_disabled() {
        let config = RuntimeConfig::default();
        let (motor, bus) = SimMotor::new(config.motor);
        let handle = start(&config, motor, SimSensor::constant([300; SENSOR_COUNT])).unwrap();

        handle.enable().unwrap();
        assert!(wait_for(&handle, |s| s.controller.motor_state == MotorState::Enabled));
        drop(handle);

        assert!(!bus.is_enabled());
    }

    #[test]
    fn test_submit_after_loop_exit_fails() {
        let config = RuntimeConfig::default();
        let (motor, _bus) = SimMotor::new(config.motor);
        let handle = start(&config, motor, SimSensor::constant([0; SENSOR_COUNT])).unwrap();

        handle.stop.store(true, Ordering::Release);
        assert!(wait_for(&handle, |_| !handle.is_running()));
        assert!(matches!(handle.enable(), Err(ControlError::LoopStopped)));
    }
}
