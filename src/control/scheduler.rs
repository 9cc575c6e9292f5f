// Fixed-period force control loop
//
// One cycle, never reordered:
//   1. apply commands pending at cycle start (enable/disable only change here)
//   2. read newest pressure frame -> calibrate -> aggregate
//   3. PID step -> encode -> send -> read feedback -> fault checks
//   4. publish one consistent snapshot

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tracing::{debug, error, info, warn};

use super::pid::{self, PidGains, PidLimits};
use super::state::{CalibrationStatus, ControllerState, FaultReason, GripMode, MotorEvent, MotorState};
use crate::config::{ConfigError, ControlConfig, RuntimeConfig};
use crate::messages::{GripperCommand, StatusSnapshot};
use crate::motor::damiao::{self, CanFrame, MotorCommand, MotorConfig, MotorFeedback};
use crate::motor::Transport;
use crate::sensor::calibration::MIN_ZERO_FRAMES;
use crate::sensor::{
    AggregateForce, CalibrationTable, PressureFrame, PressureSource, ZeroOffset, aggregate, zero_calibrate,
};

const MAX_STALE_FRAMES: usize = 16;

struct ZeroWindow {
    frames: Vec<PressureFrame>,
    deadline_cycle: u64,
}

pub struct Scheduler<T: Transport, S: PressureSource> {
    transport: T,
    sensor: S,
    motor: MotorConfig,
    control: ControlConfig,
    table: CalibrationTable,
    limits: PidLimits,

    state: ControllerState,
    offset: Option<ZeroOffset>,
    zero_window: Option<ZeroWindow>,
    calibration: CalibrationStatus,
    force: Option<AggregateForce>,
    feedback: Option<MotorFeedback>,
    stale_cycles: u32,
    missed_feedback: u32,
    cycle: u64,

    commands: UnboundedReceiver<GripperCommand>,
    status: watch::Sender<StatusSnapshot>,
}

impl<T: Transport, S: PressureSource> Scheduler<T, S> {
    pub fn new(
        config: &RuntimeConfig,
        transport: T,
        sensor: S,
        commands: UnboundedReceiver<GripperCommand>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = ControllerState::new(config.control.target_force_n, config.control.gains);
        let (status, _) = watch::channel(StatusSnapshot::initial(state.clone()));

        Ok(Self {
            transport,
            sensor,
            motor: config.motor,
            control: config.control.clone(),
            table: config.calibration_table()?,
            limits: PidLimits {
                integral_limit: config.control.integral_limit,
                torque_limit: config.torque_limit(),
            },
            state,
            offset: None,
            zero_window: None,
            calibration: CalibrationStatus::Uncalibrated,
            force: None,
            feedback: None,
            stale_cycles: 0,
            missed_feedback: 0,
            cycle: 0,
            commands,
            status,
        })
    }

    /// Receiver for the per-cycle snapshot
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            cycle: self.cycle,
            controller: self.state.clone(),
            force: self.force,
            feedback: self.feedback,
            calibration: self.calibration,
            stale_cycles: self.stale_cycles,
            missed_feedback: self.missed_feedback,
            sensor: self.sensor.stats(),
        }
    }

    /// Run cycles at the configured period until `stop` is set
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        let period = self.control.period();
        info!(
            "Control loop started: {}Hz, {:?} I/O budget, staleness threshold {} cycles",
            self.control.loop_hz,
            self.control.io_timeout(),
            self.control.staleness_threshold
        );

        let mut next = Instant::now();
        while !stop.load(Ordering::Acquire) {
            self.run_cycle();

            next += period;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else if now - next > period {
                debug!("Cycle {} overran by {:?}", self.cycle, now - next);
                next = now;
            }
        }

        // Never leave the motor enabled without a controller behind it
        if self.state.enabled() {
            warn!("Control loop stopping with motor enabled, disabling");
            self.send_disable();
            self.state.apply(MotorEvent::Disable, None);
            self.publish();
        }
        info!("Control loop stopped after {} cycles", self.cycle);
    }

    pub fn run_cycle(&mut self) {
        self.cycle += 1;
        self.apply_pending_commands();
        self.read_sensor();
        if self.state.enabled() {
            self.command_motor();
        }
        self.publish();
    }

    fn apply_pending_commands(&mut self) {
        // Only what is queued now; later commands wait for the next boundary
        let pending = self.commands.len();
        for _ in 0..pending {
            match self.commands.try_recv() {
                Ok(cmd) => self.apply_command(cmd),
                Err(_) => break,
            }
        }
    }

    fn apply_command(&mut self, cmd: GripperCommand) {
        debug!("Applying command: {:?}", cmd);
        match cmd {
            GripperCommand::Enable => self.enable(),
            GripperCommand::Disable => self.disable(),
            GripperCommand::AcknowledgeFault => self.acknowledge_fault(),
            GripperCommand::SetTarget { force_n } => {
                if !force_n.is_finite() || force_n < 0.0 {
                    warn!("Ignoring invalid target force {}", force_n);
                    return;
                }
                if self.state.mode != GripMode::ForceTracking {
                    info!("Switching to force tracking");
                    self.state.mode = GripMode::ForceTracking;
                    self.state.reset_pid();
                }
                info!("Target force set to {:.3} N", force_n);
                self.state.target_force_n = force_n;
            }
            GripperCommand::SetGains { kp, ki, kd, reset_integral } => {
                if [kp, ki, kd].iter().any(|g| !g.is_finite() || *g < 0.0) {
                    warn!("Ignoring invalid gains kp={} ki={} kd={}", kp, ki, kd);
                    return;
                }
                info!("Gains set to kp={} ki={} kd={}", kp, ki, kd);
                self.state.gains = PidGains::new(kp, ki, kd);
                if reset_integral {
                    self.state.reset_pid();
                }
            }
            GripperCommand::SetManualTorque { torque_nm } => {
                if !torque_nm.is_finite() {
                    warn!("Ignoring invalid manual torque {}", torque_nm);
                    return;
                }
                let limit = self.limits.torque_limit;
                let torque_nm = torque_nm.clamp(-limit, limit);
                info!("Manual torque {:.3} N·m", torque_nm);
                self.state.mode = GripMode::ManualTorque { torque_nm };
            }
            GripperCommand::ZeroCalibrate => {
                if self.zero_window.is_some() {
                    debug!("Zero calibration already in progress");
                    return;
                }
                info!("Zero calibration started, keep the pad unloaded");
                self.zero_window = Some(ZeroWindow {
                    frames: Vec::with_capacity(MIN_ZERO_FRAMES),
                    deadline_cycle: self.cycle + self.control.zero_calibration_cycles(),
                });
                self.calibration = CalibrationStatus::Collecting {
                    frames: 0,
                    needed: MIN_ZERO_FRAMES,
                };
            }
        }
    }

    fn enable(&mut self) {
        match self.state.motor_state {
            MotorState::Enabled => return,
            MotorState::Faulted => {
                warn!("Enable refused: fault must be acknowledged first");
                return;
            }
            MotorState::Disabled => {}
        }

        match self.transport.send(&damiao::enable_frame(&self.motor)) {
            Ok(()) => {
                self.state.apply(MotorEvent::Enable, None);
                self.missed_feedback = 0;
                info!("Motor enabled");
            }
            Err(e) => self.fault(FaultReason::Transport { message: e.to_string() }),
        }
    }

    fn disable(&mut self) {
        match self.state.motor_state {
            MotorState::Enabled => match self.transport.send(&damiao::disable_frame(&self.motor)) {
                Ok(()) => {
                    self.state.apply(MotorEvent::Disable, None);
                    info!("Motor disabled");
                }
                Err(e) => self.fault(FaultReason::Transport { message: e.to_string() }),
            },
            MotorState::Faulted => debug!("Disable while faulted: motor already disabled"),
            MotorState::Disabled => {}
        }
    }

    fn acknowledge_fault(&mut self) {
        if self.state.motor_state != MotorState::Faulted {
            debug!("No fault to acknowledge");
            return;
        }

        self.send_disable();
        if let Err(e) = self.transport.send(&damiao::clear_error_frame(&self.motor)) {
            warn!("Failed to send clear-error frame: {}", e);
        }
        info!("Fault acknowledged: {:?}", self.state.fault);
        self.state.apply(MotorEvent::Acknowledge, None);
        self.missed_feedback = 0;
    }

    fn read_sensor(&mut self) {
        let frame = match self.sensor.read_frame(self.control.io_timeout()) {
            Ok(Some(frame)) => {
                self.stale_cycles = 0;
                if let Some(window) = self.zero_window.as_mut() {
                    window.frames.push(frame);
                }
                Some(frame)
            }
            Ok(None) => {
                self.stale_cycles = self.stale_cycles.saturating_add(1);
                debug!("No pressure frame this cycle ({} stale)", self.stale_cycles);
                None
            }
            Err(e) => {
                self.stale_cycles = self.stale_cycles.saturating_add(1);
                warn!("Pressure sensor read failed: {} ({} stale)", e, self.stale_cycles);
                None
            }
        };

        // A window finishing this cycle must already apply to this cycle's force
        self.progress_zero_calibration();

        if let Some(frame) = frame {
            let zero = ZeroOffset::zero();
            let offset = self.offset.as_ref().unwrap_or(&zero);
            self.force = Some(aggregate(&frame, &self.table, offset));
        }

        if self.stale_cycles > self.control.staleness_threshold && self.state.enabled() {
            self.fault(FaultReason::SensorStale {
                cycles: self.stale_cycles,
            });
        }
    }

    fn progress_zero_calibration(&mut self) {
        let (collected, expired) = match &self.zero_window {
            Some(window) => (window.frames.len(), self.cycle >= window.deadline_cycle),
            None => return,
        };

        if collected < MIN_ZERO_FRAMES && !expired {
            self.calibration = CalibrationStatus::Collecting {
                frames: collected,
                needed: MIN_ZERO_FRAMES,
            };
            return;
        }

        let Some(window) = self.zero_window.take() else {
            return;
        };
        match zero_calibrate(&window.frames, &self.table) {
            Ok(offset) => {
                self.offset = Some(offset);
                self.calibration = CalibrationStatus::Calibrated;
                self.state.reset_pid();
            }
            Err(e) => {
                warn!("Zero calibration failed: {}", e);
                self.calibration = CalibrationStatus::Failed {
                    frames: collected,
                    needed: MIN_ZERO_FRAMES,
                    has_offset: self.offset.is_some(),
                };
            }
        }
    }

    fn compute_torque(&mut self) -> f32 {
        // Hold still while the unloaded baseline is being sampled
        if self.zero_window.is_some() {
            return 0.0;
        }

        match self.state.mode {
            GripMode::ManualTorque { torque_nm } => torque_nm.clamp(-self.limits.torque_limit, self.limits.torque_limit),
            GripMode::ForceTracking => {
                let Some(force) = self.force else {
                    return 0.0;
                };
                let (torque, pid) = pid::step(
                    self.state.target_force_n,
                    force.total_n,
                    self.control.period().as_secs_f32(),
                    &self.state.gains,
                    &self.limits,
                    &self.state.pid,
                );
                self.state.pid = pid;
                torque
            }
        }
    }

    fn command_motor(&mut self) {
        let torque = self.compute_torque();
        self.state.output_torque_nm = torque;
        self.discard_stale_frames();

        let frame = damiao::encode(&MotorCommand::torque_only(torque), &self.motor);
        if let Err(e) = self.transport.send(&frame) {
            self.fault(FaultReason::Transport { message: e.to_string() });
            return;
        }

        match self.receive_feedback() {
            Ok(Some(feedback)) => {
                self.missed_feedback = 0;
                self.feedback = Some(feedback);
                self.check_feedback(&feedback);
            }
            Ok(None) => {
                self.missed_feedback = self.missed_feedback.saturating_add(1);
                debug!("No motor feedback this cycle ({} missed)", self.missed_feedback);
                if self.missed_feedback > self.control.feedback_loss_threshold {
                    self.fault(FaultReason::FeedbackLost {
                        cycles: self.missed_feedback,
                    });
                }
            }
            Err(message) => self.fault(FaultReason::Transport { message }),
        }
    }

    /// Drop replies still buffered from earlier sends so feedback matches this command
    fn discard_stale_frames(&mut self) {
        for _ in 0..MAX_STALE_FRAMES {
            match self.transport.receive(Duration::ZERO) {
                Ok(Some(frame)) => debug!("Discarding stale frame 0x{:03X}", frame.id),
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// First decodable feedback frame within the I/O budget; bad frames are skipped
    fn receive_feedback(&mut self) -> Result<Option<MotorFeedback>, String> {
        let deadline = Instant::now() + self.control.io_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame: CanFrame = match self.transport.receive(remaining) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => return Err(e.to_string()),
            };

            match damiao::decode(&frame, &self.motor) {
                Ok(feedback) => return Ok(Some(feedback)),
                Err(e) => debug!("Discarding feedback frame 0x{:03X}: {}", frame.id, e),
            }

            if remaining == Duration::ZERO {
                return Ok(None);
            }
        }
    }

    fn check_feedback(&mut self, feedback: &MotorFeedback) {
        // Commanding the limit itself is normal; only torque beyond it is a fault
        let torque_bound = self.limits.torque_limit * (1.0 + self.control.torque_fault_margin);

        if feedback.status.is_fault() {
            self.fault(FaultReason::MotorReported {
                status: feedback.status,
            });
        } else if feedback.max_temperature() > self.control.max_temperature_c {
            self.fault(FaultReason::OverTemperature {
                celsius: feedback.max_temperature(),
            });
        } else if feedback.torque.abs() > torque_bound {
            self.fault(FaultReason::OverTorque {
                torque_nm: feedback.torque,
            });
        }
    }

    /// Enter `Faulted` and disable the motor; a no-op when already faulted
    fn fault(&mut self, reason: FaultReason) {
        if self.state.motor_state == MotorState::Faulted {
            return;
        }
        error!("Controller fault: {}", reason);
        self.state.apply(MotorEvent::Fault, Some(reason));
        self.send_disable();
    }

    fn send_disable(&mut self) {
        if let Err(e) = self.transport.send(&damiao::disable_frame(&self.motor)) {
            error!("Failed to send disable frame: {}", e);
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }
}
