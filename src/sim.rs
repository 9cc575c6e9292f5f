// Simulated motor bus and pressure array
//
// Used by `--simulate` and by the control loop tests. The simulated motor speaks the
// real DM frame format and the simulated sensor emits real 78-byte frames, so the
// codec and parser run exactly as they do against hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::motor::damiao::{self, CanFrame, ControlFrame, MotorConfig, MotorFeedback, MotorStatus};
use crate::motor::transport::{Result, Transport, TransportError};
use crate::sensor::calibration::{CalibrationTable, SITE_AREA_M2};
use crate::sensor::frame::{FrameParser, ParserStats, PressureFrame, SENSOR_COUNT};
use crate::sensor::{PressureSource, SensorError};

pub const SIM_IDENTITY: &str = "SIM-USB-CAN-0001";

struct SimBus {
    identity: String,
    config: MotorConfig,
    sent: Vec<CanFrame>,
    rx: VecDeque<CanFrame>,
    interleaved: Vec<CanFrame>,
    enabled: bool,
    responsive: bool,
    fail_sends: bool,
    fail_receives: bool,
    external_torque: f32,
    status_override: Option<MotorStatus>,
    temperature: f32,
    torque: f32,
}

/// Test/inspection handle shared with a `SimMotor`
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Mutex<SimBus>>,
}

impl SimHandle {
    fn bus(&self) -> MutexGuard<'_, SimBus> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every frame the controller has sent, in order
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.bus().sent.clone()
    }

    pub fn count_control(&self, kind: ControlFrame) -> usize {
        self.bus()
            .sent
            .iter()
            .filter(|f| damiao::control_kind(f) == Some(kind))
            .count()
    }

    /// Number of MIT command frames (anything that is not a control frame)
    pub fn count_commands(&self) -> usize {
        self.bus()
            .sent
            .iter()
            .filter(|f| damiao::control_kind(f).is_none())
            .count()
    }

    pub fn is_enabled(&self) -> bool {
        self.bus().enabled
    }

    /// Torque the motor is currently applying
    pub fn torque(&self) -> f32 {
        self.bus().torque
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.bus().responsive = responsive;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.bus().fail_sends = fail;
    }

    pub fn set_fail_receives(&self, fail: bool) {
        self.bus().fail_receives = fail;
    }

    /// Load torque the motor reports on top of what it applies
    pub fn set_external_torque(&self, torque_nm: f32) {
        self.bus().external_torque = torque_nm;
    }

    pub fn set_temperature(&self, celsius: f32) {
        self.bus().temperature = celsius;
    }

    /// Make the motor report `status` until an error clear frame arrives
    pub fn inject_status(&self, status: MotorStatus) {
        self.bus().status_override = Some(status);
    }

    /// Deliver a raw frame right after the next sent frame, ahead of the motor's reply
    pub fn interleave(&self, frame: CanFrame) {
        self.bus().interleaved.push(frame);
    }
}

/// Simulated DM motor behind a USB-CAN adapter
pub struct SimMotor {
    handle: SimHandle,
}

impl SimMotor {
    pub fn new(config: MotorConfig) -> (Self, SimHandle) {
        Self::with_identity(config, SIM_IDENTITY)
    }

    pub fn with_identity(config: MotorConfig, identity: &str) -> (Self, SimHandle) {
        let handle = SimHandle {
            shared: Arc::new(Mutex::new(SimBus {
                identity: identity.to_string(),
                config,
                sent: Vec::new(),
                rx: VecDeque::new(),
                interleaved: Vec::new(),
                enabled: false,
                responsive: true,
                fail_sends: false,
                fail_receives: false,
                external_torque: 0.0,
                status_override: None,
                temperature: 30.0,
                torque: 0.0,
            })),
        };
        (Self { handle: handle.clone() }, handle)
    }
}

impl Transport for SimMotor {
    fn identify(&mut self) -> Result<String> {
        Ok(self.handle.bus().identity.clone())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut bus = self.handle.bus();
        if bus.fail_sends {
            return Err(TransportError::Disconnected);
        }
        bus.sent.push(frame.clone());
        let interleaved = std::mem::take(&mut bus.interleaved);
        bus.rx.extend(interleaved);

        match damiao::control_kind(frame) {
            Some(ControlFrame::Enable) => bus.enabled = true,
            Some(ControlFrame::Disable) => {
                bus.enabled = false;
                bus.torque = 0.0;
            }
            Some(ControlFrame::ClearError) => bus.status_override = None,
            None => {
                if let Ok(cmd) = damiao::decode_command(frame, &bus.config) {
                    bus.torque = if bus.enabled { cmd.torque } else { 0.0 };
                }
            }
        }

        if bus.responsive {
            let status = bus.status_override.unwrap_or(if bus.enabled {
                MotorStatus::Enabled
            } else {
                MotorStatus::Disabled
            });
            let feedback = MotorFeedback {
                status,
                position: 0.0,
                velocity: 0.0,
                torque: bus.torque + bus.external_torque,
                mos_temperature: bus.temperature,
                rotor_temperature: bus.temperature,
            };
            let reply = damiao::encode_feedback(&feedback, &bus.config);
            bus.rx.push_back(reply);
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<CanFrame>> {
        let mut bus = self.handle.bus();
        if bus.fail_receives {
            return Err(TransportError::Disconnected);
        }
        Ok(bus.rx.pop_front())
    }
}

/// One scripted sensor read
#[derive(Debug, Clone)]
pub enum SensorStep {
    Frame([u16; SENSOR_COUNT]),
    Bytes(Vec<u8>),
    Timeout,
}

/// Grip contact: force follows motor torque through a first-order lag
#[derive(Debug, Clone)]
pub struct GripPlant {
    pub force_n: f32,
    pub stiffness_n_per_nm: f32,
    pub lag: f32,
    /// Raw reading of every site with nothing touching the pad
    pub idle_raw: u16,
}

impl Default for GripPlant {
    fn default() -> Self {
        Self {
            force_n: 0.0,
            stiffness_n_per_nm: 0.5,
            lag: 0.2,
            idle_raw: 200,
        }
    }
}

impl GripPlant {
    pub fn advance(&mut self, torque_nm: f32) {
        let target = (torque_nm * self.stiffness_n_per_nm).max(0.0);
        self.force_n += (target - self.force_n) * self.lag;
    }

    /// Raw samples for the current force, spread evenly over the pad
    pub fn samples(&self, table: &CalibrationTable) -> [u16; SENSOR_COUNT] {
        let site_kpa = self.force_n / SENSOR_COUNT as f32 / (1000.0 * SITE_AREA_M2);
        let mut samples = [0u16; SENSOR_COUNT];
        for (site, sample) in samples.iter_mut().enumerate() {
            let slope = table.entry(site).slope;
            let extra = if slope > 0.0 { site_kpa / slope } else { 0.0 };
            *sample = (self.idle_raw as f32 + extra).round().clamp(0.0, u16::MAX as f32) as u16;
        }
        samples
    }
}

enum Feed {
    Scripted(VecDeque<SensorStep>),
    Constant([u16; SENSOR_COUNT]),
    Coupled {
        motor: SimHandle,
        plant: GripPlant,
        table: CalibrationTable,
    },
}

/// Simulated pressure array on a serial link
pub struct SimSensor {
    feed: Feed,
    parser: FrameParser,
}

impl SimSensor {
    /// Plays `steps` in order, then times out forever
    pub fn scripted(steps: impl IntoIterator<Item = SensorStep>) -> Self {
        Self::from_feed(Feed::Scripted(steps.into_iter().collect()))
    }

    pub fn constant(samples: [u16; SENSOR_COUNT]) -> Self {
        Self::from_feed(Feed::Constant(samples))
    }

    /// Pad pressed by the simulated motor
    pub fn coupled(motor: SimHandle, table: CalibrationTable) -> Self {
        Self::from_feed(Feed::Coupled {
            motor,
            plant: GripPlant::default(),
            table,
        })
    }

    fn from_feed(feed: Feed) -> Self {
        Self {
            feed,
            parser: FrameParser::new(),
        }
    }

    fn next_bytes(&mut self) -> Option<Vec<u8>> {
        match &mut self.feed {
            Feed::Scripted(steps) => match steps.pop_front()? {
                SensorStep::Frame(samples) => Some(PressureFrame::new(samples).to_bytes().to_vec()),
                SensorStep::Bytes(bytes) => Some(bytes),
                SensorStep::Timeout => None,
            },
            Feed::Constant(samples) => Some(PressureFrame::new(*samples).to_bytes().to_vec()),
            Feed::Coupled { motor, plant, table } => {
                plant.advance(motor.torque());
                Some(PressureFrame::new(plant.samples(table)).to_bytes().to_vec())
            }
        }
    }
}

impl PressureSource for SimSensor {
    fn read_frame(&mut self, _timeout: Duration) -> std::result::Result<Option<PressureFrame>, SensorError> {
        if let Some(bytes) = self.next_bytes() {
            self.parser.push(&bytes);
        }
        Ok(self.parser.drain_latest())
    }

    fn stats(&self) -> ParserStats {
        self.parser.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{ControlMode, MotorCommand, MotorFamily};
    use crate::sensor::{ZeroOffset, aggregate, zero_calibrate};

    fn config() -> MotorConfig {
        MotorConfig {
            family: MotorFamily::Dm4310,
            mode: ControlMode::Mit,
            can_id: 0x01,
            master_id: 0x11,
        }
    }

    #[test]
    fn test_motor_only_applies_torque_when_enabled() {
        let config = config();
        let (mut motor, handle) = SimMotor::new(config);

        motor.send(&damiao::encode(&MotorCommand::torque_only(0.3), &config)).unwrap();
        assert_eq!(handle.torque(), 0.0);

        motor.send(&damiao::enable_frame(&config)).unwrap();
        motor.send(&damiao::encode(&MotorCommand::torque_only(0.3), &config)).unwrap();
        assert!((handle.torque() - 0.3).abs() < 0.01);

        // Three replies queued, the last carrying the applied torque
        let replies: Vec<_> = std::iter::from_fn(|| motor.receive(Duration::ZERO).unwrap()).collect();
        assert_eq!(replies.len(), 3);
        let feedback = damiao::decode(&replies[2], &config).unwrap();
        assert_eq!(feedback.status, MotorStatus::Enabled);
    }

    #[test]
    fn test_scripted_sensor_resyncs_through_garbage() {
        let samples = [321u16; SENSOR_COUNT];
        let mut sensor = SimSensor::scripted([
            SensorStep::Bytes(vec![0xFF, 0x00, 0x66]),
            SensorStep::Frame(samples),
            SensorStep::Timeout,
        ]);

        assert_eq!(sensor.read_frame(Duration::ZERO).unwrap(), None);
        assert_eq!(sensor.read_frame(Duration::ZERO).unwrap().map(|f| f.samples), Some(samples));
        assert_eq!(sensor.read_frame(Duration::ZERO).unwrap(), None);
        assert_eq!(sensor.read_frame(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_plant_force_reads_back_through_calibration() {
        let table = CalibrationTable::factory();
        let mut plant = GripPlant::default();

        let idle = PressureFrame::new(plant.samples(&table));
        let offset = zero_calibrate(&[idle; 10], &table).unwrap();
        assert!(aggregate(&idle, &table, &offset).total_n.abs() < 1e-4);

        plant.force_n = 0.5;
        let loaded = PressureFrame::new(plant.samples(&table));
        let force = aggregate(&loaded, &table, &offset).total_n;
        assert!((force - 0.5).abs() < 0.1, "force {}", force);
        assert!(aggregate(&loaded, &table, &ZeroOffset::zero()).total_n > force);
    }
}
