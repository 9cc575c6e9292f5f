// DM-series joint motor CAN protocol
//
// MIT frame (8 bytes, big-endian bit packing):
//   [pos_hi, pos_lo, vel[11:4], vel[3:0]|kp[11:8], kp_lo, kd[11:4], kd[3:0]|tau[11:8], tau_lo]
// Feedback frame (8 bytes):
//   [status<<4 | id, pos_hi, pos_lo, vel[11:4], vel[3:0]|tau[11:8], tau_lo, t_mos, t_rotor]
// Control frames: [0xFF x 7, cmd] where cmd = 0xFC enable, 0xFD disable, 0xFB clear error

use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload length of MIT command and feedback frames
pub const FRAME_LEN: usize = 8;

const POSITION_BITS: u32 = 16;
const VELOCITY_BITS: u32 = 12;
const TORQUE_BITS: u32 = 12;
const GAIN_BITS: u32 = 12;

/// Control command bytes (last byte of a control frame)
const CONTROL_PREFIX: [u8; 7] = [0xFF; 7];
const CMD_ENABLE: u8 = 0xFC;
const CMD_DISABLE: u8 = 0xFD;
const CMD_CLEAR_ERROR: u8 = 0xFB;

/// A classic CAN data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            data: data.to_vec(),
        }
    }
}

/// Closed physical interval used for quantization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f32,
    pub max: f32,
}

impl Range {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub const fn symmetric(limit: f32) -> Self {
        Self::new(-limit, limit)
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.min;
        }
        value.clamp(self.min, self.max)
    }

    /// Size of one quantization step at the given bit width
    pub fn step(&self, bits: u32) -> f32 {
        self.span() / max_raw(bits) as f32
    }
}

/// Physical limits a motor family declares for its MIT frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorLimits {
    pub position: Range, // rad
    pub velocity: Range, // rad/s
    pub torque: Range,   // N·m
    pub kp: Range,
    pub kd: Range,
}

impl MotorLimits {
    const fn new(p_max: f32, v_max: f32, t_max: f32) -> Self {
        Self {
            position: Range::symmetric(p_max),
            velocity: Range::symmetric(v_max),
            torque: Range::symmetric(t_max),
            kp: Range::new(0.0, 500.0),
            kd: Range::new(0.0, 5.0),
        }
    }

    /// Rated torque magnitude (N·m)
    pub fn rated_torque(&self) -> f32 {
        self.torque.max.min(-self.torque.min)
    }
}

/// Supported motor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorFamily {
    #[serde(rename = "DM4310")]
    Dm4310,
    #[serde(rename = "DM4310_48V")]
    Dm4310V48,
    #[serde(rename = "DM4340")]
    Dm4340,
    #[serde(rename = "DM4340_48V")]
    Dm4340V48,
    #[serde(rename = "DM6006")]
    Dm6006,
    #[serde(rename = "DM8006")]
    Dm8006,
    #[serde(rename = "DM8009")]
    Dm8009,
    #[serde(rename = "DM10010L")]
    Dm10010L,
    #[serde(rename = "DM10010")]
    Dm10010,
    #[serde(rename = "DMH3510")]
    DmH3510,
    #[serde(rename = "DMH6215")]
    DmH6215,
    #[serde(rename = "DMG6220")]
    DmG6220,
}

impl MotorFamily {
    pub fn limits(self) -> MotorLimits {
        match self {
            MotorFamily::Dm4310 => MotorLimits::new(12.5, 30.0, 10.0),
            MotorFamily::Dm4310V48 => MotorLimits::new(12.5, 50.0, 10.0),
            MotorFamily::Dm4340 => MotorLimits::new(12.5, 8.0, 28.0),
            MotorFamily::Dm4340V48 => MotorLimits::new(12.5, 10.0, 28.0),
            MotorFamily::Dm6006 => MotorLimits::new(12.5, 45.0, 20.0),
            MotorFamily::Dm8006 => MotorLimits::new(12.5, 45.0, 40.0),
            MotorFamily::Dm8009 => MotorLimits::new(12.5, 45.0, 54.0),
            MotorFamily::Dm10010L => MotorLimits::new(12.5, 25.0, 200.0),
            MotorFamily::Dm10010 => MotorLimits::new(12.5, 20.0, 200.0),
            MotorFamily::DmH3510 => MotorLimits::new(12.5, 280.0, 1.0),
            MotorFamily::DmH6215 => MotorLimits::new(12.5, 45.0, 10.0),
            MotorFamily::DmG6220 => MotorLimits::new(12.5, 45.0, 10.0),
        }
    }
}

/// Control modes; each mode listens on the slave ID plus its offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Mit,
    PosVel,
    Vel,
}

impl ControlMode {
    pub fn id_offset(self) -> u32 {
        match self {
            ControlMode::Mit => 0x000,
            ControlMode::PosVel => 0x100,
            ControlMode::Vel => 0x200,
        }
    }
}

/// Static description of the driven motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub family: MotorFamily,
    pub mode: ControlMode,
    /// Slave (arbitration) ID the motor listens on
    pub can_id: u32,
    /// Master ID the motor answers on
    pub master_id: u32,
}

impl MotorConfig {
    pub fn limits(&self) -> MotorLimits {
        self.family.limits()
    }

    /// CAN ID that command and control frames are addressed to
    pub fn command_id(&self) -> u32 {
        self.can_id + self.mode.id_offset()
    }
}

/// Command in physical units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    pub kp: f32,
    pub kd: f32,
}

impl MotorCommand {
    /// Pure feed-forward torque command (kp = kd = 0)
    pub fn torque_only(torque: f32) -> Self {
        Self {
            torque,
            ..Self::default()
        }
    }
}

/// Status nibble reported in byte 0 of every feedback frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorStatus {
    Disabled,
    Enabled,
    OverVoltage,
    UnderVoltage,
    OverCurrent,
    MosOverTemperature,
    RotorOverTemperature,
    CommunicationLost,
    Overload,
    Unknown(u8),
}

impl MotorStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x0 => MotorStatus::Disabled,
            0x1 => MotorStatus::Enabled,
            0x8 => MotorStatus::OverVoltage,
            0x9 => MotorStatus::UnderVoltage,
            0xA => MotorStatus::OverCurrent,
            0xB => MotorStatus::MosOverTemperature,
            0xC => MotorStatus::RotorOverTemperature,
            0xD => MotorStatus::CommunicationLost,
            0xE => MotorStatus::Overload,
            other => MotorStatus::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MotorStatus::Disabled => 0x0,
            MotorStatus::Enabled => 0x1,
            MotorStatus::OverVoltage => 0x8,
            MotorStatus::UnderVoltage => 0x9,
            MotorStatus::OverCurrent => 0xA,
            MotorStatus::MosOverTemperature => 0xB,
            MotorStatus::RotorOverTemperature => 0xC,
            MotorStatus::CommunicationLost => 0xD,
            MotorStatus::Overload => 0xE,
            MotorStatus::Unknown(code) => code & 0x0F,
        }
    }

    pub fn is_fault(self) -> bool {
        !matches!(self, MotorStatus::Disabled | MotorStatus::Enabled)
    }
}

impl fmt::Display for MotorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:X})", self, self.code())
    }
}

/// Decoded feedback in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorFeedback {
    pub status: MotorStatus,
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    pub mos_temperature: f32,   // °C
    pub rotor_temperature: f32, // °C
}

impl MotorFeedback {
    pub fn max_temperature(&self) -> f32 {
        self.mos_temperature.max(self.rotor_temperature)
    }
}

/// Error types for feedback decoding
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("ID mismatch: expected 0x{expected:X}, got 0x{actual:X}")]
    IdMismatch { expected: u32, actual: u32 },
}

fn max_raw(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

/// Quantize a physical value into `bits`, clamping to the range first
fn float_to_uint(value: f32, range: Range, bits: u32) -> u32 {
    let clamped = range.clamp(value);
    let scaled = (clamped - range.min) * max_raw(bits) as f32 / range.span();
    (scaled.round() as u32).min(max_raw(bits))
}

fn uint_to_float(raw: u32, range: Range, bits: u32) -> f32 {
    raw as f32 * range.span() / max_raw(bits) as f32 + range.min
}

/// Encode a command for the configured control mode
pub fn encode(command: &MotorCommand, config: &MotorConfig) -> CanFrame {
    let limits = config.limits();
    let id = config.command_id();

    match config.mode {
        ControlMode::Mit => {
            let p = float_to_uint(command.position, limits.position, POSITION_BITS);
            let v = float_to_uint(command.velocity, limits.velocity, VELOCITY_BITS);
            let kp = float_to_uint(command.kp, limits.kp, GAIN_BITS);
            let kd = float_to_uint(command.kd, limits.kd, GAIN_BITS);
            let t = float_to_uint(command.torque, limits.torque, TORQUE_BITS);

            let data = [
                (p >> 8) as u8,
                (p & 0xFF) as u8,
                (v >> 4) as u8,
                (((v & 0xF) << 4) | (kp >> 8)) as u8,
                (kp & 0xFF) as u8,
                (kd >> 4) as u8,
                (((kd & 0xF) << 4) | (t >> 8)) as u8,
                (t & 0xFF) as u8,
            ];
            CanFrame::new(id, &data)
        }
        ControlMode::PosVel => {
            let mut data = [0u8; 8];
            data[..4].copy_from_slice(&limits.position.clamp(command.position).to_le_bytes());
            data[4..].copy_from_slice(&limits.velocity.clamp(command.velocity).to_le_bytes());
            CanFrame::new(id, &data)
        }
        ControlMode::Vel => {
            let data = limits.velocity.clamp(command.velocity).to_le_bytes();
            CanFrame::new(id, &data)
        }
    }
}

/// Decode an MIT command frame back into physical units
pub fn decode_command(frame: &CanFrame, config: &MotorConfig) -> Result<MotorCommand, DecodeError> {
    check_len(frame)?;
    if frame.id != config.command_id() {
        return Err(DecodeError::IdMismatch {
            expected: config.command_id(),
            actual: frame.id,
        });
    }

    let limits = config.limits();
    let d = &frame.data;
    let p = (d[0] as u32) << 8 | d[1] as u32;
    let v = (d[2] as u32) << 4 | (d[3] as u32) >> 4;
    let kp = (d[3] as u32 & 0xF) << 8 | d[4] as u32;
    let kd = (d[5] as u32) << 4 | (d[6] as u32) >> 4;
    let t = (d[6] as u32 & 0xF) << 8 | d[7] as u32;

    Ok(MotorCommand {
        position: uint_to_float(p, limits.position, POSITION_BITS),
        velocity: uint_to_float(v, limits.velocity, VELOCITY_BITS),
        torque: uint_to_float(t, limits.torque, TORQUE_BITS),
        kp: uint_to_float(kp, limits.kp, GAIN_BITS),
        kd: uint_to_float(kd, limits.kd, GAIN_BITS),
    })
}

/// Decode a feedback frame received from the motor
pub fn decode(frame: &CanFrame, config: &MotorConfig) -> Result<MotorFeedback, DecodeError> {
    check_len(frame)?;

    let d = &frame.data;
    let reported_id = (d[0] & 0x0F) as u32;
    if frame.id != config.master_id {
        return Err(DecodeError::IdMismatch {
            expected: config.master_id,
            actual: frame.id,
        });
    }
    if reported_id != config.can_id & 0x0F {
        return Err(DecodeError::IdMismatch {
            expected: config.can_id,
            actual: reported_id,
        });
    }

    let limits = config.limits();
    let p = (d[1] as u32) << 8 | d[2] as u32;
    let v = (d[3] as u32) << 4 | (d[4] as u32) >> 4;
    let t = (d[4] as u32 & 0xF) << 8 | d[5] as u32;

    Ok(MotorFeedback {
        status: MotorStatus::from_code(d[0] >> 4),
        position: uint_to_float(p, limits.position, POSITION_BITS),
        velocity: uint_to_float(v, limits.velocity, VELOCITY_BITS),
        torque: uint_to_float(t, limits.torque, TORQUE_BITS),
        mos_temperature: d[6] as f32,
        rotor_temperature: d[7] as f32,
    })
}

/// Encode a feedback frame as the motor would send it
pub fn encode_feedback(feedback: &MotorFeedback, config: &MotorConfig) -> CanFrame {
    let limits = config.limits();
    let p = float_to_uint(feedback.position, limits.position, POSITION_BITS);
    let v = float_to_uint(feedback.velocity, limits.velocity, VELOCITY_BITS);
    let t = float_to_uint(feedback.torque, limits.torque, TORQUE_BITS);

    let data = [
        (feedback.status.code() << 4) | (config.can_id & 0x0F) as u8,
        (p >> 8) as u8,
        (p & 0xFF) as u8,
        (v >> 4) as u8,
        (((v & 0xF) << 4) | (t >> 8)) as u8,
        (t & 0xFF) as u8,
        feedback.mos_temperature.clamp(0.0, 255.0) as u8,
        feedback.rotor_temperature.clamp(0.0, 255.0) as u8,
    ];
    CanFrame::new(config.master_id, &data)
}

fn check_len(frame: &CanFrame) -> Result<(), DecodeError> {
    if frame.data.len() != FRAME_LEN {
        return Err(DecodeError::MalformedFrame {
            expected: FRAME_LEN,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

fn control_frame(config: &MotorConfig, cmd: u8) -> CanFrame {
    let mut data = [0u8; FRAME_LEN];
    data[..7].copy_from_slice(&CONTROL_PREFIX);
    data[7] = cmd;
    CanFrame::new(config.command_id(), &data)
}

pub fn enable_frame(config: &MotorConfig) -> CanFrame {
    control_frame(config, CMD_ENABLE)
}

pub fn disable_frame(config: &MotorConfig) -> CanFrame {
    control_frame(config, CMD_DISABLE)
}

pub fn clear_error_frame(config: &MotorConfig) -> CanFrame {
    control_frame(config, CMD_CLEAR_ERROR)
}

/// Which control frame this is, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Enable,
    Disable,
    ClearError,
}

pub fn control_kind(frame: &CanFrame) -> Option<ControlFrame> {
    if frame.data.len() != FRAME_LEN || frame.data[..7] != CONTROL_PREFIX {
        return None;
    }
    match frame.data[7] {
        CMD_ENABLE => Some(ControlFrame::Enable),
        CMD_DISABLE => Some(ControlFrame::Disable),
        CMD_CLEAR_ERROR => Some(ControlFrame::ClearError),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm4310() -> MotorConfig {
        MotorConfig {
            family: MotorFamily::Dm4310,
            mode: ControlMode::Mit,
            can_id: 0x01,
            master_id: 0x11,
        }
    }

    #[test]
    fn test_zero_command_encoding() {
        // p=0, v=0, kp=0, kd=0, tau=0 sits at the midpoint of each symmetric range
        let frame = encode(&MotorCommand::default(), &dm4310());
        assert_eq!(frame.id, 0x01);
        assert_eq!(frame.data, vec![0x80, 0x00, 0x80, 0x00, 0x00, 0x00, 0x08, 0x00]);
    }

    #[test]
    fn test_command_round_trip_within_one_step() {
        let config = dm4310();
        let limits = config.limits();
        let commands = [
            MotorCommand { position: 1.234, velocity: -3.5, torque: 0.15, kp: 12.0, kd: 0.8 },
            MotorCommand { position: -12.5, velocity: 30.0, torque: -10.0, kp: 500.0, kd: 0.0 },
            MotorCommand { position: 7.77, velocity: 0.01, torque: 9.99, kp: 0.0, kd: 5.0 },
        ];

        for cmd in commands {
            let decoded = decode_command(&encode(&cmd, &config), &config).unwrap();
            assert!((decoded.position - cmd.position).abs() <= limits.position.step(POSITION_BITS));
            assert!((decoded.velocity - cmd.velocity).abs() <= limits.velocity.step(VELOCITY_BITS));
            assert!((decoded.torque - cmd.torque).abs() <= limits.torque.step(TORQUE_BITS));
            assert!((decoded.kp - cmd.kp).abs() <= limits.kp.step(GAIN_BITS));
            assert!((decoded.kd - cmd.kd).abs() <= limits.kd.step(GAIN_BITS));
        }
    }

    #[test]
    fn test_out_of_range_clamps_instead_of_wrapping() {
        let config = dm4310();
        let cmd = MotorCommand { position: 100.0, velocity: -100.0, torque: 50.0, kp: -1.0, kd: 9.0 };
        let decoded = decode_command(&encode(&cmd, &config), &config).unwrap();

        assert_eq!(decoded.position, 12.5);
        assert_eq!(decoded.velocity, -30.0);
        assert_eq!(decoded.torque, 10.0);
        assert_eq!(decoded.kp, 0.0);
        assert_eq!(decoded.kd, 5.0);
    }

    #[test]
    fn test_feedback_round_trip() {
        let config = dm4310();
        let limits = config.limits();
        let feedback = MotorFeedback {
            status: MotorStatus::Enabled,
            position: -0.42,
            velocity: 2.5,
            torque: 0.3,
            mos_temperature: 41.0,
            rotor_temperature: 37.0,
        };

        let frame = encode_feedback(&feedback, &config);
        assert_eq!(frame.id, 0x11);
        assert_eq!(frame.data[0], 0x11); // status 1, id 1

        let decoded = decode(&frame, &config).unwrap();
        assert_eq!(decoded.status, MotorStatus::Enabled);
        assert!((decoded.position - feedback.position).abs() <= limits.position.step(POSITION_BITS));
        assert!((decoded.velocity - feedback.velocity).abs() <= limits.velocity.step(VELOCITY_BITS));
        assert!((decoded.torque - feedback.torque).abs() <= limits.torque.step(TORQUE_BITS));
        assert_eq!(decoded.mos_temperature, 41.0);
        assert_eq!(decoded.rotor_temperature, 37.0);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let frame = CanFrame::new(0x11, &[0x11, 0x80, 0x00]);
        assert_eq!(
            decode(&frame, &dm4310()),
            Err(DecodeError::MalformedFrame { expected: 8, actual: 3 })
        );
    }

    #[test]
    fn test_decode_rejects_other_motor() {
        let config = dm4310();
        let mut frame = encode_feedback(
            &MotorFeedback {
                status: MotorStatus::Enabled,
                position: 0.0,
                velocity: 0.0,
                torque: 0.0,
                mos_temperature: 30.0,
                rotor_temperature: 30.0,
            },
            &config,
        );
        frame.data[0] = 0x12; // motor 2 answering on our master ID

        assert_eq!(
            decode(&frame, &config),
            Err(DecodeError::IdMismatch { expected: 0x01, actual: 0x02 })
        );

        frame.data[0] = 0x11;
        frame.id = 0x12;
        assert!(matches!(decode(&frame, &config), Err(DecodeError::IdMismatch { .. })));
    }

    #[test]
    fn test_fault_status_decoding() {
        let config = dm4310();
        let mut frame = encode(&MotorCommand::default(), &config);
        frame.id = config.master_id;
        frame.data[0] = 0xB1; // MOS over-temperature from motor 1

        let feedback = decode(&frame, &config).unwrap();
        assert_eq!(feedback.status, MotorStatus::MosOverTemperature);
        assert!(feedback.status.is_fault());
        assert!(!MotorStatus::Enabled.is_fault());
    }

    #[test]
    fn test_control_frames() {
        let config = dm4310();
        let enable = enable_frame(&config);
        let disable = disable_frame(&config);

        assert_eq!(enable.data, vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC]);
        assert_eq!(disable.data, vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFD]);
        assert_eq!(control_kind(&enable), Some(ControlFrame::Enable));
        assert_eq!(control_kind(&disable), Some(ControlFrame::Disable));
        assert_eq!(control_kind(&clear_error_frame(&config)), Some(ControlFrame::ClearError));
        assert_eq!(control_kind(&encode(&MotorCommand::default(), &config)), None);
    }

    #[test]
    fn test_mode_id_offsets() {
        let config = MotorConfig { mode: ControlMode::PosVel, ..dm4310() };
        let frame = encode(&MotorCommand { position: 1.5, velocity: 2.0, ..Default::default() }, &config);
        assert_eq!(frame.id, 0x101);
        assert_eq!(f32::from_le_bytes(frame.data[..4].try_into().unwrap()), 1.5);
        assert_eq!(enable_frame(&config).id, 0x101);

        let config = MotorConfig { mode: ControlMode::Vel, ..dm4310() };
        let frame = encode(&MotorCommand { velocity: 99.0, ..Default::default() }, &config);
        assert_eq!(frame.id, 0x201);
        assert_eq!(frame.data.len(), 4);
        assert_eq!(f32::from_le_bytes(frame.data[..4].try_into().unwrap()), 30.0);
    }
}
