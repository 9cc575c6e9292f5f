// Serial USB-CAN adapter for DM motors
//
// Send frame (30 bytes):
//   [0x55, 0xAA, len=0x1E, cmd=0x03, count(u32 LE), interval(u32 LE), id_type,
//    can_id(u32 LE), frame_type, dlc, id_acc, data_acc, data[8], crc]
// Receive frame (16 bytes):
//   [0xAA, cmd, flags, can_id(u32 LE), data[8], 0x55]

use serialport::{self, SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use super::damiao::{CanFrame, FRAME_LEN};
use super::transport::{Result, Transport, TransportError};

/// Default serial configuration for the adapter
pub const DEFAULT_BAUDRATE: u32 = 921_600;
pub const DEFAULT_TIMEOUT_MS: u64 = 2;

const TX_HEADER: [u8; 2] = [0x55, 0xAA];
const TX_LEN: usize = 30;
const TX_CMD_SEND: u8 = 0x03;

const RX_HEAD: u8 = 0xAA;
const RX_TAIL: u8 = 0x55;
const RX_LEN: usize = 16;
const RX_CMD_FRAME: u8 = 0x11;

/// USB-CAN adapter attached as a serial device
pub struct UsbCanAdapter {
    port_name: String,
    port: Box<dyn SerialPort>,
    rx_buffer: Vec<u8>,
}

impl UsbCanAdapter {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port_name: port_name.to_string(),
            port,
            rx_buffer: Vec::with_capacity(RX_LEN * 4),
        })
    }

    /// Build the 30-byte adapter packet for one CAN frame
    fn build_packet(frame: &CanFrame) -> Result<[u8; TX_LEN]> {
        if frame.data.len() > FRAME_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "{} data bytes exceed classic CAN payload",
                frame.data.len()
            )));
        }

        let mut packet = [0u8; TX_LEN];
        packet[..2].copy_from_slice(&TX_HEADER);
        packet[2] = TX_LEN as u8;
        packet[3] = TX_CMD_SEND;
        packet[4..8].copy_from_slice(&1u32.to_le_bytes()); // send once
        packet[8..12].copy_from_slice(&10u32.to_le_bytes()); // retry interval
        packet[12] = 0x00; // standard ID
        packet[13..17].copy_from_slice(&frame.id.to_le_bytes());
        packet[17] = 0x00; // data frame
        packet[18] = frame.data.len() as u8;
        packet[19] = 0x00;
        packet[20] = 0x00;
        packet[21..21 + frame.data.len()].copy_from_slice(&frame.data);
        packet[29] = 0x00;

        Ok(packet)
    }

    /// Pull the next complete receive packet out of `buffer`, resyncing on the head byte
    fn take_packet(buffer: &mut Vec<u8>) -> Option<CanFrame> {
        loop {
            let start = buffer.iter().position(|&b| b == RX_HEAD)?;
            if start > 0 {
                buffer.drain(..start);
            }
            if buffer.len() < RX_LEN {
                return None;
            }
            if buffer[RX_LEN - 1] != RX_TAIL {
                buffer.drain(..1);
                continue;
            }

            let packet: Vec<u8> = buffer.drain(..RX_LEN).collect();
            if packet[1] != RX_CMD_FRAME {
                debug!("Skipping adapter packet with cmd 0x{:02X}", packet[1]);
                continue;
            }

            let id = u32::from_le_bytes([packet[3], packet[4], packet[5], packet[6]]);
            return Some(CanFrame::new(id, &packet[7..15]));
        }
    }
}

impl Transport for UsbCanAdapter {
    fn identify(&mut self) -> Result<String> {
        let ports = serialport::available_ports()?;
        let info = ports
            .into_iter()
            .find(|p| p.port_name == self.port_name)
            .ok_or_else(|| TransportError::AdapterNotFound(self.port_name.clone()))?;

        match info.port_type {
            SerialPortType::UsbPort(usb) => usb
                .serial_number
                .ok_or_else(|| TransportError::AdapterNotFound(format!("{} has no serial number", self.port_name))),
            other => Err(TransportError::AdapterNotFound(format!(
                "{} is not a USB device ({:?})",
                self.port_name, other
            ))),
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let packet = Self::build_packet(frame)?;
        debug!("CAN tx id=0x{:03X} data={:02X?}", frame.id, frame.data);
        self.port.write_all(&packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; RX_LEN * 4];

        loop {
            if let Some(frame) = Self::take_packet(&mut self.rx_buffer) {
                debug!("CAN rx id=0x{:03X} data={:02X?}", frame.id, frame.data);
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.port.set_timeout(deadline - now)?;

            match self.port.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => self.rx_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}
