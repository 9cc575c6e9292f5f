// Pressure array over a USB serial link

use serialport::{self, SerialPort};
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::frame::{FRAME_SIZE, FrameParser, ParserStats, PressureFrame};
use super::{PressureSource, SensorError};

pub const DEFAULT_BAUDRATE: u32 = 460_800;
pub const DEFAULT_TIMEOUT_MS: u64 = 5;

pub struct SerialPressureSource {
    port: Box<dyn SerialPort>,
    parser: FrameParser,
}

impl SerialPressureSource {
    pub fn open(port_name: &str) -> Result<Self, SensorError> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self, SensorError> {
        info!("Opening pressure sensor on {} @ {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port,
            parser: FrameParser::new(),
        })
    }
}

impl PressureSource for SerialPressureSource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<PressureFrame>, SensorError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; FRAME_SIZE * 2];
        let mut latest = self.parser.drain_latest();

        loop {
            // Once we hold a frame, only keep reading while bytes are already waiting
            if latest.is_some() && self.port.bytes_to_read()? == 0 {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.port.set_timeout(deadline - now)?;

            match self.port.read(&mut chunk) {
                Ok(0) => return Err(SensorError::Disconnected),
                Ok(n) => {
                    self.parser.push(&chunk[..n]);
                    if let Some(frame) = self.parser.drain_latest() {
                        latest = Some(frame);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(SensorError::Io(e)),
            }
        }

        if latest.is_none() {
            debug!("No pressure frame within {:?} ({} bytes buffered)", timeout, self.parser.buffered());
        }
        Ok(latest)
    }

    fn stats(&self) -> ParserStats {
        self.parser.stats()
    }
}
