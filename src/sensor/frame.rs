// Pressure array serial protocol
//
// Frame format (78 bytes):
//   [0xFF, 0x66, reserved x2, 36 x u16 big-endian samples, checksum u16 big-endian]
// The checksum is the 16-bit wrapping sum of every byte between the header and the checksum.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of sensing sites on the array
pub const SENSOR_COUNT: usize = 36;

pub const HEADER: [u8; 2] = [0xFF, 0x66];
pub const FRAME_SIZE: usize = 78;

const PAYLOAD_START: usize = 2;
const SAMPLES_START: usize = 4;
const CHECKSUM_START: usize = FRAME_SIZE - 2;

/// One validated frame of raw samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureFrame {
    pub samples: [u16; SENSOR_COUNT],
    pub valid: bool,
}

impl PressureFrame {
    pub fn new(samples: [u16; SENSOR_COUNT]) -> Self {
        Self { samples, valid: true }
    }

    /// Serialize as the sensor would send it (reserved bytes zeroed)
    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[..2].copy_from_slice(&HEADER);
        for (i, sample) in self.samples.iter().enumerate() {
            let at = SAMPLES_START + i * 2;
            bytes[at..at + 2].copy_from_slice(&sample.to_be_bytes());
        }
        let sum = checksum(&bytes[PAYLOAD_START..CHECKSUM_START]);
        bytes[CHECKSUM_START..].copy_from_slice(&sum.to_be_bytes());
        bytes
    }
}

/// Error types for frame parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Incomplete frame: {available} of {} bytes buffered", FRAME_SIZE)]
    Incomplete { available: usize },

    #[error("Invalid header: {0:02X?}")]
    BadHeader([u8; 2]),

    #[error("Checksum mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    ChecksumFailed { computed: u16, received: u16 },
}

pub fn checksum(payload: &[u8]) -> u16 {
    payload.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Validate and decode a frame starting at the first byte of `data`
pub fn parse(data: &[u8]) -> Result<PressureFrame, ParseError> {
    if data.len() < FRAME_SIZE {
        return Err(ParseError::Incomplete { available: data.len() });
    }
    if data[..2] != HEADER {
        return Err(ParseError::BadHeader([data[0], data[1]]));
    }

    let computed = checksum(&data[PAYLOAD_START..CHECKSUM_START]);
    let received = u16::from_be_bytes([data[CHECKSUM_START], data[CHECKSUM_START + 1]]);
    if computed != received {
        return Err(ParseError::ChecksumFailed { computed, received });
    }

    let mut samples = [0u16; SENSOR_COUNT];
    for (i, sample) in samples.iter_mut().enumerate() {
        let at = SAMPLES_START + i * 2;
        *sample = u16::from_be_bytes([data[at], data[at + 1]]);
    }

    Ok(PressureFrame::new(samples))
}

/// Counters kept by the streaming parser
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserStats {
    pub frames: u64,
    pub checksum_failures: u64,
    pub discarded_bytes: u64,
}

/// Streaming parser over a serial byte stream
///
/// Bytes are buffered until a complete frame is available. On a bad frame exactly
/// one byte is dropped before rescanning, so a corrupted frame never swallows the
/// valid frame that follows it.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    stats: ParserStats,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Try to take the next frame out of the buffer
    pub fn next_frame(&mut self) -> Result<PressureFrame, ParseError> {
        match self.buffer.windows(2).position(|w| w == HEADER) {
            Some(0) => {}
            Some(pos) => self.discard(pos),
            None => {
                // Keep a trailing 0xFF, it may be the first half of a header
                let keep = usize::from(self.buffer.last() == Some(&HEADER[0]));
                let stale = self.buffer.len() - keep;
                self.discard(stale);
                return Err(ParseError::Incomplete { available: self.buffer.len() });
            }
        }

        match parse(&self.buffer) {
            Ok(frame) => {
                self.buffer.drain(..FRAME_SIZE);
                self.stats.frames += 1;
                Ok(frame)
            }
            Err(e @ ParseError::Incomplete { .. }) => Err(e),
            Err(e) => {
                if matches!(e, ParseError::ChecksumFailed { .. }) {
                    self.stats.checksum_failures += 1;
                }
                debug!("Dropping byte after parse failure: {}", e);
                self.discard(1);
                Err(e)
            }
        }
    }

    /// Consume every complete frame in the buffer, returning the newest valid one
    pub fn drain_latest(&mut self) -> Option<PressureFrame> {
        let mut latest = None;
        loop {
            match self.next_frame() {
                Ok(frame) => latest = Some(frame),
                Err(ParseError::Incomplete { .. }) => return latest,
                Err(_) => continue,
            }
        }
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.buffer.drain(..count);
            self.stats.discarded_bytes += count as u64;
        }
    }
}
