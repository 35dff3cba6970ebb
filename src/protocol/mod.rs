//! Device wire protocol.
//!
//! Defines the frame format, the tag dictionary, and the record decoder.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────┬──────────────────────────┬──────────────────┬───────────────┐
//! │ Type (1) │ Length (2, LE)           │ Payload (N)      │ Checksum (2)  │
//! │ 01/15/.. │ bit 15 archive, 0-14 = N │ tag, value, ...  │ CRC-16 LE     │
//! └──────────┴──────────────────────────┴──────────────────┴───────────────┘
//! ```
//!
//! Every complete frame is acknowledged with `[0x02, crc_lo, crc_hi]`, echoing the
//! frame's own trailing checksum bytes.

mod codec;
mod decoder;
pub mod encode;
mod record;
pub mod tags;

pub use codec::FrameCodec;
pub use decoder::{DecodedFrame, IdentityContext, RecordDecoder};
pub use record::TelemetryRecord;
pub use tags::{TagDescriptor, TagKind};

use bytes::Bytes;
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Header type byte of a telemetry frame.
pub const FRAME_MAIN: u8 = 0x01;

/// Header type byte of the acknowledgement sent back to the device.
pub const FRAME_ACK: u8 = 0x02;

/// Header type byte of housekeeping frames that carry nothing to decode.
pub const FRAME_IGNORABLE: u8 = 0x15;

/// Type byte plus length word.
pub const HEADER_SIZE: usize = 3;

/// Trailing checksum size.
pub const CHECKSUM_SIZE: usize = 2;

/// Bytes a frame occupies beyond its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// Mask applied to the length word to get the payload size.
pub const LENGTH_MASK: u16 = 0x7FFF;

/// Bit 15 of the length word; the device sets it when archived data is pending.
pub const ARCHIVE_FLAG: u16 = 0x8000;

/// Largest payload the length field can express.
pub const MAX_PAYLOAD_SIZE: usize = LENGTH_MASK as usize;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Calculate the CRC-16/MODBUS checksum used over header, length and payload.
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Frame classification by header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Telemetry payload, candidate for decoding.
    Main,
    /// Housekeeping frame, acked and dropped.
    Ignorable,
    /// Vendor frame that is not telemetry, acked and dropped.
    Extension(u8),
}

impl FrameKind {
    pub fn from_header(header: u8) -> Self {
        match header {
            FRAME_MAIN => FrameKind::Main,
            FRAME_IGNORABLE => FrameKind::Ignorable,
            other => FrameKind::Extension(other),
        }
    }

    pub fn header(self) -> u8 {
        match self {
            FrameKind::Main => FRAME_MAIN,
            FrameKind::Ignorable => FRAME_IGNORABLE,
            FrameKind::Extension(h) => h,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Main => "main",
            FrameKind::Ignorable => "ignorable",
            FrameKind::Extension(_) => "extension",
        }
    }
}

/// One complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Bit 15 of the length word.
    pub archive_flag: bool,
    pub payload: Bytes,
    /// Checksum as transmitted by the device.
    pub checksum: u16,
    /// Checksum recomputed over header, length and payload.
    pub computed_checksum: u16,
}

impl Frame {
    /// Split a complete wire frame into its parts.
    ///
    /// The slice must hold exactly one frame; the codec guarantees that.
    pub fn from_wire(data: Bytes) -> Result<Self, DecodeError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(DecodeError::ShortFrame(data.len()));
        }
        let length_word = u16::from_le_bytes([data[1], data[2]]);
        let payload_len = usize::from(length_word & LENGTH_MASK);
        if data.len() != payload_len + FRAME_OVERHEAD {
            return Err(DecodeError::ShortFrame(data.len()));
        }

        let body_end = HEADER_SIZE + payload_len;
        let checksum = u16::from_le_bytes([data[body_end], data[body_end + 1]]);
        let computed_checksum = self::checksum(&data[..body_end]);

        Ok(Self {
            kind: FrameKind::from_header(data[0]),
            archive_flag: length_word & ARCHIVE_FLAG != 0,
            payload: data.slice(HEADER_SIZE..body_end),
            checksum,
            computed_checksum,
        })
    }

    /// Parse a frame from a hex dump, for offline inspection.
    pub fn from_hex(input: &str) -> Result<Self, DecodeError> {
        let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let data = hex::decode(cleaned).map_err(|e| DecodeError::Hex(e.to_string()))?;
        Self::from_wire(Bytes::from(data))
    }

    /// Whether the transmitted checksum matches the recomputed one.
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.computed_checksum
    }

    /// Total number of bytes this frame occupied on the wire.
    pub fn wire_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// The acknowledgement owed to the device for this frame.
    pub fn ack(&self) -> Ack {
        Ack {
            checksum: self.checksum,
        }
    }
}

/// What to do with a frame whose transmitted checksum does not match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Never verify; ack whatever the device sent.
    Ignore,
    /// Verify and count mismatches, but ack and decode anyway.
    #[default]
    Warn,
    /// Neither ack nor decode a mismatching frame, so the device retransmits.
    Reject,
}

impl ChecksumPolicy {
    /// Whether a frame should be acknowledged and processed.
    pub fn accepts(self, frame: &Frame) -> bool {
        self != ChecksumPolicy::Reject || frame.checksum_ok()
    }

    /// Whether mismatches are looked for at all.
    pub fn verifies(self) -> bool {
        self != ChecksumPolicy::Ignore
    }
}

/// Link-level acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub checksum: u16,
}

impl Ack {
    /// Size of an encoded acknowledgement.
    pub const SIZE: usize = 3;

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let [lo, hi] = self.checksum.to_le_bytes();
        [FRAME_ACK, lo, hi]
    }
}
