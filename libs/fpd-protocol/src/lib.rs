//! Wire-level contract shared by the detector SoC and the host SDK.
//!
//! Everything that crosses the 10 GbE link is defined here: the CRC that
//! seals the data-channel header, the 32-byte header itself, and the
//! HMAC-authenticated command frames. Both endpoints link this crate so the
//! layouts can never drift apart.

pub mod crc;
pub mod header;
pub mod command;

pub use crate::crc::{crc16, crc16_update};
pub use crate::header::{FrameHeader, HeaderFlags, FRAME_MAGIC, HEADER_LEN};
pub use crate::command::{
    CommandFrame, CommandId, ReplayWindow, ResponseFrame, ScanMode, StatusCode, StatusReport,
    CMD_MAGIC, RSP_MAGIC,
};

/// Default UDP port for the pixel data channel.
pub const DATA_PORT: u16 = 8000;
/// Default UDP port for the authenticated command channel.
pub const CONTROL_PORT: u16 = 8001;

/// Largest payload per data packet on a standard 1500-byte MTU link.
pub const MAX_PAYLOAD_MTU: usize = 1472;
/// Largest payload per data packet when jumbo frames are available.
pub const MAX_PAYLOAD_JUMBO: usize = 8192;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WireError {
    /// fewer bytes than the fixed part of the layout requires
    Truncated,
    /// magic word did not match
    BadMagic,
    /// header CRC did not cover the bytes on the wire
    CrcMismatch,
    /// HMAC verification failed
    AuthFailed,
    /// sequence number at or below the last accepted one
    Replay,
    /// declared payload length disagrees with the datagram size
    LengthMismatch,
    /// response carried a status code this build does not know
    UnknownStatus,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "message shorter than its fixed layout"),
            WireError::BadMagic => write!(f, "bad magic word"),
            WireError::CrcMismatch => write!(f, "header CRC mismatch"),
            WireError::AuthFailed => write!(f, "HMAC verification failed"),
            WireError::Replay => write!(f, "replayed sequence number"),
            WireError::LengthMismatch => write!(f, "payload length disagrees with datagram"),
            WireError::UnknownStatus => write!(f, "unrecognized status code"),
        }
    }
}

impl std::error::Error for WireError {}
