//! Host-side SDK for the detector.
//!
//! [`reassembler::FrameReassembler`] turns out-of-order data packets back
//! into frames, [`receiver::FrameReceiver`] owns the data socket and the
//! delivery channel, and [`cmdclient::CommandClient`] speaks the
//! authenticated control protocol.

pub mod cmdclient;
pub mod receiver;
pub mod reassembler;

pub use crate::cmdclient::CommandClient;
pub use crate::reassembler::{FrameReassembler, FrameResult};
pub use crate::receiver::{FrameReceiver, ReceivedFrame};

#[derive(Debug)]
pub enum SdkError {
    Io(std::io::Error),
    /// no response inside the socket timeout
    Timeout,
    Wire(fpd_protocol::WireError),
    /// the device answered, but not with Ok
    Rejected(fpd_protocol::StatusCode),
}

impl std::fmt::Display for SdkError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SdkError::Io(e) => write!(f, "socket error: {}", e),
            SdkError::Timeout => write!(f, "device did not respond in time"),
            SdkError::Wire(e) => write!(f, "protocol error: {}", e),
            SdkError::Rejected(code) => write!(f, "device rejected command: {:?}", code),
        }
    }
}

impl std::error::Error for SdkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SdkError::Io(e) => Some(e),
            SdkError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SdkError {
    fn from(e: std::io::Error) -> SdkError {
        if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
            SdkError::Timeout
        } else {
            SdkError::Io(e)
        }
    }
}

impl From<fpd_protocol::WireError> for SdkError {
    fn from(e: fpd_protocol::WireError) -> SdkError { SdkError::Wire(e) }
}
