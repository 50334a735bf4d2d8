//! Authenticated control-channel client.
//!
//! One client owns one socket and a monotonically increasing sequence
//! counter. Every request is signed; every response is authenticated and
//! must echo the request's sequence number. Stale datagrams lingering in
//! the socket buffer (from a timed-out earlier exchange) are skipped, not
//! treated as the answer.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use log::{debug, trace};

use fpd_protocol::{CommandFrame, CommandId, ResponseFrame, ScanMode, StatusCode, StatusReport};

use crate::SdkError;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct CommandClient {
    socket: UdpSocket,
    key: Vec<u8>,
    sequence: u32,
}

impl CommandClient {
    pub fn connect(dest: SocketAddr, key: &[u8]) -> Result<CommandClient, SdkError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(SdkError::Io)?;
        socket.connect(dest).map_err(SdkError::Io)?;
        socket.set_read_timeout(Some(DEFAULT_RESPONSE_TIMEOUT)).map_err(SdkError::Io)?;
        Ok(CommandClient { socket, key: key.to_vec(), sequence: 0 })
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) -> Result<(), SdkError> {
        self.socket.set_read_timeout(Some(timeout)).map_err(SdkError::Io)?;
        Ok(())
    }

    /// Sequence number of the most recent request.
    pub fn sequence(&self) -> u32 { self.sequence }

    pub fn start_scan(&mut self, mode: Option<ScanMode>) -> Result<(), SdkError> {
        let payload = mode.map(|m| vec![m.to_wire()]).unwrap_or_default();
        self.transact(CommandId::StartScan, payload).map(|_| ())
    }

    pub fn stop_scan(&mut self) -> Result<(), SdkError> {
        self.transact(CommandId::StopScan, Vec::new()).map(|_| ())
    }

    pub fn reset(&mut self) -> Result<(), SdkError> {
        self.transact(CommandId::Reset, Vec::new()).map(|_| ())
    }

    pub fn get_status(&mut self) -> Result<StatusReport, SdkError> {
        let response = self.transact(CommandId::GetStatus, Vec::new())?;
        StatusReport::decode(&response.payload).map_err(SdkError::Wire)
    }

    /// Update one configuration parameter (`key`, `value` as text).
    pub fn set_config(&mut self, key: &str, value: &str) -> Result<(), SdkError> {
        let payload = format!("{}={}", key, value).into_bytes();
        self.transact(CommandId::SetConfig, payload).map(|_| ())
    }

    fn transact(&mut self, command: CommandId, payload: Vec<u8>) -> Result<ResponseFrame, SdkError> {
        self.sequence = self.sequence.wrapping_add(1);
        let request = CommandFrame::new(self.sequence, command, payload);
        let wire = request.encode(&self.key);
        self.socket.send(&wire).map_err(SdkError::from)?;
        trace!("sent {:?} seq {}", command, self.sequence);
        let mut buf = [0u8; 2048];
        // skip unauthenticated garbage and stale responses, bounded so a
        // flood cannot wedge us here
        for _ in 0..8 {
            let len = self.socket.recv(&mut buf).map_err(SdkError::from)?;
            let response = match ResponseFrame::decode(&self.key, &buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    debug!("ignoring bad response datagram: {}", e);
                    continue;
                }
            };
            if response.sequence != self.sequence {
                debug!("ignoring stale response seq {}", response.sequence);
                continue;
            }
            return if response.status == StatusCode::Ok {
                Ok(response)
            } else {
                Err(SdkError::Rejected(response.status))
            };
        }
        Err(SdkError::Timeout)
    }
}
