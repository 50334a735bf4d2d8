//! Authenticated command server on the control port.
//!
//! Validation order on every datagram is fixed: magic, then HMAC, then
//! anti-replay, then dispatch. The auth-failure counter moves on bad magic
//! and bad HMAC only; replays get their own status and do not touch it.
//! Each peer address gets its own replay window, which advances only after
//! the command actually dispatched.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use fpd_protocol::{
    CommandFrame, CommandId, ReplayWindow, ResponseFrame, StatusCode, StatusReport, WireError,
};

use crate::api::{ScanEvent, ScanMode, SocError};
use crate::config::DetectorConfig;
use crate::framebuf::FrameBufferManager;
use crate::registers::RegisterFile;
use crate::sequence::SequenceFsm;

/// Shared firmware objects the command handlers act on.
pub struct CommandContext {
    pub fsm: Arc<Mutex<SequenceFsm>>,
    pub registers: Arc<RegisterFile>,
    pub config: Arc<Mutex<DetectorConfig>>,
    pub ring: Arc<FrameBufferManager>,
}

pub struct CommandServer {
    key: Vec<u8>,
    ctx: CommandContext,
    windows: HashMap<SocketAddr, ReplayWindow>,
    auth_failures: Arc<AtomicU32>,
}

impl CommandServer {
    pub fn new(key: Vec<u8>, ctx: CommandContext) -> CommandServer {
        CommandServer { key, ctx, windows: HashMap::new(), auth_failures: Arc::new(AtomicU32::new(0)) }
    }

    /// Shared view of the auth-failure counter (GetStatus reports it).
    pub fn auth_failure_counter(&self) -> Arc<AtomicU32> { self.auth_failures.clone() }

    pub fn auth_failures(&self) -> u32 { self.auth_failures.load(Ordering::Relaxed) }

    /// Process one datagram and produce the response to send back.
    pub fn handle_datagram(&mut self, peer: SocketAddr, raw: &[u8]) -> Vec<u8> {
        let frame = match CommandFrame::decode(&self.key, raw) {
            Ok(frame) => frame,
            Err(WireError::AuthFailed) => {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                warn!("auth failure from {}", peer);
                let sequence = peek_sequence(raw);
                return ResponseFrame::new(sequence, StatusCode::AuthFailed, vec![]).encode(&self.key);
            }
            Err(WireError::BadMagic) => {
                self.auth_failures.fetch_add(1, Ordering::Relaxed);
                warn!("bad magic from {}", peer);
                return ResponseFrame::new(0, StatusCode::InvalidCmd, vec![]).encode(&self.key);
            }
            Err(e) => {
                debug!("malformed command from {}: {}", peer, e);
                return ResponseFrame::new(0, StatusCode::InvalidCmd, vec![]).encode(&self.key);
            }
        };
        let window = self.windows.entry(peer).or_insert_with(ReplayWindow::new);
        if !window.is_fresh(frame.sequence) {
            debug!(
                "replayed sequence {} from {} (last accepted {:?})",
                frame.sequence, peer, window.last_accepted()
            );
            return ResponseFrame::new(frame.sequence, StatusCode::Replay, vec![]).encode(&self.key);
        }
        let (status, payload) = self.dispatch(&frame);
        // the window moves only once the command went through dispatch
        self.windows
            .get_mut(&peer)
            .expect("window inserted above")
            .commit(frame.sequence);
        ResponseFrame::new(frame.sequence, status, payload).encode(&self.key)
    }

    fn dispatch(&mut self, frame: &CommandFrame) -> (StatusCode, Vec<u8>) {
        match frame.command() {
            Some(CommandId::StartScan) => self.start_scan(&frame.payload),
            Some(CommandId::StopScan) => {
                let mut fsm = self.ctx.fsm.lock().expect("fsm guard");
                let state = fsm.handle(ScanEvent::StopScan);
                self.ctx.registers.note_state(state);
                (StatusCode::Ok, vec![])
            }
            Some(CommandId::GetStatus) => (StatusCode::Ok, self.status_report().encode().to_vec()),
            Some(CommandId::SetConfig) => self.set_config(&frame.payload),
            Some(CommandId::Reset) => {
                info!("host requested reset");
                let mut fsm = self.ctx.fsm.lock().expect("fsm guard");
                let state = fsm.handle(ScanEvent::StopScan);
                self.ctx.registers.reset();
                self.ctx.registers.note_state(state);
                self.auth_failures.store(0, Ordering::Relaxed);
                (StatusCode::Ok, vec![])
            }
            None => {
                debug!("unknown command id {:#06x}", frame.command_id);
                (StatusCode::InvalidCmd, vec![])
            }
        }
    }

    fn start_scan(&mut self, payload: &[u8]) -> (StatusCode, Vec<u8>) {
        if self.ctx.registers.fault_latched() {
            warn!("StartScan refused: fault latched");
            return (StatusCode::Error, vec![]);
        }
        let mode = match payload.first() {
            Some(&raw) => match ScanMode::from_wire(raw) {
                Some(mode) => mode,
                None => return (StatusCode::InvalidCmd, vec![]),
            },
            None => self.ctx.config.lock().expect("config guard").scan_mode,
        };
        let mut fsm = self.ctx.fsm.lock().expect("fsm guard");
        if fsm.is_scanning() {
            return (StatusCode::Busy, vec![]);
        }
        let state = fsm.handle(ScanEvent::StartScan(mode));
        self.ctx.registers.note_state(state);
        (StatusCode::Ok, vec![])
    }

    fn set_config(&mut self, payload: &[u8]) -> (StatusCode, Vec<u8>) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => return (StatusCode::InvalidCmd, vec![]),
        };
        let mut parts = text.splitn(2, '=');
        let (key, value) = match (parts.next(), parts.next()) {
            (Some(k), Some(v)) => (k.trim(), v.trim()),
            _ => return (StatusCode::InvalidCmd, vec![]),
        };
        let scanning = self.ctx.fsm.lock().expect("fsm guard").is_scanning();
        let mut config = self.ctx.config.lock().expect("config guard");
        match config.apply(key, value, scanning) {
            Ok(class) => {
                info!("config {} = {} applied ({:?})", key, value, class);
                (StatusCode::Ok, vec![])
            }
            Err(SocError::ColdParam(k)) => {
                debug!("cold parameter {} refused while scanning", k);
                (StatusCode::Busy, vec![])
            }
            Err(e) => {
                debug!("config update rejected: {}", e);
                (StatusCode::Error, vec![])
            }
        }
    }

    fn status_report(&self) -> StatusReport {
        let fsm = self.ctx.fsm.lock().expect("fsm guard");
        let ring = self.ctx.ring.stats();
        StatusReport {
            state: fsm.state().into(),
            mode: fsm.mode().to_wire(),
            error_flags: self.ctx.registers.error_flags(),
            frames_received: ring.frames_received,
            frames_sent: ring.frames_sent,
            frames_dropped: ring.frames_dropped,
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }

    /// Serve the control socket until the run flag drops.
    pub fn run(mut self, socket: UdpSocket, run: Arc<AtomicBool>) -> std::io::Result<()> {
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        let mut buf = vec![0u8; 2048];
        info!("command server on {}", socket.local_addr()?);
        while run.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    let response = self.handle_datagram(peer, &buf[..len]);
                    if let Err(e) = socket.send_to(&response, peer) {
                        warn!("response to {} failed: {}", peer, e);
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// best-effort sequence extraction for error responses; the frame did not
// authenticate so this is informational only
fn peek_sequence(raw: &[u8]) -> u32 {
    if raw.len() >= 8 {
        u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]])
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-key";

    fn test_server() -> CommandServer {
        let ctx = CommandContext {
            fsm: Arc::new(Mutex::new(SequenceFsm::new_standalone())),
            registers: Arc::new(RegisterFile::new()),
            config: Arc::new(Mutex::new(DetectorConfig::default())),
            ring: Arc::new(FrameBufferManager::new(64)),
        };
        CommandServer::new(KEY.to_vec(), ctx)
    }

    fn peer() -> SocketAddr { "10.0.0.2:40000".parse().unwrap() }

    fn send(server: &mut CommandServer, sequence: u32, id: CommandId, payload: Vec<u8>) -> ResponseFrame {
        let wire = CommandFrame::new(sequence, id, payload).encode(KEY);
        let raw = server.handle_datagram(peer(), &wire);
        ResponseFrame::decode(KEY, &raw).unwrap()
    }

    #[test]
    fn start_and_stop_scan() {
        let mut server = test_server();
        let rsp = send(&mut server, 1, CommandId::StartScan, vec![ScanMode::Continuous.to_wire()]);
        assert_eq!(rsp.status, StatusCode::Ok);
        assert_eq!(server.ctx.fsm.lock().unwrap().state(), crate::api::ScanState::Scanning);
        // second start while scanning is Busy
        let rsp = send(&mut server, 2, CommandId::StartScan, vec![]);
        assert_eq!(rsp.status, StatusCode::Busy);
        let rsp = send(&mut server, 3, CommandId::StopScan, vec![]);
        assert_eq!(rsp.status, StatusCode::Ok);
        assert_eq!(server.ctx.fsm.lock().unwrap().state(), crate::api::ScanState::Idle);
    }

    #[test]
    fn replay_rejected_without_auth_failure() {
        let mut server = test_server();
        assert_eq!(send(&mut server, 5, CommandId::GetStatus, vec![]).status, StatusCode::Ok);
        assert_eq!(send(&mut server, 5, CommandId::GetStatus, vec![]).status, StatusCode::Replay);
        assert_eq!(send(&mut server, 3, CommandId::GetStatus, vec![]).status, StatusCode::Replay);
        assert_eq!(send(&mut server, 6, CommandId::GetStatus, vec![]).status, StatusCode::Ok);
        assert_eq!(server.auth_failures(), 0);
    }

    #[test]
    fn bad_hmac_counts_auth_failure() {
        let mut server = test_server();
        let mut wire = CommandFrame::new(1, CommandId::GetStatus, vec![]).encode(KEY);
        wire[12] ^= 0x01; // first byte of the tag
        let raw = server.handle_datagram(peer(), &wire);
        assert_eq!(ResponseFrame::decode(KEY, &raw).unwrap().status, StatusCode::AuthFailed);
        assert_eq!(server.auth_failures(), 1);
    }

    #[test]
    fn bad_magic_counts_auth_failure() {
        let mut server = test_server();
        let mut wire = CommandFrame::new(1, CommandId::GetStatus, vec![]).encode(KEY);
        wire[0] ^= 0xFF;
        let raw = server.handle_datagram(peer(), &wire);
        assert_eq!(ResponseFrame::decode(KEY, &raw).unwrap().status, StatusCode::InvalidCmd);
        assert_eq!(server.auth_failures(), 1);
    }

    #[test]
    fn failed_message_does_not_advance_window() {
        let mut server = test_server();
        assert_eq!(send(&mut server, 5, CommandId::GetStatus, vec![]).status, StatusCode::Ok);
        // a forged message with a higher sequence fails auth
        let mut wire = CommandFrame::new(9, CommandId::GetStatus, vec![]).encode(KEY);
        wire[12] ^= 0x01;
        server.handle_datagram(peer(), &wire);
        // 6 is still fresh
        assert_eq!(send(&mut server, 6, CommandId::GetStatus, vec![]).status, StatusCode::Ok);
    }

    #[test]
    fn windows_are_per_client() {
        let mut server = test_server();
        let wire = CommandFrame::new(5, CommandId::GetStatus, vec![]).encode(KEY);
        let a: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:40000".parse().unwrap();
        let rsp = server.handle_datagram(a, &wire);
        assert_eq!(ResponseFrame::decode(KEY, &rsp).unwrap().status, StatusCode::Ok);
        // same sequence from a different client is fine
        let rsp = server.handle_datagram(b, &wire);
        assert_eq!(ResponseFrame::decode(KEY, &rsp).unwrap().status, StatusCode::Ok);
    }

    #[test]
    fn get_status_reports_counters() {
        let mut server = test_server();
        let mut buf = server.ctx.ring.acquire(0).unwrap();
        buf.extend_from_slice(&[0; 4]);
        server.ctx.ring.commit(0, buf).unwrap();
        let rsp = send(&mut server, 1, CommandId::GetStatus, vec![]);
        let report = StatusReport::decode(&rsp.payload).unwrap();
        assert_eq!(report.frames_received, 1);
        assert_eq!(report.state, u8::from(crate::api::ScanState::Idle));
    }

    #[test]
    fn set_config_hot_and_cold() {
        let mut server = test_server();
        send(&mut server, 1, CommandId::StartScan, vec![ScanMode::Continuous.to_wire()]);
        let rsp = send(&mut server, 2, CommandId::SetConfig, b"frame_rate=30".to_vec());
        assert_eq!(rsp.status, StatusCode::Ok);
        let rsp = send(&mut server, 3, CommandId::SetConfig, b"rows=1024".to_vec());
        assert_eq!(rsp.status, StatusCode::Busy);
        send(&mut server, 4, CommandId::StopScan, vec![]);
        let rsp = send(&mut server, 5, CommandId::SetConfig, b"rows=1024".to_vec());
        assert_eq!(rsp.status, StatusCode::Ok);
        assert_eq!(server.ctx.config.lock().unwrap().rows, 1024);
        let rsp = send(&mut server, 6, CommandId::SetConfig, b"rows=9".to_vec());
        assert_eq!(rsp.status, StatusCode::Error);
    }

    #[test]
    fn unknown_verb_is_invalid_cmd() {
        let mut server = test_server();
        let wire = CommandFrame { sequence: 1, command_id: 0x77, payload: vec![] }.encode(KEY);
        let raw = server.handle_datagram(peer(), &wire);
        assert_eq!(ResponseFrame::decode(KEY, &raw).unwrap().status, StatusCode::InvalidCmd);
        assert_eq!(server.auth_failures(), 0);
    }

    #[test]
    fn start_refused_while_fault_latched() {
        let mut server = test_server();
        server.ctx.registers.latch_fault(crate::registers::FAULT_WATCHDOG);
        let rsp = send(&mut server, 1, CommandId::StartScan, vec![0]);
        assert_eq!(rsp.status, StatusCode::Error);
    }
}
