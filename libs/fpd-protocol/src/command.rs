//! Authenticated command channel frames.
//!
//! Requests run host → SoC, responses SoC → host. Every frame carries an
//! HMAC-SHA256 over its canonical bytes; the SoC additionally enforces a
//! strictly increasing sequence number per client so captured datagrams
//! cannot be replayed.
//!
//! Inbound validation order is fixed: magic, then HMAC, then anti-replay.
//! A replay is therefore only reported for messages that authenticated,
//! and it does not count as an authentication failure.

use byteorder::{ByteOrder, LittleEndian};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::WireError;

pub const CMD_MAGIC: u32 = 0xBEEF_CAFE;
pub const RSP_MAGIC: u32 = 0xCAFE_BEEF;

pub const HMAC_LEN: usize = 32;
/// magic(4) + sequence(4) + id-or-status(2) + payload_len(2) + hmac(32)
pub const FIXED_LEN: usize = 12 + HMAC_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Scan modes selectable at StartScan; also reported back in GetStatus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// one frame, then back to Idle
    Single,
    /// frames until StopScan
    Continuous,
    /// dark/gain calibration run, sequenced like Continuous
    Calibration,
}

impl ScanMode {
    pub fn to_wire(self) -> u8 {
        match self {
            ScanMode::Single => 0,
            ScanMode::Continuous => 1,
            ScanMode::Calibration => 2,
        }
    }

    pub fn from_wire(v: u8) -> Option<ScanMode> {
        match v {
            0 => Some(ScanMode::Single),
            1 => Some(ScanMode::Continuous),
            2 => Some(ScanMode::Calibration),
            _ => None,
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = ();

    fn from_str(s: &str) -> Result<ScanMode, ()> {
        match s {
            "single" => Ok(ScanMode::Single),
            "continuous" => Ok(ScanMode::Continuous),
            "calibration" => Ok(ScanMode::Calibration),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum CommandId {
    StartScan = 0x01,
    StopScan = 0x02,
    GetStatus = 0x10,
    SetConfig = 0x20,
    Reset = 0x30,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum StatusCode {
    Ok = 0x00,
    Error = 0x01,
    Busy = 0x02,
    InvalidCmd = 0x03,
    AuthFailed = 0x04,
    Replay = 0x05,
}

/// A decoded (and authenticated) request.
///
/// `command_id` stays raw so the dispatcher can answer `InvalidCmd` for
/// verbs it does not know; use [`CommandFrame::command`] for the typed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub sequence: u32,
    pub command_id: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub sequence: u32,
    pub status: StatusCode,
    pub payload: Vec<u8>,
}

fn compute_mac(key: &[u8], magic: u32, sequence: u32, id_or_status: u16, payload: &[u8]) -> [u8; HMAC_LEN] {
    let mut canonical = [0u8; 12];
    LittleEndian::write_u32(&mut canonical[0..4], magic);
    LittleEndian::write_u32(&mut canonical[4..8], sequence);
    LittleEndian::write_u16(&mut canonical[8..10], id_or_status);
    LittleEndian::write_u16(&mut canonical[10..12], payload.len() as u16);
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key setup");
    mac.update(&canonical);
    mac.update(payload);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn verify_mac(
    key: &[u8],
    magic: u32,
    sequence: u32,
    id_or_status: u16,
    payload: &[u8],
    tag: &[u8],
) -> bool {
    let mut canonical = [0u8; 12];
    LittleEndian::write_u32(&mut canonical[0..4], magic);
    LittleEndian::write_u32(&mut canonical[4..8], sequence);
    LittleEndian::write_u16(&mut canonical[8..10], id_or_status);
    LittleEndian::write_u16(&mut canonical[10..12], payload.len() as u16);
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key setup");
    mac.update(&canonical);
    mac.update(payload);
    // verify_slice is constant-time
    mac.verify_slice(tag).is_ok()
}

fn encode_frame(key: &[u8], magic: u32, sequence: u32, id_or_status: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FIXED_LEN + payload.len()];
    LittleEndian::write_u32(&mut buf[0..4], magic);
    LittleEndian::write_u32(&mut buf[4..8], sequence);
    LittleEndian::write_u16(&mut buf[8..10], id_or_status);
    LittleEndian::write_u16(&mut buf[10..12], payload.len() as u16);
    let tag = compute_mac(key, magic, sequence, id_or_status, payload);
    buf[12..12 + HMAC_LEN].copy_from_slice(&tag);
    buf[FIXED_LEN..].copy_from_slice(payload);
    buf
}

fn decode_frame(key: &[u8], expect_magic: u32, raw: &[u8]) -> Result<(u32, u16, Vec<u8>), WireError> {
    if raw.len() < FIXED_LEN {
        return Err(WireError::Truncated);
    }
    if LittleEndian::read_u32(&raw[0..4]) != expect_magic {
        return Err(WireError::BadMagic);
    }
    let sequence = LittleEndian::read_u32(&raw[4..8]);
    let id_or_status = LittleEndian::read_u16(&raw[8..10]);
    let payload_len = LittleEndian::read_u16(&raw[10..12]) as usize;
    if raw.len() != FIXED_LEN + payload_len {
        return Err(WireError::LengthMismatch);
    }
    let payload = &raw[FIXED_LEN..];
    if !verify_mac(key, expect_magic, sequence, id_or_status, payload, &raw[12..12 + HMAC_LEN]) {
        return Err(WireError::AuthFailed);
    }
    Ok((sequence, id_or_status, payload.to_vec()))
}

impl CommandFrame {
    pub fn new(sequence: u32, command: CommandId, payload: Vec<u8>) -> CommandFrame {
        CommandFrame { sequence, command_id: num_traits::ToPrimitive::to_u16(&command).unwrap_or(0), payload }
    }

    /// Typed view of `command_id`; `None` for verbs this build does not know.
    pub fn command(&self) -> Option<CommandId> {
        num_traits::FromPrimitive::from_u16(self.command_id)
    }

    pub fn encode(&self, key: &[u8]) -> Vec<u8> {
        encode_frame(key, CMD_MAGIC, self.sequence, self.command_id, &self.payload)
    }

    /// Magic and HMAC are checked here; replay is the caller's business
    /// because the window is per client.
    pub fn decode(key: &[u8], raw: &[u8]) -> Result<CommandFrame, WireError> {
        let (sequence, command_id, payload) = decode_frame(key, CMD_MAGIC, raw)?;
        Ok(CommandFrame { sequence, command_id, payload })
    }
}

impl ResponseFrame {
    pub fn new(sequence: u32, status: StatusCode, payload: Vec<u8>) -> ResponseFrame {
        ResponseFrame { sequence, status, payload }
    }

    pub fn encode(&self, key: &[u8]) -> Vec<u8> {
        let status = num_traits::ToPrimitive::to_u16(&self.status).unwrap_or(0x01);
        encode_frame(key, RSP_MAGIC, self.sequence, status, &self.payload)
    }

    pub fn decode(key: &[u8], raw: &[u8]) -> Result<ResponseFrame, WireError> {
        let (sequence, status, payload) = decode_frame(key, RSP_MAGIC, raw)?;
        let status = num_traits::FromPrimitive::from_u16(status).ok_or(WireError::UnknownStatus)?;
        Ok(ResponseFrame { sequence, status, payload })
    }
}

/// Tracks the highest sequence number accepted from one client.
///
/// "No prior sequence" is a distinct state, not a zero sentinel, so a first
/// message carrying sequence 0 is accepted like any other.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    last_accepted: Option<u32>,
}

impl ReplayWindow {
    pub fn new() -> ReplayWindow { ReplayWindow { last_accepted: None } }

    pub fn is_fresh(&self, sequence: u32) -> bool {
        match self.last_accepted {
            None => true,
            Some(last) => sequence > last,
        }
    }

    /// Record an accepted sequence. Call only after the command dispatched.
    pub fn commit(&mut self, sequence: u32) {
        debug_assert!(self.is_fresh(sequence));
        self.last_accepted = Some(sequence);
    }

    pub fn last_accepted(&self) -> Option<u32> { self.last_accepted }
}

/// Snapshot returned by GetStatus; 20 bytes little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub state: u8,
    pub mode: u8,
    pub error_flags: u16,
    pub frames_received: u32,
    pub frames_sent: u32,
    pub frames_dropped: u32,
    pub auth_failures: u32,
}

pub const STATUS_REPORT_LEN: usize = 20;

impl StatusReport {
    pub fn encode(&self) -> [u8; STATUS_REPORT_LEN] {
        let mut buf = [0u8; STATUS_REPORT_LEN];
        buf[0] = self.state;
        buf[1] = self.mode;
        LittleEndian::write_u16(&mut buf[2..4], self.error_flags);
        LittleEndian::write_u32(&mut buf[4..8], self.frames_received);
        LittleEndian::write_u32(&mut buf[8..12], self.frames_sent);
        LittleEndian::write_u32(&mut buf[12..16], self.frames_dropped);
        LittleEndian::write_u32(&mut buf[16..20], self.auth_failures);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<StatusReport, WireError> {
        if buf.len() < STATUS_REPORT_LEN {
            return Err(WireError::Truncated);
        }
        Ok(StatusReport {
            state: buf[0],
            mode: buf[1],
            error_flags: LittleEndian::read_u16(&buf[2..4]),
            frames_received: LittleEndian::read_u32(&buf[4..8]),
            frames_sent: LittleEndian::read_u32(&buf[8..12]),
            frames_dropped: LittleEndian::read_u32(&buf[12..16]),
            auth_failures: LittleEndian::read_u32(&buf[16..20]),
        })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const KEY: &[u8] = b"panel-secret-key";

    #[test]
    fn hmac_stack_sanity() {
        // RFC 4231 test case 1 pins down the Hmac<Sha256> wiring
        let mut mac = HmacSha256::new_from_slice(&[0x0b; 20]).unwrap();
        mac.update(b"Hi There");
        let tag = mac.finalize().into_bytes();
        assert_eq!(
            tag[..],
            hex!("b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7")[..]
        );
    }

    #[test]
    fn command_round_trip() {
        let frame = CommandFrame::new(1, CommandId::StartScan, vec![0x01]);
        let wire = frame.encode(KEY);
        let back = CommandFrame::decode(KEY, &wire).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.command(), Some(CommandId::StartScan));
    }

    #[test]
    fn response_round_trip() {
        let frame = ResponseFrame::new(9, StatusCode::Busy, vec![]);
        let wire = frame.encode(KEY);
        assert_eq!(ResponseFrame::decode(KEY, &wire).unwrap(), frame);
    }

    #[test]
    fn any_flip_fails_auth() {
        let wire = CommandFrame::new(3, CommandId::GetStatus, b"abc".to_vec()).encode(KEY);
        for pos in 4..wire.len() {
            let mut mangled = wire.clone();
            mangled[pos] ^= 0x80;
            assert!(
                CommandFrame::decode(KEY, &mangled).is_err(),
                "flip at byte {} was accepted", pos
            );
        }
    }

    #[test]
    fn wrong_key_fails_auth() {
        let wire = CommandFrame::new(3, CommandId::Reset, vec![]).encode(KEY);
        assert_eq!(CommandFrame::decode(b"other-key", &wire), Err(WireError::AuthFailed));
    }

    #[test]
    fn bad_magic_detected_before_auth() {
        let mut wire = CommandFrame::new(3, CommandId::Reset, vec![]).encode(KEY);
        wire[0] ^= 0xFF;
        assert_eq!(CommandFrame::decode(KEY, &wire), Err(WireError::BadMagic));
    }

    #[test]
    fn unknown_verb_survives_decode() {
        let frame = CommandFrame { sequence: 4, command_id: 0x7F, payload: vec![] };
        let back = CommandFrame::decode(KEY, &frame.encode(KEY)).unwrap();
        assert_eq!(back.command_id, 0x7F);
        assert_eq!(back.command(), None);
    }

    #[test]
    fn replay_window_strictly_increases() {
        let mut window = ReplayWindow::new();
        assert!(window.is_fresh(5));
        window.commit(5);
        assert!(!window.is_fresh(5));
        assert!(!window.is_fresh(3));
        assert!(window.is_fresh(6));
        window.commit(6);
        assert_eq!(window.last_accepted(), Some(6));
    }

    #[test]
    fn sequence_zero_is_a_valid_first_message() {
        let window = ReplayWindow::new();
        assert!(window.is_fresh(0));
    }

    #[test]
    fn status_report_round_trip() {
        let report = StatusReport {
            state: 3,
            mode: 1,
            error_flags: 0x0004,
            frames_received: 10,
            frames_sent: 9,
            frames_dropped: 1,
            auth_failures: 2,
        };
        assert_eq!(StatusReport::decode(&report.encode()).unwrap(), report);
    }
}
