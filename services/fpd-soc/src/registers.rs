//! SPI-visible register file.
//!
//! The host configures and monitors the FPGA through 16-bit registers
//! addressed by 16-bit keys. Reads and writes are serialized by one guard;
//! writes to read-only registers are silently ignored, and the CONTROL
//! register is write-only (it reads back as zero). Fatal faults (watchdog,
//! ROIC) latch ERROR_FLAGS and the STATUS error bit until the host writes
//! `error_clear`.

use std::sync::Mutex;

use log::{debug, warn};

use crate::api::{ScanMode, ScanState};

pub const REG_DEVICE_ID: u16 = 0x0000;
pub const REG_VERSION: u16 = 0x0001;
pub const REG_STATUS: u16 = 0x0002;
pub const REG_CONTROL: u16 = 0x0003;
pub const REG_FRAME_COUNT_HI: u16 = 0x0004;
pub const REG_FRAME_COUNT_LO: u16 = 0x0005;
pub const REG_ERROR_FLAGS: u16 = 0x0006;

pub const DEVICE_ID: u16 = 0xA735;
pub const VERSION: u16 = 0x0100;

pub const STATUS_IDLE: u16 = 1 << 0;
pub const STATUS_BUSY: u16 = 1 << 1;
pub const STATUS_ERROR: u16 = 1 << 2;

pub const CONTROL_START: u16 = 1 << 0;
pub const CONTROL_STOP: u16 = 1 << 1;
pub const CONTROL_RESET: u16 = 1 << 2;
pub const CONTROL_ERROR_CLEAR: u16 = 1 << 4;
pub const CONTROL_MODE_SHIFT: u16 = 8;
pub const CONTROL_MODE_MASK: u16 = 0x3 << CONTROL_MODE_SHIFT;

pub const FAULT_WATCHDOG: u16 = 1 << 0;
pub const FAULT_ROIC: u16 = 1 << 1;
pub const FAULT_LINE_CRC: u16 = 1 << 2;
pub const FAULT_OVERFLOW: u16 = 1 << 3;

/// Decoded CONTROL write, handed to whoever drives the sequence FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlRequest {
    pub start: bool,
    pub stop: bool,
    pub reset: bool,
    pub error_clear: bool,
    pub mode: Option<ScanMode>,
}

#[derive(Debug, Default)]
struct Regs {
    status: u16,
    frame_count: u32,
    error_flags: u16,
}

#[derive(Debug)]
pub struct RegisterFile {
    inner: Mutex<Regs>,
}

impl RegisterFile {
    pub fn new() -> RegisterFile {
        RegisterFile { inner: Mutex::new(Regs { status: STATUS_IDLE, ..Regs::default() }) }
    }

    pub fn read(&self, addr: u16) -> Option<u16> {
        let regs = self.inner.lock().expect("register guard");
        match addr {
            REG_DEVICE_ID => Some(DEVICE_ID),
            REG_VERSION => Some(VERSION),
            REG_STATUS => Some(regs.status),
            // write-only
            REG_CONTROL => Some(0),
            REG_FRAME_COUNT_HI => Some((regs.frame_count >> 16) as u16),
            REG_FRAME_COUNT_LO => Some(regs.frame_count as u16),
            REG_ERROR_FLAGS => Some(regs.error_flags),
            _ => None,
        }
    }

    /// Write a register. Only CONTROL has write behavior; everything else
    /// is read-only and the write is dropped on the floor.
    pub fn write(&self, addr: u16, value: u16) -> Option<ControlRequest> {
        if addr != REG_CONTROL {
            debug!("write to read-only register {:#06x} ignored", addr);
            return None;
        }
        let mut regs = self.inner.lock().expect("register guard");
        let mut req = ControlRequest::default();
        req.start = value & CONTROL_START != 0;
        req.stop = value & CONTROL_STOP != 0;
        req.reset = value & CONTROL_RESET != 0;
        req.error_clear = value & CONTROL_ERROR_CLEAR != 0;
        if req.start {
            req.mode = ScanMode::from_wire(((value & CONTROL_MODE_MASK) >> CONTROL_MODE_SHIFT) as u8);
        }
        if req.error_clear {
            // flags and the status bit drop together, under the same guard
            regs.error_flags = 0;
            regs.status &= !STATUS_ERROR;
        }
        Some(req)
    }

    /// Latch a fatal fault. Stays up until an explicit error_clear.
    pub fn latch_fault(&self, flags: u16) {
        let mut regs = self.inner.lock().expect("register guard");
        warn!("fault latched: {:#06x}", flags);
        regs.error_flags |= flags;
        regs.status |= STATUS_ERROR;
    }

    pub fn fault_latched(&self) -> bool {
        self.inner.lock().expect("register guard").error_flags != 0
    }

    pub fn error_flags(&self) -> u16 { self.inner.lock().expect("register guard").error_flags }

    pub fn increment_frame_count(&self) {
        let mut regs = self.inner.lock().expect("register guard");
        regs.frame_count = regs.frame_count.wrapping_add(1);
    }

    pub fn frame_count(&self) -> u32 { self.inner.lock().expect("register guard").frame_count }

    /// Reflect the sequencer state into the STATUS idle/busy bits.
    pub fn note_state(&self, state: ScanState) {
        let mut regs = self.inner.lock().expect("register guard");
        regs.status &= !(STATUS_IDLE | STATUS_BUSY);
        regs.status |= match state {
            ScanState::Idle | ScanState::Complete => STATUS_IDLE,
            _ => STATUS_BUSY,
        };
    }

    /// Full reset: counters, faults and status back to power-on values.
    pub fn reset(&self) {
        let mut regs = self.inner.lock().expect("register guard");
        *regs = Regs { status: STATUS_IDLE, ..Regs::default() };
    }
}

impl Default for RegisterFile {
    fn default() -> RegisterFile { RegisterFile::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_registers() {
        let regs = RegisterFile::new();
        assert_eq!(regs.read(REG_DEVICE_ID), Some(0xA735));
        assert_eq!(regs.read(REG_VERSION), Some(VERSION));
        assert_eq!(regs.read(0xFFFF), None);
    }

    #[test]
    fn read_only_writes_are_ignored() {
        let regs = RegisterFile::new();
        assert!(regs.write(REG_DEVICE_ID, 0x1234).is_none());
        assert_eq!(regs.read(REG_DEVICE_ID), Some(DEVICE_ID));
        assert!(regs.write(REG_FRAME_COUNT_LO, 7).is_none());
        assert_eq!(regs.read(REG_FRAME_COUNT_LO), Some(0));
    }

    #[test]
    fn control_decodes_bits() {
        let regs = RegisterFile::new();
        let req = regs
            .write(REG_CONTROL, CONTROL_START | ((ScanMode::Calibration.to_wire() as u16) << CONTROL_MODE_SHIFT))
            .unwrap();
        assert!(req.start);
        assert!(!req.stop);
        assert_eq!(req.mode, Some(ScanMode::Calibration));
        // CONTROL is write-only
        assert_eq!(regs.read(REG_CONTROL), Some(0));
    }

    #[test]
    fn frame_count_spans_two_registers() {
        let regs = RegisterFile::new();
        for _ in 0..0x1_0002 {
            regs.increment_frame_count();
        }
        assert_eq!(regs.read(REG_FRAME_COUNT_HI), Some(1));
        assert_eq!(regs.read(REG_FRAME_COUNT_LO), Some(2));
        assert_eq!(regs.frame_count(), 0x1_0002);
    }

    #[test]
    fn fault_latches_until_error_clear() {
        let regs = RegisterFile::new();
        regs.latch_fault(FAULT_WATCHDOG);
        assert!(regs.fault_latched());
        assert_eq!(regs.read(REG_STATUS).unwrap() & STATUS_ERROR, STATUS_ERROR);
        // ordinary writes do not clear it
        regs.write(REG_CONTROL, CONTROL_STOP);
        assert!(regs.fault_latched());
        regs.write(REG_CONTROL, CONTROL_ERROR_CLEAR);
        assert!(!regs.fault_latched());
        assert_eq!(regs.read(REG_STATUS).unwrap() & STATUS_ERROR, 0);
    }

    #[test]
    fn status_tracks_state() {
        let regs = RegisterFile::new();
        assert_eq!(regs.read(REG_STATUS).unwrap() & STATUS_IDLE, STATUS_IDLE);
        regs.note_state(ScanState::Scanning);
        let status = regs.read(REG_STATUS).unwrap();
        assert_eq!(status & STATUS_BUSY, STATUS_BUSY);
        assert_eq!(status & STATUS_IDLE, 0);
    }
}
