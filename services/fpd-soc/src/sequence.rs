//! Scan lifecycle state machine.
//!
//! External events (host commands, CSI-2 frame completion, link errors)
//! drive one instance per device. Collaborators hang off the FSM as a
//! capability trait: the FSM calls out through [`ScanHooks`], never the
//! other way around. In standalone use (simulator, unit tests, daemon
//! without an SPI master) the Configure and Arm phases auto-complete so a
//! StartScan deterministically reaches Scanning.

use log::{debug, info, warn};

use crate::api::{ScanEvent, ScanMode, ScanState};

/// After this many recoveries the FSM stays latched in Error.
pub const MAX_ERROR_RETRIES: u8 = 3;

/// Side effects of scan sequencing, implemented by the SPI master /
/// protection logic in production and by test doubles elsewhere.
pub trait ScanHooks: Send {
    fn on_configure(&mut self, _mode: ScanMode) {}
    fn on_arm(&mut self) {}
    fn on_stop(&mut self) {}
    fn on_error(&mut self, _prev: ScanState) {}
}

/// Hook sink for standalone operation.
pub struct NullHooks;

impl ScanHooks for NullHooks {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub frames_received: u32,
    pub frames_sent: u32,
    pub errors: u32,
    pub retries: u32,
}

pub struct SequenceFsm {
    state: ScanState,
    mode: ScanMode,
    retries: u8,
    stats: ScanStats,
    hooks: Box<dyn ScanHooks>,
    standalone: bool,
}

impl SequenceFsm {
    /// FSM with no collaborator: Configure and Arm complete by themselves.
    pub fn new_standalone() -> SequenceFsm {
        SequenceFsm {
            state: ScanState::Idle,
            mode: ScanMode::Single,
            retries: 0,
            stats: ScanStats::default(),
            hooks: Box::new(NullHooks),
            standalone: true,
        }
    }

    /// FSM wired to a collaborator; the hook owner is expected to feed
    /// ConfigDone / ArmDone back in when its work finishes.
    pub fn with_hooks(hooks: Box<dyn ScanHooks>) -> SequenceFsm {
        SequenceFsm {
            state: ScanState::Idle,
            mode: ScanMode::Single,
            retries: 0,
            stats: ScanStats::default(),
            hooks,
            standalone: false,
        }
    }

    pub fn state(&self) -> ScanState { self.state }

    pub fn mode(&self) -> ScanMode { self.mode }

    pub fn stats(&self) -> ScanStats { self.stats }

    pub fn retries(&self) -> u8 { self.retries }

    pub fn is_scanning(&self) -> bool {
        !matches!(self.state, ScanState::Idle | ScanState::Complete | ScanState::Error)
    }

    /// Feed one event; returns the state after the transition. Events that
    /// are invalid for the current state are ignored (observably, nothing
    /// changes) and logged.
    pub fn handle(&mut self, event: ScanEvent) -> ScanState {
        match (self.state, event) {
            (ScanState::Idle, ScanEvent::StartScan(mode))
            | (ScanState::Complete, ScanEvent::StartScan(mode)) => {
                info!("scan start, mode {:?}", mode);
                self.mode = mode;
                self.state = ScanState::Configure;
                self.hooks.on_configure(mode);
                if self.standalone {
                    return self.handle(ScanEvent::ConfigDone);
                }
            }
            (ScanState::Configure, ScanEvent::ConfigDone) => {
                self.state = ScanState::Arm;
                self.hooks.on_arm();
                if self.standalone {
                    return self.handle(ScanEvent::ArmDone);
                }
            }
            (ScanState::Arm, ScanEvent::ArmDone) => {
                self.state = ScanState::Scanning;
            }
            (ScanState::Scanning, ScanEvent::FrameReady) => {
                self.state = ScanState::Streaming;
                self.stats.frames_received += 1;
            }
            (ScanState::Streaming, ScanEvent::Complete) => {
                self.stats.frames_sent += 1;
                self.state = match self.mode {
                    ScanMode::Single => ScanState::Idle,
                    ScanMode::Continuous | ScanMode::Calibration => ScanState::Scanning,
                };
            }
            (_, ScanEvent::StopScan) => {
                info!("scan stop from {:?}", self.state);
                self.state = ScanState::Idle;
                self.hooks.on_stop();
            }
            (prev, ScanEvent::Error) if prev != ScanState::Error => {
                warn!("error event in {:?}", prev);
                self.stats.errors += 1;
                self.state = ScanState::Error;
                self.hooks.on_error(prev);
            }
            (ScanState::Error, ScanEvent::ErrorCleared) => {
                if self.retries < MAX_ERROR_RETRIES {
                    self.retries += 1;
                    self.stats.retries += 1;
                    info!("error cleared, retry {} of {}", self.retries, MAX_ERROR_RETRIES);
                    self.state = ScanState::Idle;
                } else {
                    warn!("retry budget exhausted, staying in Error");
                }
            }
            (state, event) => {
                debug!("event {:?} ignored in {:?}", event, state);
            }
        }
        self.state
    }
}
