//! Clock domains of the line pipeline and the CDC synchronizer model.
//!
//! Three domains matter to the data path: the 100 MHz system fabric, the
//! ~50 MHz ROIC readout clock, and the 125 MHz CSI-2 byte clock. Tick math
//! is done in integer nanoseconds so cycle counts are exact for these
//! frequencies.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// system fabric, 100 MHz
    Sys,
    /// ROIC readout, 50 MHz
    Roic,
    /// CSI-2 byte clock, 125 MHz
    Csi2Byte,
}

impl ClockDomain {
    pub fn freq_hz(&self) -> u64 {
        match self {
            ClockDomain::Sys => 100_000_000,
            ClockDomain::Roic => 50_000_000,
            ClockDomain::Csi2Byte => 125_000_000,
        }
    }

    /// Whole nanoseconds per tick (all three domains divide 1 GHz evenly).
    pub fn period_ns(&self) -> u64 { 1_000_000_000 / self.freq_hz() }

    /// Ticks elapsed after `ns` nanoseconds, rounded down.
    pub fn ns_to_ticks(&self, ns: u64) -> u64 { ns / self.period_ns() }

    pub fn ticks_to_ns(&self, ticks: u64) -> u64 { ticks * self.period_ns() }

    /// How many ticks of `other` fit in `ticks` of this domain, rounded down.
    pub fn translate_ticks(&self, ticks: u64, other: ClockDomain) -> u64 {
        other.ns_to_ticks(self.ticks_to_ns(ticks))
    }
}

/// Multi-stage flop synchronizer for a level crossing into another domain.
///
/// A change on the asynchronous input becomes visible at the output after
/// `stages + 1` destination-domain ticks: one tick to be captured by the
/// first flop, then one per remaining stage to ripple through.
#[derive(Debug)]
pub struct Synchronizer {
    input: bool,
    pipe: Vec<bool>,
}

pub const DEFAULT_SYNC_STAGES: usize = 2;

impl Synchronizer {
    pub fn new(stages: usize) -> Synchronizer {
        Synchronizer { input: false, pipe: vec![false; stages + 1] }
    }

    /// Drive the asynchronous input level.
    pub fn set_input(&mut self, level: bool) { self.input = level; }

    /// Advance one destination-domain tick; returns the synchronized output.
    pub fn tick(&mut self) -> bool {
        self.pipe.rotate_right(1);
        self.pipe[0] = self.input;
        *self.pipe.last().expect("pipe is never empty")
    }

    pub fn output(&self) -> bool { *self.pipe.last().expect("pipe is never empty") }
}

impl Default for Synchronizer {
    fn default() -> Synchronizer { Synchronizer::new(DEFAULT_SYNC_STAGES) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_math_is_exact() {
        assert_eq!(ClockDomain::Sys.period_ns(), 10);
        assert_eq!(ClockDomain::Roic.period_ns(), 20);
        assert_eq!(ClockDomain::Csi2Byte.period_ns(), 8);
        assert_eq!(ClockDomain::Sys.ns_to_ticks(1_000), 100);
        assert_eq!(ClockDomain::Roic.ticks_to_ns(50), 1_000);
    }

    #[test]
    fn domain_translation() {
        // 100 SYS ticks = 1 us = 125 byte-clock ticks
        assert_eq!(ClockDomain::Sys.translate_ticks(100, ClockDomain::Csi2Byte), 125);
        // 50 MHz is half of 100 MHz
        assert_eq!(ClockDomain::Sys.translate_ticks(10, ClockDomain::Roic), 5);
    }

    #[test]
    fn two_stage_latency_is_three_ticks() {
        let mut sync = Synchronizer::default();
        sync.set_input(true);
        assert!(!sync.tick());
        assert!(!sync.tick());
        assert!(sync.tick(), "change should appear on tick stages+1");
    }

    #[test]
    fn output_holds_once_settled() {
        let mut sync = Synchronizer::new(2);
        sync.set_input(true);
        for _ in 0..3 {
            sync.tick();
        }
        for _ in 0..10 {
            assert!(sync.tick());
        }
        sync.set_input(false);
        assert!(sync.tick());
        assert!(sync.tick());
        assert!(!sync.tick());
    }
}
