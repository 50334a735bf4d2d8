//! Frame reassembly from out-of-order data packets.
//!
//! Packets of up to [`MAX_CONCURRENT_SLOTS`] frames are collected at once;
//! slots are keyed by `frame_number` (0 included). A slot leaves the map on
//! completion, on timeout (missing packets zero-filled, delivered as
//! Partial so the consumer still gets an image), or by eviction of the
//! oldest slot when a new frame arrives at capacity.
//!
//! This API never panics on wire input: every failure mode is a value of
//! [`FrameResult`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

use fpd_protocol::{FrameHeader, WireError, HEADER_LEN};

/// At most this many frames under reassembly at once.
pub const MAX_CONCURRENT_SLOTS: usize = 8;
/// A slot older than this is timed out and delivered partial.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of feeding one packet (or sweeping one slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    /// all packets arrived; pixels are in frame order
    Complete { frame_number: u32, pixels: Vec<u16> },
    /// timed out; missing packet positions are zero-filled
    Partial { frame_number: u32, pixels: Vec<u16>, missing: Vec<u16> },
    /// packet absorbed, frame not finished yet (also duplicates and
    /// out-of-range indices, which are ignored)
    Processing,
    /// header CRC mismatch; packet discarded without touching any slot
    CrcError,
    /// packet malformed in some other way; discarded
    Error(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub partials: u64,
    pub crc_errors: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot {
    frame_number: u32,
    total_packets: u16,
    pixels_per_packet: usize,
    received: Vec<bool>,
    packets: Vec<Option<Vec<u16>>>,
    received_count: u16,
    created_at: Instant,
}

impl Slot {
    fn new(frame_number: u32, total_packets: u16, pixels_per_packet: usize, now: Instant) -> Slot {
        Slot {
            frame_number,
            total_packets,
            pixels_per_packet,
            received: vec![false; total_packets as usize],
            packets: (0..total_packets).map(|_| None).collect(),
            received_count: 0,
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool { self.received_count == self.total_packets }

    /// Concatenate packets in index order; absent or short packets
    /// contribute zeros. The result is always
    /// `total_packets * pixels_per_packet` samples.
    fn assemble(&self) -> Vec<u16> {
        let mut pixels = vec![0u16; self.total_packets as usize * self.pixels_per_packet];
        for (index, packet) in self.packets.iter().enumerate() {
            if let Some(packet) = packet {
                let base = index * self.pixels_per_packet;
                let n = packet.len().min(self.pixels_per_packet);
                pixels[base..base + n].copy_from_slice(&packet[..n]);
            }
        }
        pixels
    }

    fn missing(&self) -> Vec<u16> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, got)| !**got)
            .map(|(i, _)| i as u16)
            .collect()
    }
}

struct Inner {
    slots: HashMap<u32, Slot>,
    stats: ReassemblyStats,
}

pub struct FrameReassembler {
    inner: Mutex<Inner>,
    timeout: Duration,
    max_slots: usize,
}

impl FrameReassembler {
    pub fn new() -> FrameReassembler {
        FrameReassembler::with_limits(DEFAULT_TIMEOUT, MAX_CONCURRENT_SLOTS)
    }

    pub fn with_limits(timeout: Duration, max_slots: usize) -> FrameReassembler {
        FrameReassembler {
            inner: Mutex::new(Inner { slots: HashMap::new(), stats: ReassemblyStats::default() }),
            timeout,
            max_slots,
        }
    }

    pub fn stats(&self) -> ReassemblyStats { self.inner.lock().expect("slot map guard").stats }

    pub fn open_slots(&self) -> usize { self.inner.lock().expect("slot map guard").slots.len() }

    /// Feed one datagram.
    pub fn process_packet(&self, raw: &[u8]) -> FrameResult {
        let mut inner = self.inner.lock().expect("slot map guard");
        // a data packet is the 32-byte header plus at least one pixel
        if raw.len() < HEADER_LEN + 2 {
            inner.stats.malformed += 1;
            return FrameResult::Error(format!("packet too short: {} bytes", raw.len()));
        }
        let header = match FrameHeader::decode(raw) {
            Ok(header) => header,
            Err(WireError::CrcMismatch) => {
                inner.stats.crc_errors += 1;
                debug!("header CRC mismatch, packet discarded");
                return FrameResult::CrcError;
            }
            Err(e) => {
                inner.stats.malformed += 1;
                return FrameResult::Error(e.to_string());
            }
        };
        let payload = &raw[HEADER_LEN..];
        if payload.len() != header.payload_len as usize || header.payload_len % 2 != 0 {
            inner.stats.malformed += 1;
            return FrameResult::Error(format!(
                "payload length {} disagrees with header {}",
                payload.len(),
                header.payload_len
            ));
        }
        if header.total_packets == 0 {
            inner.stats.malformed += 1;
            return FrameResult::Error("zero total_packets".to_string());
        }
        let pixels_per_packet = payload.len() / 2;
        let now = Instant::now();

        if !inner.slots.contains_key(&header.frame_number) {
            if inner.slots.len() >= self.max_slots {
                self.evict_oldest(&mut inner);
            }
            inner.slots.insert(
                header.frame_number,
                Slot::new(header.frame_number, header.total_packets, pixels_per_packet, now),
            );
            trace!(
                "slot opened for frame {} ({} packets)",
                header.frame_number, header.total_packets
            );
        }
        let slot = inner.slots.get_mut(&header.frame_number).expect("slot inserted above");

        let index = header.packet_index as usize;
        if index >= slot.total_packets as usize {
            debug!(
                "index {} out of range for frame {} ({} packets), ignored",
                index, header.frame_number, slot.total_packets
            );
            return FrameResult::Processing;
        }
        if slot.received[index] {
            inner.stats.duplicates += 1;
            trace!("duplicate packet {} of frame {}", index, header.frame_number);
            return FrameResult::Processing;
        }

        // a ragged last packet is shorter than the nominal stride; keep the
        // largest stride seen so assembly indexes by the full packets
        if pixels_per_packet > slot.pixels_per_packet {
            slot.pixels_per_packet = pixels_per_packet;
        }
        let mut pixels = vec![0u16; pixels_per_packet];
        BigEndian::read_u16_into(payload, &mut pixels);
        slot.packets[index] = Some(pixels);
        slot.received[index] = true;
        slot.received_count += 1;

        if slot.is_complete() {
            let slot = inner.slots.remove(&header.frame_number).expect("slot present");
            inner.stats.completed += 1;
            debug!("frame {} complete", header.frame_number);
            return FrameResult::Complete {
                frame_number: header.frame_number,
                pixels: slot.assemble(),
            };
        }
        if now.duration_since(slot.created_at) > self.timeout {
            let slot = inner.slots.remove(&header.frame_number).expect("slot present");
            inner.stats.partials += 1;
            let missing = slot.missing();
            warn!("frame {} timed out missing {} packets", header.frame_number, missing.len());
            return FrameResult::Partial {
                frame_number: header.frame_number,
                pixels: slot.assemble(),
                missing,
            };
        }
        FrameResult::Processing
    }

    /// Time out expired slots; returns the assembled partials.
    pub fn sweep(&self) -> Vec<FrameResult> {
        let mut inner = self.inner.lock().expect("slot map guard");
        let now = Instant::now();
        let expired: Vec<u32> = inner
            .slots
            .values()
            .filter(|slot| now.duration_since(slot.created_at) > self.timeout)
            .map(|slot| slot.frame_number)
            .collect();
        let mut results = Vec::with_capacity(expired.len());
        for frame_number in expired {
            let slot = inner.slots.remove(&frame_number).expect("expired slot present");
            inner.stats.partials += 1;
            let missing = slot.missing();
            warn!("sweep: frame {} missing {} packets", frame_number, missing.len());
            results.push(FrameResult::Partial { frame_number, pixels: slot.assemble(), missing });
        }
        results
    }

    fn evict_oldest(&self, inner: &mut Inner) {
        if let Some(frame_number) =
            inner.slots.values().min_by_key(|slot| slot.created_at).map(|slot| slot.frame_number)
        {
            inner.slots.remove(&frame_number);
            inner.stats.evictions += 1;
            warn!("slot table full, evicted frame {}", frame_number);
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> FrameReassembler { FrameReassembler::new() }
}
