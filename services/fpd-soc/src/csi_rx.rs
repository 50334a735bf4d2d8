//! CSI-2 receive path: byte stream in, committed frame slots out.
//!
//! The assembler consumes the packetizer's serialization, validates line
//! checksums and rebuilds frames directly into ring slots. Pixels stay in
//! wire order (big-endian) inside the slot, which is exactly the layout
//! the UDP fragmenter sends, so the frame is never byte-swapped on the SoC.
//!
//! A line that fails its CRC is dropped and its row stays zero; a frame
//! that ends short of the configured height is committed anyway with the
//! missing rows zero-filled. Either way the consumer gets a frame, and the
//! fault counters tell the host what happened.

use byteorder::{BigEndian, ByteOrder};
use fpd_fpga::csi2::{self, Csi2Packet};
use fpd_fpga::FpgaError;
use log::{debug, trace, warn};

use crate::api::SocError;
use crate::framebuf::FrameBufferManager;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    pub frames_started: u64,
    pub frames_committed: u64,
    pub short_frames: u64,
    pub line_crc_errors: u64,
    pub resync_bytes: u64,
    pub orphan_packets: u64,
}

struct OpenFrame {
    frame_number: u32,
    storage: Vec<u8>,
    lines_stored: usize,
}

pub struct CsiRxAssembler {
    width: usize,
    height: usize,
    virtual_channel: u8,
    next_frame_number: u32,
    pending: Vec<u8>,
    open: Option<OpenFrame>,
    stats: RxStats,
}

impl CsiRxAssembler {
    pub fn new(width: usize, height: usize, virtual_channel: u8) -> CsiRxAssembler {
        CsiRxAssembler {
            width,
            height,
            virtual_channel,
            next_frame_number: 0,
            pending: Vec::new(),
            open: None,
            stats: RxStats::default(),
        }
    }

    pub fn stats(&self) -> RxStats { self.stats }

    pub fn frame_bytes(&self) -> usize { self.width * self.height * 2 }

    /// Feed link bytes; returns the frame numbers committed to the ring.
    ///
    /// Partial packets are buffered until the rest arrives. A corrupted
    /// line payload skips that line; a corrupted packet header resyncs by
    /// sliding one byte.
    pub fn push_bytes(
        &mut self,
        bytes: &[u8],
        ring: &FrameBufferManager,
    ) -> Result<Vec<u32>, SocError> {
        self.pending.extend_from_slice(bytes);
        let mut committed = Vec::new();
        let mut offset = 0;
        while offset < self.pending.len() {
            match csi2::parse(&self.pending[offset..]) {
                Ok((packet, used)) => {
                    offset += used;
                    if let Some(frame) = self.handle_packet(packet, ring)? {
                        committed.push(frame);
                    }
                }
                Err(FpgaError::Truncated) => break,
                Err(FpgaError::CrcMismatch) => {
                    // the long-packet header was intact, so the length is
                    // trustworthy: skip the whole packet, lose one line
                    let skip = long_packet_len(&self.pending[offset..]);
                    self.stats.line_crc_errors += 1;
                    warn!("line CRC error, skipping {} bytes", skip);
                    offset += skip;
                }
                Err(_) => {
                    self.stats.resync_bytes += 1;
                    offset += 1;
                }
            }
        }
        self.pending.drain(..offset);
        Ok(committed)
    }

    /// Feed one already-parsed packet (used by in-process simulations that
    /// skip serialization).
    pub fn push_packet(
        &mut self,
        packet: Csi2Packet,
        ring: &FrameBufferManager,
    ) -> Result<Option<u32>, SocError> {
        self.handle_packet(packet, ring)
    }

    fn handle_packet(
        &mut self,
        packet: Csi2Packet,
        ring: &FrameBufferManager,
    ) -> Result<Option<u32>, SocError> {
        if packet.virtual_channel() != self.virtual_channel {
            self.stats.orphan_packets += 1;
            return Ok(None);
        }
        match packet {
            Csi2Packet::FrameStart { frame_number, .. } => {
                if self.open.is_some() {
                    warn!("FS without FE, abandoning open frame");
                    self.abandon_open();
                }
                let assigned = self.next_frame_number;
                if frame_number != assigned as u16 {
                    debug!(
                        "FS number {} does not match low bits of {}, trusting local counter",
                        frame_number, assigned
                    );
                }
                let mut storage = ring.acquire(assigned)?;
                storage.clear();
                storage.resize(self.frame_bytes(), 0);
                self.stats.frames_started += 1;
                self.open = Some(OpenFrame { frame_number: assigned, storage, lines_stored: 0 });
                Ok(None)
            }
            Csi2Packet::LineData { line_number, pixels, .. } => {
                let width = self.width;
                let height = self.height;
                match self.open.as_mut() {
                    Some(open) => {
                        let line = line_number as usize;
                        if line >= height {
                            warn!("line {} outside frame height {}", line_number, height);
                            return Ok(None);
                        }
                        let row = &mut open.storage[line * width * 2..(line + 1) * width * 2];
                        let n = pixels.len().min(width);
                        BigEndian::write_u16_into(&pixels[..n], &mut row[..n * 2]);
                        open.lines_stored += 1;
                        trace!("line {} stored ({} px)", line_number, n);
                        Ok(None)
                    }
                    None => {
                        self.stats.orphan_packets += 1;
                        Ok(None)
                    }
                }
            }
            Csi2Packet::LineStart { .. } | Csi2Packet::LineEnd { .. } => Ok(None),
            Csi2Packet::FrameEnd { .. } => match self.open.take() {
                Some(open) => {
                    if open.lines_stored < self.height {
                        self.stats.short_frames += 1;
                        debug!(
                            "frame {} short: {} of {} lines",
                            open.frame_number, open.lines_stored, self.height
                        );
                    }
                    ring.commit(open.frame_number, open.storage)?;
                    self.stats.frames_committed += 1;
                    self.next_frame_number = self.next_frame_number.wrapping_add(1);
                    Ok(Some(open.frame_number))
                }
                None => {
                    self.stats.orphan_packets += 1;
                    Ok(None)
                }
            },
        }
    }

    fn abandon_open(&mut self) {
        if let Some(open) = self.open.take() {
            // the ring slot stays Filling; the next acquire for this ring
            // position will oldest-drop it
            drop(open.storage);
            self.next_frame_number = self.next_frame_number.wrapping_add(1);
        }
    }
}

// total wire length of the long packet at the head of `buf`, assuming the
// 4-byte header already passed its ECC check
fn long_packet_len(buf: &[u8]) -> usize {
    if buf.len() < 4 {
        return buf.len();
    }
    let word_count = BigEndian::read_u16(&buf[1..3]) as usize;
    (4 + word_count + 2).min(buf.len())
}
