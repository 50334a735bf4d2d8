//! Frame fragmentation and the data-channel transmitter thread.
//!
//! A committed frame is cut into `ceil(len / max_payload)` packets, each
//! prefixed with the 32-byte header. Timestamps are monotonically
//! non-decreasing across packets even if the wall clock steps backwards.
//! The transmitter drains the ring in frame order and reports each finished
//! frame to the sequence FSM as a Complete event.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, trace};

use fpd_protocol::{FrameHeader, HeaderFlags, HEADER_LEN};

use crate::api::{ScanEvent, SocError};
use crate::framebuf::FrameBufferManager;
use crate::registers::RegisterFile;
use crate::sequence::SequenceFsm;

/// Cuts frames into header-prefixed packets.
#[derive(Debug)]
pub struct Fragmenter {
    max_payload: usize,
    last_timestamp_ns: u64,
}

impl Fragmenter {
    /// `max_payload` must hold at least one pixel and stay pixel-aligned.
    pub fn new(max_payload: usize) -> Result<Fragmenter, SocError> {
        if max_payload < 2 || max_payload % 2 != 0 {
            return Err(SocError::ConfigRange("max_payload"));
        }
        Ok(Fragmenter { max_payload, last_timestamp_ns: 0 })
    }

    pub fn max_payload(&self) -> usize { self.max_payload }

    /// Fragment one frame. Packets come out in increasing `packet_index`,
    /// FIRST on the first, LAST on the last.
    pub fn fragment(
        &mut self,
        frame_number: u32,
        payload: &[u8],
        timestamp_ns: u64,
    ) -> Result<Vec<Vec<u8>>, SocError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let total = (payload.len() + self.max_payload - 1) / self.max_payload;
        if total > u16::MAX as usize {
            return Err(SocError::FrameTooLarge);
        }
        // never let the timestamp run backwards
        let timestamp_ns = timestamp_ns.max(self.last_timestamp_ns);
        self.last_timestamp_ns = timestamp_ns;
        let mut packets = Vec::with_capacity(total);
        for (index, chunk) in payload.chunks(self.max_payload).enumerate() {
            let mut flags = HeaderFlags::empty();
            if index == 0 {
                flags |= HeaderFlags::FIRST;
            }
            if index == total - 1 {
                flags |= HeaderFlags::LAST;
            }
            let header = FrameHeader {
                frame_number,
                packet_index: index as u16,
                total_packets: total as u16,
                payload_len: chunk.len() as u16,
                flags,
                timestamp_ns,
            };
            let mut packet = Vec::with_capacity(HEADER_LEN + chunk.len());
            packet.extend_from_slice(&header.encode());
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }
        Ok(packets)
    }
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TxStats {
    pub frames_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

pub struct UdpTransmitter {
    socket: UdpSocket,
    dest: SocketAddr,
    fragmenter: Fragmenter,
    stats: TxStats,
}

impl UdpTransmitter {
    pub fn new(socket: UdpSocket, dest: SocketAddr, max_payload: usize) -> Result<UdpTransmitter, SocError> {
        Ok(UdpTransmitter { socket, dest, fragmenter: Fragmenter::new(max_payload)?, stats: TxStats::default() })
    }

    pub fn stats(&self) -> TxStats { self.stats }

    /// Retarget the data stream (hot host_ip / data_port change).
    pub fn set_dest(&mut self, dest: SocketAddr) {
        info!("data channel retargeted to {}", dest);
        self.dest = dest;
    }

    /// Send every packet of one frame.
    pub fn send_frame(&mut self, frame_number: u32, payload: &[u8]) -> Result<u16, SocError> {
        let packets = self.fragmenter.fragment(frame_number, payload, now_ns())?;
        let total = packets.len() as u16;
        for (index, packet) in packets.iter().enumerate() {
            match self.socket.send_to(packet, self.dest) {
                Ok(n) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += n as u64;
                }
                Err(e) => {
                    self.stats.send_errors += 1;
                    error!("send of frame {} packet {} failed: {}", frame_number, index, e);
                }
            }
        }
        self.stats.frames_sent += 1;
        trace!("frame {}: {} packets out", frame_number, total);
        Ok(total)
    }

    /// Drain Ready slots until the run flag drops.
    ///
    /// Each sent frame is released back to the ring, counted in the
    /// register file and reported to the FSM as a Complete event.
    pub fn run(
        mut self,
        ring: Arc<FrameBufferManager>,
        fsm: Arc<Mutex<SequenceFsm>>,
        registers: Arc<RegisterFile>,
        run: Arc<AtomicBool>,
    ) -> TxStats {
        while run.load(Ordering::Relaxed) {
            match ring.acquire_ready() {
                Ok((frame_number, data)) => {
                    match self.send_frame(frame_number, &data) {
                        Ok(total) => ring.note_progress(frame_number, total, total),
                        Err(e) => error!("frame {} not sent: {}", frame_number, e),
                    }
                    if let Err(e) = ring.release(frame_number, data) {
                        // the slot was oldest-dropped while we were sending
                        trace!("release of frame {}: {}", frame_number, e);
                    }
                    registers.increment_frame_count();
                    let mut fsm = fsm.lock().expect("fsm guard");
                    let state = fsm.handle(ScanEvent::Complete);
                    registers.note_state(state);
                }
                Err(SocError::NoReadyFrame) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    error!("ring drain error: {}", e);
                }
            }
        }
        info!(
            "transmitter stopping: {} frames, {} packets, {} bytes",
            self.stats.frames_sent, self.stats.packets_sent, self.stats.bytes_sent
        );
        self.stats
    }
}
