//! Streaming receiver: data socket in, reassembled frames out.
//!
//! The receive thread owns the socket and the reassembler; completed and
//! partial frames go into a bounded channel. If the consumer falls behind,
//! `send` blocks and the socket buffer absorbs the burst; the OS then drops
//! excess datagrams, which surface later as Partial frames rather than
//! being silently swallowed here.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, trace, warn};

use crate::reassembler::{FrameReassembler, FrameResult, ReassemblyStats};

/// One frame delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub frame_number: u32,
    pub pixels: Vec<u16>,
    /// false when the frame timed out and carries zero-filled gaps
    pub complete: bool,
    /// packet indices that never arrived (empty when complete)
    pub missing: Vec<u16>,
}

pub struct FrameReceiver {
    local_addr: SocketAddr,
    run: Arc<AtomicBool>,
    handle: Option<JoinHandle<ReassemblyStats>>,
}

impl FrameReceiver {
    /// Bind `addr` (port 0 for ephemeral) and start the receive thread.
    /// Frames arrive on the returned channel; it holds at most `depth`
    /// frames before backpressuring the receive thread.
    pub fn spawn(
        addr: SocketAddr,
        reassembler: FrameReassembler,
        depth: usize,
    ) -> std::io::Result<(FrameReceiver, Receiver<ReceivedFrame>)> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;
        let run = Arc::new(AtomicBool::new(true));
        let (frames_tx, frames_rx) = std::sync::mpsc::sync_channel(depth);
        let thread_run = run.clone();
        let handle = std::thread::Builder::new()
            .name("fpd-rx".to_string())
            .spawn(move || receive_loop(socket, reassembler, frames_tx, thread_run))?;
        info!("frame receiver on {}", local_addr);
        Ok((FrameReceiver { local_addr, run, handle: Some(handle) }, frames_rx))
    }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Stop the receive thread and return the reassembly statistics.
    pub fn stop(mut self) -> ReassemblyStats {
        self.run.store(false, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => ReassemblyStats::default(),
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deliver(frames_tx: &SyncSender<ReceivedFrame>, result: FrameResult) -> bool {
    let frame = match result {
        FrameResult::Complete { frame_number, pixels } => {
            ReceivedFrame { frame_number, pixels, complete: true, missing: Vec::new() }
        }
        FrameResult::Partial { frame_number, pixels, missing } => {
            ReceivedFrame { frame_number, pixels, complete: false, missing }
        }
        _ => return true,
    };
    trace!(
        "delivering frame {} ({})",
        frame.frame_number,
        if frame.complete { "complete" } else { "partial" }
    );
    // a closed channel means the consumer is gone; stop the loop
    frames_tx.send(frame).is_ok()
}

fn receive_loop(
    socket: UdpSocket,
    reassembler: FrameReassembler,
    frames_tx: SyncSender<ReceivedFrame>,
    run: Arc<AtomicBool>,
) -> ReassemblyStats {
    // headroom above jumbo payload + header
    let mut buf = vec![0u8; 16384];
    let mut last_sweep = Instant::now();
    while run.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => {
                let result = reassembler.process_packet(&buf[..len]);
                if let FrameResult::Error(ref reason) = result {
                    warn!("dropped datagram: {}", reason);
                }
                if !deliver(&frames_tx, result) {
                    break;
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("recv error: {}", e);
            }
        }
        if last_sweep.elapsed() >= Duration::from_millis(100) {
            last_sweep = Instant::now();
            for partial in reassembler.sweep() {
                if !deliver(&frames_tx, partial) {
                    return reassembler.stats();
                }
            }
        }
    }
    reassembler.stats()
}
