//! Four-slot frame ring between the CSI-2 receive path and the UDP
//! transmitter.
//!
//! A slot's home position is `frame_number % 4`, and a slot walks
//! Free → Filling → Ready → Sending → Free. When a new frame arrives and
//! its slot is taken, the oldest occupant is dropped rather than blocking
//! the readout (the panel cannot be stalled): preferentially the oldest
//! Ready frame, otherwise the oldest occupant of any state.
//!
//! Slot storage travels with the caller: `acquire` hands out the slot's
//! backing buffer for filling, `commit` returns it; `acquire_ready` lends
//! it to the transmitter, `release` brings it home. The allocation is
//! reused across the life of the ring.

use std::sync::Mutex;

use log::{trace, warn};

use crate::api::SocError;

pub const NUM_BUFFERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Free = 0,
    Filling = 1,
    Ready = 2,
    Sending = 3,
}

impl SlotState {
    fn name(self) -> &'static str {
        match self {
            SlotState::Free => "Free",
            SlotState::Filling => "Filling",
            SlotState::Ready => "Ready",
            SlotState::Sending => "Sending",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub frames_received: u32,
    pub frames_sent: u32,
    pub frames_dropped: u32,
    pub overruns: u32,
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    size: usize,
    state: SlotState,
    frame_number: u32,
    total_packets: u16,
    sent_packets: u16,
}

impl Slot {
    fn new(capacity: usize) -> Slot {
        Slot {
            data: Vec::with_capacity(capacity),
            size: 0,
            state: SlotState::Free,
            frame_number: 0,
            total_packets: 0,
            sent_packets: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    stats: BufferStats,
}

#[derive(Debug)]
pub struct FrameBufferManager {
    inner: Mutex<Inner>,
}

impl FrameBufferManager {
    /// `frame_bytes` sizes the per-slot allocations up front.
    pub fn new(frame_bytes: usize) -> FrameBufferManager {
        FrameBufferManager {
            inner: Mutex::new(Inner {
                slots: (0..NUM_BUFFERS).map(|_| Slot::new(frame_bytes)).collect(),
                stats: BufferStats::default(),
            }),
        }
    }

    /// Claim a slot for `frame_number` and borrow its storage for filling.
    ///
    /// Never blocks: if the ring is saturated the oldest occupant is
    /// dropped and its slot reused immediately.
    pub fn acquire(&self, frame_number: u32) -> Result<Vec<u8>, SocError> {
        let mut inner = self.inner.lock().expect("frame ring guard");
        if let Some(slot) = inner.slots.iter().find(|s| s.state != SlotState::Free && s.frame_number == frame_number) {
            return Err(SocError::SlotState { frame_number, state: slot.state.name() });
        }
        let home = frame_number as usize % NUM_BUFFERS;
        let idx = if inner.slots[home].state == SlotState::Free {
            home
        } else {
            let victim = Self::pick_victim(&inner.slots);
            let dropped = inner.slots[victim].frame_number;
            warn!(
                "ring saturated: dropping frame {} ({}) for frame {}",
                dropped, inner.slots[victim].state.name(), frame_number
            );
            inner.stats.frames_dropped += 1;
            inner.stats.overruns += 1;
            victim
        };
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Filling;
        slot.frame_number = frame_number;
        slot.size = 0;
        slot.total_packets = 0;
        slot.sent_packets = 0;
        let mut storage = std::mem::take(&mut slot.data);
        storage.clear();
        trace!("frame {} filling in slot {}", frame_number, idx);
        Ok(storage)
    }

    // oldest Ready first; if nothing is Ready, oldest occupant of any state
    fn pick_victim(slots: &[Slot]) -> usize {
        let ready = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .min_by_key(|(_, s)| s.frame_number)
            .map(|(i, _)| i);
        ready.unwrap_or_else(|| {
            slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state != SlotState::Free)
                .min_by_key(|(_, s)| s.frame_number)
                .map(|(i, _)| i)
                .expect("saturated ring has a non-Free slot")
        })
    }

    /// Return the filled storage; Filling → Ready.
    pub fn commit(&self, frame_number: u32, data: Vec<u8>) -> Result<(), SocError> {
        let mut inner = self.inner.lock().expect("frame ring guard");
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.state != SlotState::Free && s.frame_number == frame_number)
            .ok_or(SocError::UnknownFrame(frame_number))?;
        if slot.state != SlotState::Filling {
            return Err(SocError::SlotState { frame_number, state: slot.state.name() });
        }
        slot.size = data.len();
        slot.data = data;
        slot.state = SlotState::Ready;
        inner.stats.frames_received += 1;
        Ok(())
    }

    /// Lend out the oldest Ready frame for transmission; Ready → Sending.
    pub fn acquire_ready(&self) -> Result<(u32, Vec<u8>), SocError> {
        let mut inner = self.inner.lock().expect("frame ring guard");
        let idx = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .min_by_key(|(_, s)| s.frame_number)
            .map(|(i, _)| i)
            .ok_or(SocError::NoReadyFrame)?;
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Sending;
        let data = std::mem::take(&mut slot.data);
        trace!("frame {} sending from slot {}", slot.frame_number, idx);
        Ok((slot.frame_number, data))
    }

    /// Record fragmentation progress for observability.
    pub fn note_progress(&self, frame_number: u32, total_packets: u16, sent_packets: u16) {
        let mut inner = self.inner.lock().expect("frame ring guard");
        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Sending && s.frame_number == frame_number)
        {
            slot.total_packets = total_packets;
            slot.sent_packets = sent_packets;
        }
    }

    /// Transmission finished; the storage comes home and the slot frees.
    pub fn release(&self, frame_number: u32, storage: Vec<u8>) -> Result<(), SocError> {
        let mut inner = self.inner.lock().expect("frame ring guard");
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.state != SlotState::Free && s.frame_number == frame_number)
            .ok_or(SocError::UnknownFrame(frame_number))?;
        if slot.state != SlotState::Sending {
            return Err(SocError::SlotState { frame_number, state: slot.state.name() });
        }
        slot.data = storage;
        slot.size = 0;
        slot.state = SlotState::Free;
        inner.stats.frames_sent += 1;
        Ok(())
    }

    pub fn stats(&self) -> BufferStats { self.inner.lock().expect("frame ring guard").stats }

    pub fn slot_states(&self) -> [SlotState; NUM_BUFFERS] {
        let inner = self.inner.lock().expect("frame ring guard");
        let mut states = [SlotState::Free; NUM_BUFFERS];
        for (i, slot) in inner.slots.iter().enumerate() {
            states[i] = slot.state;
        }
        states
    }

    pub fn occupied(&self) -> usize {
        self.inner
            .lock()
            .expect("frame ring guard")
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn full_slot_cycle() {
        let ring = FrameBufferManager::new(16);
        let mut buf = ring.acquire(0).unwrap();
        buf.extend_from_slice(&[1, 2, 3, 4]);
        ring.commit(0, buf).unwrap();
        let (frame, data) = ring.acquire_ready().unwrap();
        assert_eq!(frame, 0);
        assert_eq!(data, vec![1, 2, 3, 4]);
        ring.release(0, data).unwrap();
        assert_eq!(ring.occupied(), 0);
        let stats = ring.stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn oldest_drop_on_saturation() {
        let ring = FrameBufferManager::new(4);
        for n in 0..4 {
            ring.acquire(n).unwrap();
        }
        assert_eq!(ring.occupied(), 4);
        // all four Filling, none Ready: frame 0 is the oldest occupant
        ring.acquire(4).unwrap();
        assert_eq!(ring.occupied(), 4);
        assert_eq!(ring.stats().frames_dropped, 1);
        assert_eq!(ring.stats().overruns, 1);
        // frame 0 is gone; its commit must fail
        assert_eq!(ring.commit(0, vec![]), Err(SocError::UnknownFrame(0)));
        // frame 4 took the slot
        ring.commit(4, vec![0xAB]).unwrap();
        let (frame, data) = ring.acquire_ready().unwrap();
        assert_eq!(frame, 4);
        ring.release(4, data).unwrap();
    }

    #[test]
    fn drop_prefers_ready_over_older_filling() {
        let ring = FrameBufferManager::new(4);
        let buf = ring.acquire(0).unwrap();
        for n in 1..4 {
            ring.acquire(n).unwrap();
        }
        // frame 1 is Ready, frames 0/2/3 Filling; the Ready one goes first
        ring.commit(1, vec![1]).unwrap();
        ring.acquire(5).unwrap();
        assert_eq!(ring.commit(1, vec![1]), Err(SocError::UnknownFrame(1)));
        // frame 0, older but Filling, survived
        ring.commit(0, buf).unwrap();
    }

    #[test]
    fn ready_drains_in_frame_order() {
        let ring = FrameBufferManager::new(4);
        for n in [2u32, 0, 1].iter() {
            let buf = ring.acquire(*n).unwrap();
            ring.commit(*n, buf).unwrap();
        }
        let order: Vec<u32> = (0..3)
            .map(|_| {
                let (frame, data) = ring.acquire_ready().unwrap();
                ring.release(frame, data).unwrap();
                frame
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn wrong_state_operations_fail() {
        let ring = FrameBufferManager::new(4);
        assert_eq!(ring.acquire_ready().err(), Some(SocError::NoReadyFrame));
        assert_eq!(ring.commit(7, vec![]), Err(SocError::UnknownFrame(7)));
        assert_eq!(ring.release(7, vec![]), Err(SocError::UnknownFrame(7)));
        let buf = ring.acquire(7).unwrap();
        // double acquire of a live frame
        assert!(matches!(ring.acquire(7), Err(SocError::SlotState { .. })));
        // commit twice
        ring.commit(7, buf).unwrap();
        assert!(matches!(ring.commit(7, vec![]), Err(SocError::SlotState { .. })));
        // release before acquire_ready
        assert!(matches!(ring.release(7, vec![]), Err(SocError::SlotState { .. })));
    }

    #[test]
    fn never_more_than_four_occupied() {
        let ring = FrameBufferManager::new(4);
        for n in 0..64 {
            ring.acquire(n).unwrap();
            assert!(ring.occupied() <= NUM_BUFFERS);
        }
        assert_eq!(ring.stats().frames_dropped, 60);
    }

    #[test]
    fn producer_consumer_threads() {
        let ring = Arc::new(FrameBufferManager::new(8));
        let producer_ring = ring.clone();
        let producer = std::thread::spawn(move || {
            for n in 0..200u32 {
                if let Ok(mut buf) = producer_ring.acquire(n) {
                    buf.extend_from_slice(&n.to_le_bytes());
                    // the slot may have been dropped again under us only
                    // after commit, never during it
                    let _ = producer_ring.commit(n, buf);
                }
                std::thread::yield_now();
            }
        });
        let consumer_ring = ring.clone();
        let consumer = std::thread::spawn(move || {
            let mut drained = 0u32;
            let mut last = None;
            while drained < 50 {
                match consumer_ring.acquire_ready() {
                    Ok((frame, data)) => {
                        if let Some(prev) = last {
                            assert!(frame > prev, "drain order regressed: {} after {}", frame, prev);
                        }
                        last = Some(frame);
                        consumer_ring.release(frame, data).unwrap();
                        drained += 1;
                    }
                    Err(SocError::NoReadyFrame) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected error: {:?}", e),
                }
            }
        });
        producer.join().unwrap();
        consumer.join().unwrap();
        let stats = ring.stats();
        assert!(stats.frames_sent >= 50);
        assert!(stats.frames_received as usize >= stats.frames_sent as usize);
        assert!(ring.occupied() <= NUM_BUFFERS);
    }
}
