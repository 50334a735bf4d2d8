//! The 32-byte little-endian header that prefixes every data-channel packet.
//!
//! Layout on the wire:
//!
//! | bytes  | field         |
//! |--------|---------------|
//! | 0..4   | magic 0xD7E01234 |
//! | 4..8   | frame_number  |
//! | 8..10  | packet_index  |
//! | 10..12 | total_packets |
//! | 12..14 | payload_len   |
//! | 14..16 | flags         |
//! | 16..20 | reserved (0)  |
//! | 20..28 | timestamp_ns  |
//! | 28..30 | crc16 over bytes 0..28 |
//! | 30..32 | reserved (0)  |

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::crc::crc16;
use crate::WireError;

pub const FRAME_MAGIC: u32 = 0xD7E0_1234;
pub const HEADER_LEN: usize = 32;
/// Shortest acceptable data packet: the header plus one 16-bit pixel.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 2;

const CRC_COVERAGE: usize = 28;

bitflags! {
    pub struct HeaderFlags: u16 {
        /// first packet of a frame
        const FIRST = 0x0001;
        /// last packet of a frame
        const LAST  = 0x0002;
        /// the sender knows this frame is degraded
        const DROP  = 0x8000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_number: u32,
    pub packet_index: u16,
    pub total_packets: u16,
    pub payload_len: u16,
    pub flags: HeaderFlags,
    pub timestamp_ns: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], FRAME_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.frame_number);
        LittleEndian::write_u16(&mut buf[8..10], self.packet_index);
        LittleEndian::write_u16(&mut buf[10..12], self.total_packets);
        LittleEndian::write_u16(&mut buf[12..14], self.payload_len);
        LittleEndian::write_u16(&mut buf[14..16], self.flags.bits());
        // bytes 16..20 reserved
        LittleEndian::write_u64(&mut buf[20..28], self.timestamp_ns);
        let crc = crc16(&buf[..CRC_COVERAGE]);
        LittleEndian::write_u16(&mut buf[28..30], crc);
        // bytes 30..32 reserved
        buf
    }

    /// Decode and validate a header from the front of a datagram.
    ///
    /// Order matters: length, then magic, then CRC. A CRC failure means the
    /// rest of the fields cannot be trusted, so no partial result is returned.
    pub fn decode(buf: &[u8]) -> Result<FrameHeader, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        if LittleEndian::read_u32(&buf[0..4]) != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        let wire_crc = LittleEndian::read_u16(&buf[28..30]);
        if crc16(&buf[..CRC_COVERAGE]) != wire_crc {
            return Err(WireError::CrcMismatch);
        }
        Ok(FrameHeader {
            frame_number: LittleEndian::read_u32(&buf[4..8]),
            packet_index: LittleEndian::read_u16(&buf[8..10]),
            total_packets: LittleEndian::read_u16(&buf[10..12]),
            payload_len: LittleEndian::read_u16(&buf[12..14]),
            flags: HeaderFlags::from_bits_truncate(LittleEndian::read_u16(&buf[14..16])),
            timestamp_ns: LittleEndian::read_u64(&buf[20..28]),
        })
    }
}
