//! CSI-2 packet generation and parsing.
//!
//! One frame crosses the link as `FS, {LS, LineData, LE} x height, FE`.
//! Short packets are four bytes: a data-identifier byte (virtual channel in
//! the top two bits, data type below), a 16-bit value, and an ECC byte. The
//! real link protects the header with a Hamming code; the model folds the
//! three header bytes into a single parity byte, which catches the same
//! class of single-byte corruption in simulation.
//!
//! Line data travels as a long packet whose payload is the 16-bit line
//! number followed by the pixels, all big-endian, sealed by a CRC-16 over
//! the pixel bytes. Multi-byte fields inside CSI-2 packets are big-endian
//! throughout.

use byteorder::{BigEndian, ByteOrder};
use fpd_protocol::crc16;
use log::trace;

use crate::{FpgaError, MAX_LINE_PIXELS};

/// RAW16 data type per the CSI-2 spec.
pub const DATA_TYPE_RAW16: u8 = 0x2E;

const DT_FRAME_START: u8 = 0x00;
const DT_FRAME_END: u8 = 0x01;
const DT_LINE_START: u8 = 0x02;
const DT_LINE_END: u8 = 0x03;

const SHORT_PACKET_LEN: usize = 4;
const LONG_HEADER_LEN: usize = 4;
const LONG_FOOTER_LEN: usize = 2;

pub const MAX_VIRTUAL_CHANNELS: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Csi2Packet {
    FrameStart { virtual_channel: u8, frame_number: u16 },
    FrameEnd { virtual_channel: u8, frame_number: u16 },
    LineStart { virtual_channel: u8, line_number: u16 },
    LineEnd { virtual_channel: u8, line_number: u16 },
    LineData { virtual_channel: u8, line_number: u16, pixels: Vec<u16>, crc16: u16 },
}

impl Csi2Packet {
    pub fn virtual_channel(&self) -> u8 {
        match self {
            Csi2Packet::FrameStart { virtual_channel, .. }
            | Csi2Packet::FrameEnd { virtual_channel, .. }
            | Csi2Packet::LineStart { virtual_channel, .. }
            | Csi2Packet::LineEnd { virtual_channel, .. }
            | Csi2Packet::LineData { virtual_channel, .. } => *virtual_channel,
        }
    }

    /// Serialized size in bytes.
    pub fn wire_len(&self) -> usize {
        match self {
            Csi2Packet::LineData { pixels, .. } => {
                LONG_HEADER_LEN + 2 + pixels.len() * 2 + LONG_FOOTER_LEN
            }
            _ => SHORT_PACKET_LEN,
        }
    }
}

fn data_id(virtual_channel: u8, data_type: u8) -> u8 { (virtual_channel << 6) | (data_type & 0x3F) }

// parity fold standing in for the MIPI header ECC
fn ecc(bytes: &[u8]) -> u8 { bytes.iter().fold(0, |acc, b| acc ^ b) }

fn serialize_short(out: &mut Vec<u8>, virtual_channel: u8, data_type: u8, value: u16) {
    let mut hdr = [0u8; 3];
    hdr[0] = data_id(virtual_channel, data_type);
    BigEndian::write_u16(&mut hdr[1..3], value);
    out.extend_from_slice(&hdr);
    out.push(ecc(&hdr));
}

/// Serialize one packet to its byte-level representation.
pub fn serialize(packet: &Csi2Packet) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.wire_len());
    match packet {
        Csi2Packet::FrameStart { virtual_channel, frame_number } => {
            serialize_short(&mut out, *virtual_channel, DT_FRAME_START, *frame_number)
        }
        Csi2Packet::FrameEnd { virtual_channel, frame_number } => {
            serialize_short(&mut out, *virtual_channel, DT_FRAME_END, *frame_number)
        }
        Csi2Packet::LineStart { virtual_channel, line_number } => {
            serialize_short(&mut out, *virtual_channel, DT_LINE_START, *line_number)
        }
        Csi2Packet::LineEnd { virtual_channel, line_number } => {
            serialize_short(&mut out, *virtual_channel, DT_LINE_END, *line_number)
        }
        Csi2Packet::LineData { virtual_channel, line_number, pixels, crc16 } => {
            let word_count = (2 + pixels.len() * 2) as u16;
            let mut hdr = [0u8; 3];
            hdr[0] = data_id(*virtual_channel, DATA_TYPE_RAW16);
            BigEndian::write_u16(&mut hdr[1..3], word_count);
            out.extend_from_slice(&hdr);
            out.push(ecc(&hdr));
            let mut payload = vec![0u8; word_count as usize];
            BigEndian::write_u16(&mut payload[0..2], *line_number);
            BigEndian::write_u16_into(pixels, &mut payload[2..]);
            out.extend_from_slice(&payload);
            let mut footer = [0u8; 2];
            BigEndian::write_u16(&mut footer, *crc16);
            out.extend_from_slice(&footer);
        }
    }
    out
}

/// Parse one packet from the front of `buf`; returns the packet and the
/// number of bytes consumed.
pub fn parse(buf: &[u8]) -> Result<(Csi2Packet, usize), FpgaError> {
    if buf.len() < SHORT_PACKET_LEN {
        return Err(FpgaError::Truncated);
    }
    if ecc(&buf[0..3]) != buf[3] {
        return Err(FpgaError::BadEcc);
    }
    let virtual_channel = buf[0] >> 6;
    let data_type = buf[0] & 0x3F;
    let value = BigEndian::read_u16(&buf[1..3]);
    match data_type {
        DT_FRAME_START => Ok((Csi2Packet::FrameStart { virtual_channel, frame_number: value }, SHORT_PACKET_LEN)),
        DT_FRAME_END => Ok((Csi2Packet::FrameEnd { virtual_channel, frame_number: value }, SHORT_PACKET_LEN)),
        DT_LINE_START => Ok((Csi2Packet::LineStart { virtual_channel, line_number: value }, SHORT_PACKET_LEN)),
        DT_LINE_END => Ok((Csi2Packet::LineEnd { virtual_channel, line_number: value }, SHORT_PACKET_LEN)),
        DATA_TYPE_RAW16 => {
            let word_count = value as usize;
            let total = LONG_HEADER_LEN + word_count + LONG_FOOTER_LEN;
            if word_count < 2 || word_count % 2 != 0 {
                // a complete packet can never have this shape; treat it as
                // a framing error, not as missing bytes
                return Err(FpgaError::BadDataType);
            }
            if buf.len() < total {
                return Err(FpgaError::Truncated);
            }
            let payload = &buf[LONG_HEADER_LEN..LONG_HEADER_LEN + word_count];
            let line_number = BigEndian::read_u16(&payload[0..2]);
            let pixel_bytes = &payload[2..];
            let wire_crc = BigEndian::read_u16(&buf[total - LONG_FOOTER_LEN..total]);
            if crc16(pixel_bytes) != wire_crc {
                return Err(FpgaError::CrcMismatch);
            }
            let mut pixels = vec![0u16; pixel_bytes.len() / 2];
            BigEndian::read_u16_into(pixel_bytes, &mut pixels);
            Ok((
                Csi2Packet::LineData { virtual_channel, line_number, pixels, crc16: wire_crc },
                total,
            ))
        }
        _ => Err(FpgaError::BadDataType),
    }
}

/// Streaming packet generator: drives the FS..FE envelope for one frame at
/// a time and numbers the lines.
#[derive(Debug)]
pub struct Csi2Packetizer {
    virtual_channel: u8,
    frame_number: u16,
    line_number: u16,
    in_frame: bool,
}

impl Csi2Packetizer {
    pub fn new(virtual_channel: u8) -> Result<Csi2Packetizer, FpgaError> {
        if virtual_channel >= MAX_VIRTUAL_CHANNELS {
            return Err(FpgaError::InvalidConfig);
        }
        Ok(Csi2Packetizer { virtual_channel, frame_number: 0, line_number: 0, in_frame: false })
    }

    pub fn start_frame(&mut self, frame_number: u16) -> Result<Csi2Packet, FpgaError> {
        if self.in_frame {
            return Err(FpgaError::OutOfSequence);
        }
        self.in_frame = true;
        self.frame_number = frame_number;
        self.line_number = 0;
        trace!("FS vc={} frame={}", self.virtual_channel, frame_number);
        Ok(Csi2Packet::FrameStart { virtual_channel: self.virtual_channel, frame_number })
    }

    /// Emit LS, LineData, LE for the next line of the open frame.
    pub fn push_line(&mut self, pixels: &[u16]) -> Result<Vec<Csi2Packet>, FpgaError> {
        if !self.in_frame {
            return Err(FpgaError::OutOfSequence);
        }
        if pixels.is_empty() || pixels.len() > MAX_LINE_PIXELS {
            return Err(FpgaError::Overflow);
        }
        let line_number = self.line_number;
        self.line_number = self.line_number.wrapping_add(1);
        let mut pixel_bytes = vec![0u8; pixels.len() * 2];
        BigEndian::write_u16_into(pixels, &mut pixel_bytes);
        let crc = crc16(&pixel_bytes);
        Ok(vec![
            Csi2Packet::LineStart { virtual_channel: self.virtual_channel, line_number },
            Csi2Packet::LineData {
                virtual_channel: self.virtual_channel,
                line_number,
                pixels: pixels.to_vec(),
                crc16: crc,
            },
            Csi2Packet::LineEnd { virtual_channel: self.virtual_channel, line_number },
        ])
    }

    pub fn end_frame(&mut self) -> Result<Csi2Packet, FpgaError> {
        if !self.in_frame {
            return Err(FpgaError::OutOfSequence);
        }
        self.in_frame = false;
        trace!("FE vc={} frame={} lines={}", self.virtual_channel, self.frame_number, self.line_number);
        Ok(Csi2Packet::FrameEnd {
            virtual_channel: self.virtual_channel,
            frame_number: self.frame_number,
        })
    }

    pub fn lines_in_frame(&self) -> u16 { self.line_number }
}

/// Convenience wrapper producing the whole packet train for one frame.
pub fn packetize_frame(
    virtual_channel: u8,
    frame_number: u16,
    lines: &[Vec<u16>],
) -> Result<Vec<Csi2Packet>, FpgaError> {
    let mut gen = Csi2Packetizer::new(virtual_channel)?;
    let mut train = Vec::with_capacity(2 + lines.len() * 3);
    train.push(gen.start_frame(frame_number)?);
    for line in lines {
        train.extend(gen.push_line(line)?);
    }
    train.push(gen.end_frame()?);
    Ok(train)
}
