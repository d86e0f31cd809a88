use crc::{Crc, CRC_16_XMODEM};
use num_traits::FromPrimitive;

use super::{
    Codec, Frame, Layer, PacketType, ProtocolError, ProtocolKind, Result, ADDR_MAX, FRAME_OVERHEAD,
    MAX_DATA_LEN,
};

const XC2_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Bytes covered by the LEN field that are not payload.
const HEADER_LEN: usize = 6;

pub fn checksum(bytes: &[u8]) -> u16 {
    XC2_CRC.checksum(bytes)
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    if frame.data.len() > MAX_DATA_LEN {
        return Err(ProtocolError::PayloadTooLong(frame.data.len()));
    }
    for addr in [frame.dst, frame.src] {
        if addr > ADDR_MAX {
            return Err(ProtocolError::InvalidAddress(addr));
        }
    }

    let mut buf = Vec::with_capacity(frame.data.len() + FRAME_OVERHEAD);
    buf.push(frame.kind as u8 | (frame.dst >> 8) as u8);
    buf.push((frame.dst & 0xFF) as u8);
    buf.push((frame.flags & 0xF0) | (frame.src >> 8) as u8);
    buf.push((frame.src & 0xFF) as u8);
    buf.push((HEADER_LEN + frame.data.len()) as u8);
    buf.push(frame.cmd);
    buf.extend_from_slice(&frame.data);

    let cs = checksum(&buf);
    buf.extend_from_slice(&cs.to_be_bytes());
    Ok(buf)
}

pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_OVERHEAD {
        return None;
    }
    // a bogus length still yields a unit so that decode can reject it
    let total = (buf[4] as usize).max(HEADER_LEN) + 2;
    (buf.len() >= total).then(|| total)
}

pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(ProtocolError::Truncated);
    }

    let len = buf[4] as usize;
    if len < HEADER_LEN {
        return Err(ProtocolError::Malformed("length below header size"));
    }
    if buf.len() < len + 2 {
        return Err(ProtocolError::Truncated);
    }

    let cs = u16::from_be_bytes([buf[len], buf[len + 1]]);
    if checksum(&buf[..len]) != cs {
        return Err(ProtocolError::ChecksumMismatch(Layer::Inner));
    }

    let kind =
        PacketType::from_u8(buf[0] & 0xF0).ok_or(ProtocolError::Malformed("unknown packet type"))?;

    let frame = Frame {
        kind,
        dst: (((buf[0] & 0x0F) as u16) << 8) | buf[1] as u16,
        src: (((buf[2] & 0x0F) as u16) << 8) | buf[3] as u16,
        flags: buf[2] & 0xF0,
        cmd: buf[5],
        data: buf[HEADER_LEN..len].to_vec(),
    };

    Ok((frame, len + 2))
}

pub struct Xc2Codec;

impl Codec for Xc2Codec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        encode(frame)
    }

    fn decode(&self, buf: &[u8]) -> Result<(Frame, usize)> {
        decode(buf)
    }

    fn frame_len(&self, buf: &[u8]) -> Option<usize> {
        frame_len(buf)
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Xc2
    }
}
