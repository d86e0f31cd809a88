//! Native frames tunnelled through a Modbus RTU gateway.
//!
//! `[slave id][0x42][xc2 frame][crc16/modbus, little endian]`

use crc::{Crc, CRC_16_MODBUS};

use super::{packet, Codec, Frame, Layer, ProtocolError, ProtocolKind, Result, FRAME_OVERHEAD};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub const FUNCTION_XC2: u8 = 0x42;
const ENVELOPE_LEN: usize = 4;
const MIN_LEN: usize = FRAME_OVERHEAD + ENVELOPE_LEN;

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let inner = packet::encode(frame)?;

    let mut buf = Vec::with_capacity(inner.len() + ENVELOPE_LEN);
    buf.push((frame.dst & 0xFF) as u8);
    buf.push(FUNCTION_XC2);
    buf.extend_from_slice(&inner);

    let cs = MODBUS_CRC.checksum(&buf);
    buf.extend_from_slice(&cs.to_le_bytes());
    Ok(buf)
}

fn declared_len(buf: &[u8]) -> usize {
    // LEN of the inner frame sits right after the two envelope bytes
    (buf[6] as usize).max(6) + 2 + ENVELOPE_LEN
}

pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < MIN_LEN {
        return None;
    }
    let total = declared_len(buf);
    (buf.len() >= total).then(|| total)
}

pub fn decode(buf: &[u8]) -> Result<(Frame, usize)> {
    if buf.len() < MIN_LEN {
        return Err(ProtocolError::Truncated);
    }
    if buf[1] != FUNCTION_XC2 {
        return Err(ProtocolError::Malformed("unexpected modbus function"));
    }

    let total = declared_len(buf);
    if buf.len() < total {
        return Err(ProtocolError::Truncated);
    }

    let cs = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
    if MODBUS_CRC.checksum(&buf[..total - 2]) != cs {
        return Err(ProtocolError::ChecksumMismatch(Layer::Outer));
    }

    let (frame, used) = packet::decode(&buf[2..total - 2])?;
    if used != total - ENVELOPE_LEN {
        return Err(ProtocolError::Malformed("envelope length mismatch"));
    }

    Ok((frame, total))
}

pub struct ModbusCodec;

impl Codec for ModbusCodec {
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
        ProtocolKind::Modbus
    }
}
