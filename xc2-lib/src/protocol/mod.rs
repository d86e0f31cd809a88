pub mod master;
pub mod modbus;
pub mod packet;
pub mod slave;

use std::{fmt::Display, str::FromStr};

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

pub const ADDR_BROADCAST: u16 = 0x000;
pub const ADDR_MASTER: u16 = 0x001;
pub const ADDR_DEFAULT: u16 = 0xFFF;
pub const ADDR_MAX: u16 = 0xFFF;

/// Largest payload a single frame can carry.
pub const MAX_DATA_LEN: usize = 246;
/// Frame bytes that are not payload: 6 header bytes and the checksum.
pub const FRAME_OVERHEAD: usize = 8;

pub const MAX_BAUDRATE: u32 = 3_000_000;

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Event = 0x40,
    CriticalError = 0x60,
    Command = 0x80,
    Ack = 0xC0,
    Nak = 0xE0,
}

pub mod flags {
    pub const MULTICAST: u8 = 0x80;
    pub const SUPPRESS_ANSWER: u8 = 0x40;
    pub const REPETITION: u8 = 0x20;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Command {
    Poll = 0x00,
    Echo = 0x01,
    GetStatus = 0x02,
    Sys = 0x03,
    GetFeature = 0x05,
    Find = 0x06,
    BootloaderCmd = 0x08,
    StayInBootloader = 0x09,
    RegistryReadRaw = 0x10,
    RegistryRead = 0x11,
    RegistryReadByName = 0x12,
    RegistryGetInfo = 0x13,
    RegistryWriteRaw = 0x14,
    RegistryWrite = 0x15,
    RegistryWriteByName = 0x16,
    RegistryAction = 0x17,
    AppStatus = 0xA0,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SysCommand {
    EchoBootloader = 0x01,
    EchoApplication = 0x02,
    Reset = 0x04,
    Bootloader = 0x06,
    RunApplication = 0x07,
    SetAddress = 0x10,
    GetSerial = 0x13,
    SetBaudrate = 0x14,
    RestoreRegs = 0x20,
    StoreRegs = 0x21,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RegistryInfo {
    Size = 0x00,
    Structure = 0x01,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RegistryAction {
    Backup = 0x01,
    Restore = 0x02,
    Log = 0x03,
    SetDefaults = 0x04,
    StoreToEeprom = 0x05,
}

/// Answer codes carried in the first payload byte of a NAK.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum AnswerCode {
    Ack = 0x01,
    Nak = 0x02,
    UnknownCmd = 0x03,
    BadParam = 0x04,
    BadLength = 0x05,
    BadSecurityCrc = 0x06,
    ReadOnly = 0x07,
    WriteOnly = 0x08,
    Busy = 0x09,
    OtherCmdInProgress = 0x0A,
    NotApplicable = 0x0B,
}

impl Display for AnswerCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnswerCode::Ack => "ack",
            AnswerCode::Nak => "nak",
            AnswerCode::UnknownCmd => "unknown command",
            AnswerCode::BadParam => "bad parameter",
            AnswerCode::BadLength => "bad length",
            AnswerCode::BadSecurityCrc => "bad security crc",
            AnswerCode::ReadOnly => "read only",
            AnswerCode::WriteOnly => "write only",
            AnswerCode::Busy => "busy",
            AnswerCode::OtherCmdInProgress => "other command in progress",
            AnswerCode::NotApplicable => "not applicable",
        };
        s.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Outer,
    Inner,
}

impl Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Outer => "outer".fmt(f),
            Layer::Inner => "inner".fmt(f),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated packet")]
    Truncated,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("{0} checksum mismatch")]
    ChecksumMismatch(Layer),
    #[error("payload of {0} bytes does not fit into a frame")]
    PayloadTooLong(usize),
    #[error("invalid bus address {0:#05x}")]
    InvalidAddress(u16),
    #[error("broadcast address cannot be used for a transaction")]
    BroadcastNotAllowed,
    #[error("timed out")]
    Timeout,
    #[error("no response after {attempts} attempts")]
    NoResponse { attempts: usize },
    #[error("unexpected answer from {src:#05x} to command {cmd:#04x}")]
    AddressMismatch { src: u16, cmd: u8 },
    #[error("device answered nak: {0}")]
    Nak(AnswerCode),
    #[error("device answered nak with unknown code {0:#04x}")]
    NakUnknown(u8),
    #[error("bus busy")]
    BusBusy,
    #[error("transport closed")]
    TransportClosed,
    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Failures that a re-sent request may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated
                | ProtocolError::Malformed(_)
                | ProtocolError::ChecksumMismatch(_)
                | ProtocolError::Timeout
                | ProtocolError::AddressMismatch { .. }
                | ProtocolError::Io(_)
        )
    }

    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated
                | ProtocolError::Malformed(_)
                | ProtocolError::ChecksumMismatch(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: PacketType,
    pub dst: u16,
    pub src: u16,
    pub flags: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn command(dst: u16, src: u16, cmd: impl Into<u8>, data: &[u8]) -> Self {
        Frame {
            kind: PacketType::Command,
            dst,
            src,
            flags: 0,
            cmd: cmd.into(),
            data: data.to_vec(),
        }
    }

    /// Positive answer to `request`, sent from `src`.
    pub fn ack(request: &Frame, src: u16, data: &[u8]) -> Self {
        Frame {
            kind: PacketType::Ack,
            dst: request.src,
            src,
            flags: 0,
            cmd: request.cmd,
            data: data.to_vec(),
        }
    }

    pub fn nak(request: &Frame, src: u16, code: AnswerCode) -> Self {
        Frame {
            kind: PacketType::Nak,
            dst: request.src,
            src,
            flags: 0,
            cmd: request.cmd,
            data: vec![code as u8],
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == ADDR_BROADCAST
    }

    /// Turns a NAK into the matching error, other frames pass through.
    pub fn into_result(self) -> Result<Frame> {
        use num_traits::FromPrimitive;

        if self.kind != PacketType::Nak {
            return Ok(self);
        }
        let code = self.data.first().copied().unwrap_or(AnswerCode::Nak as u8);
        match AnswerCode::from_u8(code) {
            Some(code) => Err(ProtocolError::Nak(code)),
            None => Err(ProtocolError::NakUnknown(code)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Native framing.
    Xc2,
    /// Native frames inside a Modbus RTU envelope (function 0x42).
    Modbus,
}

impl Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Xc2 => "xc2".fmt(f),
            ProtocolKind::Modbus => "modbus".fmt(f),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolKindError {
    #[error("invalid protocol '{0}'")]
    BadProtocol(String),
}

impl FromStr for ProtocolKind {
    type Err = ProtocolKindError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "xc2" => Ok(ProtocolKind::Xc2),
            "modbus" => Ok(ProtocolKind::Modbus),
            _ => Err(ProtocolKindError::BadProtocol(input.to_string())),
        }
    }
}

pub trait Codec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;
    /// Decodes the frame at the start of `buf`, returning it together with the
    /// number of bytes it occupied.
    fn decode(&self, buf: &[u8]) -> Result<(Frame, usize)>;
    /// Length of the frame at the start of `buf` once enough bytes are there.
    fn frame_len(&self, buf: &[u8]) -> Option<usize>;

    fn kind(&self) -> ProtocolKind;
}

pub fn make_codec(kind: ProtocolKind) -> Box<dyn Codec> {
    match kind {
        ProtocolKind::Xc2 => Box::new(packet::Xc2Codec),
        ProtocolKind::Modbus => Box::new(modbus::ModbusCodec),
    }
}
