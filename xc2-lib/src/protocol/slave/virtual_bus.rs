use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use log::{debug, info};
use num_traits::FromPrimitive;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use super::SlaveProtocol;
use crate::protocol::{
    flags, AnswerCode, Command, Frame, PacketType, ProtocolError, ProtocolKind, RegistryInfo,
    Result, SysCommand, MAX_DATA_LEN,
};
use crate::regs::{self, RegKind, RegWidth, Register, RegisterMap};

const MODEL_LEN: usize = 5;
const ECHO_APPLICATION: u8 = 0x02;

/// An emulated module with its own register image.
#[derive(Debug, Clone)]
pub struct VirtualModule {
    pub address: u16,
    pub model: String,
    pub serial: Vec<u8>,
    pub features: Vec<String>,
    registers: RegisterMap,
    image: Vec<u8>,
    /// Delay before each answer, staggers broadcast answers.
    pub reply_delay: Duration,
    /// Never answers while set.
    pub mute: bool,
    /// Number of upcoming answers sent with a broken checksum.
    pub corrupt_replies: usize,
    /// Structure reads return at most this many entries per answer.
    pub structure_chunk: usize,
}

impl VirtualModule {
    pub fn new(model: &str, serial: &[u8], address: u16, registers: Vec<Register>) -> Self {
        let registers = RegisterMap::new(registers);
        let image = vec![0u8; registers.total_bytes()];
        Self {
            address,
            model: model.to_string(),
            serial: serial.to_vec(),
            features: vec![
                model.to_string(),
                "xc2".to_string(),
                "1.0.0".to_string(),
                String::new(),
                String::new(),
            ],
            registers,
            image,
            reply_delay: Duration::from_millis(2),
            mute: false,
            corrupt_replies: 0,
            structure_chunk: 4,
        }
    }

    fn monitor(model: &str, serial: &[u8], address: u16, channels: u16, float: bool) -> Self {
        let channels_reg = if float {
            Register::new(3, "ch_V", RegWidth::Word, RegKind::FloatEnum)
        } else {
            Register::new(3, "ch_V", RegWidth::Half, RegKind::Signed)
        };
        let regs = vec![
            Register::new(0, "fw_ver", RegWidth::Half, RegKind::Unsigned).ro().hex(),
            Register::new(1, "status", RegWidth::Byte, RegKind::Unsigned).ro().val(),
            Register::new(2, "avg_cnt", RegWidth::Half, RegKind::Unsigned),
            channels_reg.array(channels).ro().val(),
            Register::new(4, "name", RegWidth::Byte, RegKind::Char).array(8),
            Register::new(5, "t_cpu", RegWidth::Word, RegKind::FloatEnum).ro().val(),
        ];

        let mut module = Self::new(model, serial, address, regs);
        module.set_raw("fw_ver", &0x0102u16.to_be_bytes());
        module.set_raw("avg_cnt", &16u16.to_be_bytes());
        module.set_raw("name", b"cvm\0\0\0\0\0");
        module.set_raw("t_cpu", &31.5f32.to_be_bytes());
        let volts: Vec<f32> = (0..channels).map(|i| 3.2 + i as f32 * 0.001).collect();
        module.set_channels(&volts);
        module
    }

    /// 24 channel monitor, float voltages.
    pub fn cvm24p(address: u16, serial: &[u8]) -> Self {
        Self::monitor("CVM24", serial, address, 24, true)
    }

    /// 32 channel monitor, float voltages.
    pub fn cvm32a(address: u16, serial: &[u8]) -> Self {
        Self::monitor("CVM32", serial, address, 32, true)
    }

    /// 64 channel monitor, voltages in signed millivolts.
    pub fn cvm64h(address: u16, serial: &[u8]) -> Self {
        Self::monitor("CVM64", serial, address, 64, false)
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    pub fn raw(&self, name: &str) -> Option<&[u8]> {
        self.registers
            .find(name)
            .map(|r| &self.image[r.offset..r.offset + r.byte_len()])
    }

    /// Overwrites the start of register `name`; returns false if unknown.
    pub fn set_raw(&mut self, name: &str, bytes: &[u8]) -> bool {
        match self.registers.find(name) {
            Some(r) if bytes.len() <= r.byte_len() => {
                self.image[r.offset..r.offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Sets `ch_V` from volts, in the register's native encoding.
    pub fn set_channels(&mut self, volts: &[f32]) -> bool {
        let reg = match self.registers.find("ch_V") {
            Some(reg) => reg,
            None => return false,
        };
        let bytes: Vec<u8> = if reg.item_size() == 4 {
            volts.iter().flat_map(|v| v.to_be_bytes()).collect()
        } else {
            volts
                .iter()
                .flat_map(|v| ((v * 1000.0).round() as i16).to_be_bytes())
                .collect()
        };
        self.set_raw("ch_V", &bytes)
    }

    fn serial_answer(&self) -> Vec<u8> {
        let mut data: Vec<u8> = self.model.bytes().take(MODEL_LEN).collect();
        data.resize(MODEL_LEN, b' ');
        data.extend_from_slice(&self.serial);
        data
    }

    fn structure_answer(&self, data: &[u8]) -> std::result::Result<Vec<u8>, AnswerCode> {
        if data.len() != 4 {
            return Err(AnswerCode::BadLength);
        }
        let start = u16::from_be_bytes([data[1], data[2]]);
        let count = data[3] as usize;

        let mut out = Vec::new();
        for reg in self
            .registers
            .iter()
            .filter(|r| r.index >= start)
            .take(count.min(self.structure_chunk))
        {
            let entry = regs::encode_structure_entry(reg);
            if out.len() + entry.len() > MAX_DATA_LEN {
                break;
            }
            out.extend(entry);
        }
        Ok(out)
    }

    fn read_answer(&self, data: &[u8]) -> std::result::Result<Vec<u8>, AnswerCode> {
        match data.len() {
            // index, register count
            3 => {
                let index = u16::from_be_bytes([data[0], data[1]]);
                let count = data[2] as u16;
                let mut out = Vec::new();
                for i in index..index.saturating_add(count) {
                    let reg = self.registers.get(i).ok_or(AnswerCode::BadParam)?;
                    out.extend_from_slice(&self.image[reg.offset..reg.offset + reg.byte_len()]);
                }
                if out.len() > MAX_DATA_LEN {
                    return Err(AnswerCode::BadLength);
                }
                Ok(out)
            }
            // index, first item, item count
            5 => {
                let index = u16::from_be_bytes([data[0], data[1]]);
                let first = u16::from_be_bytes([data[2], data[3]]) as usize;
                let count = data[4] as usize;
                let reg = self.registers.get(index).ok_or(AnswerCode::BadParam)?;
                if first + count > reg.array_len as usize {
                    return Err(AnswerCode::BadParam);
                }
                let size = reg.item_size();
                let start = reg.offset + first * size;
                Ok(self.image[start..start + count * size].to_vec())
            }
            _ => Err(AnswerCode::BadLength),
        }
    }

    fn write_request(&mut self, data: &[u8]) -> std::result::Result<Vec<u8>, AnswerCode> {
        if data.len() < 5 {
            return Err(AnswerCode::BadLength);
        }
        let index = u16::from_be_bytes([data[0], data[1]]);
        let first = u16::from_be_bytes([data[2], data[3]]) as usize;
        let values = &data[4..];

        let reg = self.registers.get(index).ok_or(AnswerCode::BadParam)?;
        if reg.read_only {
            return Err(AnswerCode::ReadOnly);
        }
        let size = reg.item_size();
        if values.len() % size != 0 || first * size + values.len() > reg.byte_len() {
            return Err(AnswerCode::BadLength);
        }
        let start = reg.offset + first * size;
        self.image[start..start + values.len()].copy_from_slice(values);
        Ok(Vec::new())
    }

    fn sys_request(&mut self, data: &[u8]) -> std::result::Result<Vec<u8>, AnswerCode> {
        let sub = data.first().ok_or(AnswerCode::BadLength)?;
        match SysCommand::from_u8(*sub) {
            Some(SysCommand::GetSerial) => Ok(self.serial_answer()),
            Some(SysCommand::SetAddress) => {
                if data.len() != 3 {
                    return Err(AnswerCode::BadLength);
                }
                let new = u16::from_be_bytes([data[1], data[2]]);
                if new == 0 || new >= 0xFFF {
                    return Err(AnswerCode::BadParam);
                }
                // answered from the old address, the new one applies afterwards
                Ok(Vec::new())
            }
            Some(SysCommand::StoreRegs) | Some(SysCommand::RestoreRegs) => Ok(Vec::new()),
            Some(SysCommand::Reset) => Ok(Vec::new()),
            _ => Err(AnswerCode::UnknownCmd),
        }
    }

    /// Answer to `request`, if this module is expected to send one.
    pub fn handle(&mut self, request: &Frame) -> Option<Frame> {
        if self.mute {
            return None;
        }
        if !request.is_broadcast() && request.dst != self.address {
            return None;
        }

        let cmd = Command::from_u8(request.cmd);
        let serial_request = cmd == Some(Command::Sys)
            && request.data.first() == Some(&(SysCommand::GetSerial as u8));
        if request.is_broadcast() && cmd != Some(Command::Echo) && !serial_request {
            return None;
        }

        let res = match cmd {
            Some(Command::Echo) => Ok(vec![ECHO_APPLICATION]),
            Some(Command::Sys) => self.sys_request(&request.data),
            Some(Command::GetFeature) => Ok(self.features.join("\0").into_bytes()),
            Some(Command::RegistryGetInfo) => match request.data.first().copied() {
                Some(sub) if sub == RegistryInfo::Size as u8 => {
                    let mut out = (self.registers.len() as u16).to_be_bytes().to_vec();
                    out.extend_from_slice(&(self.registers.total_bytes() as u16).to_be_bytes());
                    Ok(out)
                }
                Some(sub) if sub == RegistryInfo::Structure as u8 => {
                    self.structure_answer(&request.data)
                }
                _ => Err(AnswerCode::BadParam),
            },
            Some(Command::RegistryRead) => self.read_answer(&request.data),
            Some(Command::RegistryWrite) => self.write_request(&request.data),
            Some(Command::RegistryAction) => Ok(Vec::new()),
            Some(Command::AppStatus) => Ok(self.raw("status").map(|s| s.to_vec()).unwrap_or_default()),
            _ => Err(AnswerCode::UnknownCmd),
        };

        let answer = match res {
            Ok(data) => Frame::ack(request, self.address, &data),
            Err(code) => Frame::nak(request, self.address, code),
        };

        if cmd == Some(Command::Sys)
            && request.data.first() == Some(&(SysCommand::SetAddress as u8))
            && answer.kind == PacketType::Ack
        {
            let new = u16::from_be_bytes([request.data[1], request.data[2]]);
            info!("{} readdressed {:#05x} -> {:#05x}", self.model, self.address, new);
            self.address = new;
        }

        if request.flags & flags::SUPPRESS_ANSWER != 0 {
            return None;
        }
        Some(answer)
    }
}

/// Counters for checking how the master used the bus.
#[derive(Debug, Default)]
pub struct BusStats {
    requests: AtomicUsize,
    overlaps: AtomicUsize,
}

impl BusStats {
    /// Command frames received.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests that arrived while an earlier one was still being answered.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

/// Several emulated modules sharing one stream.
pub struct VirtualBus {
    modules: Arc<Mutex<Vec<VirtualModule>>>,
    stats: Arc<BusStats>,
}

impl VirtualBus {
    pub fn new(modules: Vec<VirtualModule>) -> Self {
        Self {
            modules: Arc::new(Mutex::new(modules)),
            stats: Arc::new(BusStats::default()),
        }
    }

    /// Shared access to the modules, also while serving.
    pub fn modules(&self) -> Arc<Mutex<Vec<VirtualModule>>> {
        self.modules.clone()
    }

    pub fn stats(&self) -> Arc<BusStats> {
        self.stats.clone()
    }

    /// Answers requests until the other end hangs up.
    pub async fn serve<S>(self, port: S, kind: ProtocolKind) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut proto = SlaveProtocol::new(port, kind);

        loop {
            let request = match proto.recv_command().await {
                Ok(frame) => frame,
                Err(ProtocolError::TransportClosed) => return Ok(()),
                Err(err) => return Err(err),
            };
            self.stats.requests.fetch_add(1, Ordering::SeqCst);
            debug!("virtual bus got {:02X?}", request);

            let answers: Vec<(Duration, Frame, bool)> = {
                let mut modules = self.modules.lock().await;
                modules
                    .iter_mut()
                    .filter_map(|m| {
                        let answer = m.handle(&request)?;
                        let corrupt = m.corrupt_replies > 0;
                        if corrupt {
                            m.corrupt_replies -= 1;
                        }
                        Some((m.reply_delay, answer, corrupt))
                    })
                    .collect()
            };

            for (i, (delay, answer, corrupt)) in answers.into_iter().enumerate() {
                tokio::time::sleep(delay).await;
                if i == 0 {
                    match proto.poll_pending(Duration::ZERO).await {
                        Ok(0) => {}
                        Ok(_) => {
                            // next request arrived before this one was answered
                            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(ProtocolError::TransportClosed) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }

                let mut bytes = proto.codec().encode(&answer)?;
                if corrupt {
                    let last = bytes.len() - 1;
                    bytes[last] ^= 0xFF;
                }
                proto.send_raw(&bytes).await?;
            }
        }
    }
}
