use std::{fmt, sync::Arc};

use log::debug;

use super::{DeviceError, Liveness, Module, MAX_REG_PAYLOAD};
use crate::protocol::master::{Master, ModuleIdentity};
use crate::protocol::{Command, ProtocolError, RegistryAction, RegistryInfo, Result, MAX_DATA_LEN};
use crate::regs::{self, RegError, Register, RegisterMap, Value};

/// Reads `count` items of `reg` starting at item `first`.
///
/// Uses the plain read when the whole register fits one answer, array slices
/// otherwise.
pub(super) async fn read_items(
    master: &Master,
    address: u16,
    reg: &Register,
    first: usize,
    count: usize,
) -> std::result::Result<Vec<u8>, DeviceError> {
    let size = reg.item_size();

    if first == 0 && count == reg.array_len as usize && reg.byte_len() <= MAX_REG_PAYLOAD {
        let mut req = reg.index.to_be_bytes().to_vec();
        req.push(1);
        let data = master.command(address, Command::RegistryRead, &req).await?;
        return check_len(reg, data, reg.byte_len());
    }

    let per_chunk = (MAX_REG_PAYLOAD / size).max(1);
    let mut out = Vec::with_capacity(count * size);
    let mut item = first;
    while item < first + count {
        let n = per_chunk.min(first + count - item);
        let mut req = reg.index.to_be_bytes().to_vec();
        req.extend_from_slice(&(item as u16).to_be_bytes());
        req.push(n as u8);
        let data = master.command(address, Command::RegistryRead, &req).await?;
        out.extend(check_len(reg, data, n * size)?);
        item += n;
    }
    Ok(out)
}

fn check_len(
    reg: &Register,
    data: Vec<u8>,
    expected: usize,
) -> std::result::Result<Vec<u8>, DeviceError> {
    if data.len() != expected {
        return Err(RegError::BadLength {
            name: reg.name.clone(),
            expected,
            got: data.len(),
        }
        .into());
    }
    Ok(data)
}

/// Writes `bytes` into `reg` starting at item `first`, split into frames.
pub(super) async fn write_items(
    master: &Master,
    address: u16,
    reg: &Register,
    first: usize,
    bytes: &[u8],
) -> Result<()> {
    let size = reg.item_size();
    let per_chunk = ((MAX_DATA_LEN - 4).min(MAX_REG_PAYLOAD) / size).max(1) * size;

    for (i, chunk) in bytes.chunks(per_chunk).enumerate() {
        let item = first + i * per_chunk / size;
        let mut req = Vec::with_capacity(chunk.len() + 4);
        req.extend_from_slice(&reg.index.to_be_bytes());
        req.extend_from_slice(&(item as u16).to_be_bytes());
        req.extend_from_slice(chunk);
        master.command(address, Command::RegistryWrite, &req).await?;
    }
    Ok(())
}

/// Reads the register layout of the module at `address`.
pub async fn read_structure(
    master: &Master,
    address: u16,
) -> std::result::Result<RegisterMap, DeviceError> {
    let size = master
        .command(address, Command::RegistryGetInfo, &[RegistryInfo::Size as u8])
        .await?;
    if size.len() < 4 {
        return Err(RegError::BadStructure("size answer too short").into());
    }
    let count = u16::from_be_bytes([size[0], size[1]]) as usize;
    debug!(
        "{:#05x}: {} registers, {} bytes",
        address,
        count,
        u16::from_be_bytes([size[2], size[3]])
    );

    let mut regs: Vec<Register> = Vec::with_capacity(count);
    let mut next: u16 = 0;
    while regs.len() < count {
        let wanted = (count - regs.len()).min(u8::MAX as usize) as u8;
        let mut req = vec![RegistryInfo::Structure as u8];
        req.extend_from_slice(&next.to_be_bytes());
        req.push(wanted);

        let data = master
            .command(address, Command::RegistryGetInfo, &req)
            .await?;
        let chunk = regs::parse_structure(&data)?;
        // a short answer is fine, continue after its last entry
        next = match chunk.last() {
            Some(reg) => reg
                .index
                .checked_add(1)
                .ok_or(RegError::BadStructure("register index overflow"))?,
            None => return Err(RegError::BadStructure("empty structure answer").into()),
        };
        regs.extend(chunk);
    }

    Ok(RegisterMap::new(regs))
}

/// Product information strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub custom: Vec<String>,
}

/// Any module, accessed through the register layout it reports.
#[derive(Clone)]
pub struct GenericDevice {
    master: Arc<Master>,
    identity: ModuleIdentity,
    registers: Arc<RegisterMap>,
    liveness: Arc<Liveness>,
}

impl fmt::Debug for GenericDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericDevice")
            .field("identity", &self.identity)
            .field("registers", &self.registers.len())
            .field("liveness", &self.liveness)
            .finish()
    }
}

impl GenericDevice {
    pub fn new(master: Arc<Master>, identity: ModuleIdentity, registers: RegisterMap) -> Self {
        Self {
            master,
            identity,
            registers: Arc::new(registers),
            liveness: Arc::new(Liveness::default()),
        }
    }

    /// Reads the register structure and builds the device.
    pub async fn initialize(
        master: Arc<Master>,
        identity: ModuleIdentity,
    ) -> std::result::Result<Self, DeviceError> {
        let registers = read_structure(&master, identity.address).await?;
        debug!(
            "{} ({}): {} registers",
            identity.serial,
            identity.model,
            registers.len()
        );
        Ok(Self::new(master, identity, registers))
    }

    pub fn shared_master(&self) -> Arc<Master> {
        self.master.clone()
    }

    /// Same device with a modified register table.
    pub fn with_registers(&self, registers: RegisterMap) -> Self {
        Self {
            registers: Arc::new(registers),
            ..self.clone()
        }
    }

    pub async fn read_all_registers(&self) -> std::result::Result<Vec<(String, Value)>, DeviceError> {
        let mut values = Vec::with_capacity(self.registers.len());
        for reg in self.registers.iter() {
            let value = self.read_register(&reg.name).await?;
            values.push((reg.name.clone(), value));
        }
        Ok(values)
    }

    /// Saves the current register values to non-volatile memory.
    pub async fn store_registers(&self) -> Result<()> {
        self.registry_action(RegistryAction::StoreToEeprom).await
    }

    /// Reloads register values from non-volatile memory.
    pub async fn restore_registers(&self) -> Result<()> {
        self.registry_action(RegistryAction::Restore).await
    }

    async fn registry_action(&self, action: RegistryAction) -> Result<()> {
        self.master
            .command(
                self.identity.address,
                Command::RegistryAction,
                &[action as u8],
            )
            .await
            .map(|_| ())
    }

    pub async fn read_feature(&self) -> Result<Features> {
        let data = self
            .master
            .command(self.identity.address, Command::GetFeature, &[])
            .await?;
        let mut strings = data
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).to_string());

        let product = strings
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::Malformed("empty feature answer"))?;
        Ok(Features {
            product,
            vendor: strings.next().unwrap_or_default(),
            version: strings.next().unwrap_or_default(),
            custom: strings.filter(|s| !s.is_empty()).collect(),
        })
    }
}

impl Module for GenericDevice {
    fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    fn master(&self) -> &Master {
        &self.master
    }

    fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}
