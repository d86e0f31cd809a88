use std::fmt::Display;

use super::{generic, DeviceError, GenericDevice, Liveness, Module};
use crate::protocol::master::{Master, ModuleIdentity};
use crate::regs::{RegError, RegisterMap, Scaling};

/// Register holding the cell voltages of a monitor.
pub const CHANNEL_REGISTER: &str = "ch_V";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorModel {
    Cvm24p,
    Cvm32a,
    Cvm64h,
}

impl MonitorModel {
    const ALL: [MonitorModel; 3] = [MonitorModel::Cvm24p, MonitorModel::Cvm32a, MonitorModel::Cvm64h];

    /// Picks the variant from the model string a module reports.
    pub fn from_model(model: &str) -> Option<Self> {
        let model = model.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| model.starts_with(&m.name()[..5]))
    }

    pub fn name(self) -> &'static str {
        match self {
            MonitorModel::Cvm24p => "cvm24p",
            MonitorModel::Cvm32a => "cvm32a",
            MonitorModel::Cvm64h => "cvm64h",
        }
    }

    /// Nominal channel count.
    pub fn channels(self) -> usize {
        match self {
            MonitorModel::Cvm24p => 24,
            MonitorModel::Cvm32a => 32,
            MonitorModel::Cvm64h => 64,
        }
    }
}

impl Display for MonitorModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

pub fn list_models() -> Vec<&'static str> {
    MonitorModel::ALL.iter().map(|m| m.name()).collect()
}

/// Cell voltage monitor.
#[derive(Debug, Clone)]
pub struct VoltageMonitor {
    inner: GenericDevice,
    model: MonitorModel,
}

impl VoltageMonitor {
    /// Wraps `inner`; integer channel registers are read as millivolts.
    pub fn new(inner: GenericDevice, model: MonitorModel) -> Self {
        let scaled = inner.registers().find(CHANNEL_REGISTER).map(|reg| {
            let factor = if reg.is_float() { 1.0 } else { 0.001 };
            Scaling::new(factor, 0.0, "V")
        });

        let inner = match scaled {
            Some(scaling) => {
                let mut registers: RegisterMap = inner.registers().clone();
                registers.set_scaling(CHANNEL_REGISTER, scaling);
                inner.with_registers(registers)
            }
            None => inner,
        };
        Self { inner, model }
    }

    pub fn model(&self) -> MonitorModel {
        self.model
    }

    pub fn generic(&self) -> &GenericDevice {
        &self.inner
    }

    /// Channels present, never more than the model's nominal count.
    pub fn channel_count(&self) -> usize {
        self.registers()
            .find(CHANNEL_REGISTER)
            .map(|reg| (reg.array_len as usize).min(self.model.channels()))
            .unwrap_or(0)
    }

    /// Reads every channel voltage in volts.
    ///
    /// Zero readings are data; only a failed transaction is an error.
    pub async fn read_all_channel_voltages(&self) -> Result<Vec<f64>, DeviceError> {
        let reg = self.register(CHANNEL_REGISTER)?;
        let count = self.channel_count();
        let raw = self.liveness().track(
            generic::read_items(self.master(), self.identity().address, reg, 0, count).await,
        )?;

        reg.decode_items(&raw)?
            .iter()
            .map(|v| {
                reg.to_engineering(v).ok_or_else(|| {
                    DeviceError::Register(RegError::BadType {
                        name: reg.name.clone(),
                        flags: reg.flags(),
                    })
                })
            })
            .collect()
    }
}

impl Module for VoltageMonitor {
    fn identity(&self) -> &ModuleIdentity {
        self.inner.identity()
    }

    fn registers(&self) -> &RegisterMap {
        self.inner.registers()
    }

    fn master(&self) -> &Master {
        self.inner.master()
    }

    fn liveness(&self) -> &Liveness {
        self.inner.liveness()
    }
}
