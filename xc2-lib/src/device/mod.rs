mod generic;
mod id;
mod monitor;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub use generic::{Features, GenericDevice};
pub use id::DeviceId;
pub use monitor::{list_models, MonitorModel, VoltageMonitor, CHANNEL_REGISTER};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::protocol::master::{Master, ModuleIdentity};
use crate::protocol::{AnswerCode, ProtocolError};
use crate::regs::{RegError, Register, RegisterMap, Value};

/// Largest register payload moved in one transaction.
pub const MAX_REG_PAYLOAD: usize = 236;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("register '{0}' is read only")]
    ReadOnlyRegister(String),
    #[error(transparent)]
    Register(#[from] RegError),
    #[error("transaction failed: {0}")]
    TransactionFailed(ProtocolError),
    #[error("invalid device id '{0}'")]
    BadDeviceId(String),
}

impl From<ProtocolError> for DeviceError {
    fn from(err: ProtocolError) -> Self {
        DeviceError::TransactionFailed(err)
    }
}

/// When a module last answered and how many transactions failed since.
///
/// Any answer counts as contact, a refusal included. Shared by all clones of
/// a device.
#[derive(Debug, Default)]
pub struct Liveness {
    failures: AtomicU32,
    last_contact: Mutex<Option<Instant>>,
}

impl Liveness {
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_contact(&self) -> Option<Instant> {
        self.last_contact.lock().map(|t| *t).unwrap_or(None)
    }

    pub fn record_contact(&self) {
        self.failures.store(0, Ordering::SeqCst);
        if let Ok(mut t) = self.last_contact.lock() {
            *t = Some(Instant::now());
        }
    }

    /// Returns the number of failures in a row, this one included.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Books the outcome of a transaction and passes it on.
    pub fn track<T>(&self, res: Result<T, DeviceError>) -> Result<T, DeviceError> {
        match &res {
            Err(DeviceError::TransactionFailed(err)) if !matches!(err, ProtocolError::Nak(_)) => {
                let n = self.record_failure();
                debug!("transaction failed, {} in a row", n);
            }
            _ => self.record_contact(),
        }
        res
    }
}

/// Capabilities shared by every module on the bus.
#[async_trait]
pub trait Module: Send + Sync {
    fn identity(&self) -> &ModuleIdentity;
    fn registers(&self) -> &RegisterMap;
    fn master(&self) -> &Master;
    fn liveness(&self) -> &Liveness;

    fn register(&self, name: &str) -> Result<&Register, DeviceError> {
        self.registers()
            .find(name)
            .ok_or_else(|| DeviceError::UnknownRegister(name.to_string()))
    }

    async fn read_register(&self, name: &str) -> Result<Value, DeviceError> {
        let reg = self.register(name)?;
        let raw = self.liveness().track(
            generic::read_items(
                self.master(),
                self.identity().address,
                reg,
                0,
                reg.array_len as usize,
            )
            .await,
        )?;
        Ok(reg.decode(&raw)?)
    }

    async fn write_register(&self, name: &str, value: Value) -> Result<(), DeviceError> {
        let reg = self.register(name)?;
        if reg.read_only {
            return Err(DeviceError::ReadOnlyRegister(name.to_string()));
        }
        let bytes = reg.encode(&value)?;
        let res = generic::write_items(self.master(), self.identity().address, reg, 0, &bytes)
            .await
            .map_err(|err| match err {
                ProtocolError::Nak(AnswerCode::ReadOnly) => {
                    DeviceError::ReadOnlyRegister(name.to_string())
                }
                err => DeviceError::TransactionFailed(err),
            });
        self.liveness().track(res)
    }

    async fn echo(&self) -> Result<u8, DeviceError> {
        let res = self.master().echo(self.identity().address).await;
        self.liveness().track(res.map_err(DeviceError::from))
    }
}

/// A discovered module, specialised by model when it is known.
#[derive(Debug, Clone)]
pub enum Device {
    Generic(GenericDevice),
    VoltageMonitor(VoltageMonitor),
}

impl Device {
    pub fn new(device: GenericDevice) -> Self {
        match MonitorModel::from_model(&device.identity().model) {
            Some(model) => Device::VoltageMonitor(VoltageMonitor::new(device, model)),
            None => Device::Generic(device),
        }
    }

    pub fn generic(&self) -> &GenericDevice {
        match self {
            Device::Generic(dev) => dev,
            Device::VoltageMonitor(dev) => dev.generic(),
        }
    }

    pub fn as_voltage_monitor(&self) -> Option<&VoltageMonitor> {
        match self {
            Device::VoltageMonitor(dev) => Some(dev),
            Device::Generic(_) => None,
        }
    }
}

impl Module for Device {
    fn identity(&self) -> &ModuleIdentity {
        match self {
            Device::Generic(dev) => dev.identity(),
            Device::VoltageMonitor(dev) => dev.identity(),
        }
    }

    fn registers(&self) -> &RegisterMap {
        match self {
            Device::Generic(dev) => dev.registers(),
            Device::VoltageMonitor(dev) => dev.registers(),
        }
    }

    fn master(&self) -> &Master {
        match self {
            Device::Generic(dev) => dev.master(),
            Device::VoltageMonitor(dev) => dev.master(),
        }
    }

    fn liveness(&self) -> &Liveness {
        match self {
            Device::Generic(dev) => dev.liveness(),
            Device::VoltageMonitor(dev) => dev.liveness(),
        }
    }
}
