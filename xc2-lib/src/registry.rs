use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use log::{info, warn};

use crate::config::DiscoveryConfig;
use crate::device::{Device, GenericDevice, Module};
use crate::protocol::master::{AddressBook, Master, ModuleIdentity};
use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Available,
    Unreachable,
}

/// Everything known about one module, reachable or not.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub identity: ModuleIdentity,
    pub status: ModuleStatus,
    /// Kept while unreachable, for diagnostics.
    pub device: Option<Device>,
    pub last_error: Option<String>,
}

/// Modules of one bus, keyed by serial number.
pub struct Registry {
    master: Arc<Master>,
    book: AddressBook,
    records: BTreeMap<String, ModuleRecord>,
    discovery: DiscoveryConfig,
}

impl Registry {
    pub fn new(master: Arc<Master>) -> Self {
        Self {
            master,
            book: AddressBook::new(),
            records: BTreeMap::new(),
            discovery: DiscoveryConfig::default(),
        }
    }

    /// Starts from previously persisted address assignments.
    pub fn with_address_book(mut self, book: AddressBook) -> Self {
        self.book = book;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.book
    }

    pub fn records(&self) -> &BTreeMap<String, ModuleRecord> {
        &self.records
    }

    /// The device with `serial`, if it answered the last discovery.
    pub fn device(&self, serial: &str) -> Option<&Device> {
        self.records
            .get(serial)
            .filter(|r| r.status == ModuleStatus::Available)
            .and_then(|r| r.device.as_ref())
    }

    pub fn mark_unreachable(&mut self, serial: &str, error: &dyn Display) -> bool {
        match self.records.get_mut(serial) {
            Some(record) => {
                record.status = ModuleStatus::Unreachable;
                record.last_error = Some(error.to_string());
                true
            }
            None => false,
        }
    }

    /// Marks every available module whose last `max_failures` transactions
    /// all failed as unreachable and returns their serial numbers.
    pub fn mark_stale(&mut self, max_failures: u32) -> Vec<String> {
        let mut stale = Vec::new();
        for (serial, record) in self.records.iter_mut() {
            if record.status != ModuleStatus::Available {
                continue;
            }
            let failures = match &record.device {
                Some(device) => device.liveness().consecutive_failures(),
                None => continue,
            };
            if failures >= max_failures.max(1) {
                warn!("{}: {} failed transactions in a row", serial, failures);
                record.status = ModuleStatus::Unreachable;
                record.last_error = Some(format!("{} failed transactions in a row", failures));
                stale.push(serial.clone());
            }
        }
        stale
    }

    /// Every module that answered the last discovery.
    pub fn available(&self) -> BTreeMap<String, Device> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == ModuleStatus::Available)
            .filter_map(|(serial, r)| r.device.clone().map(|d| (serial.clone(), d)))
            .collect()
    }

    /// Finds the modules on the bus and reconciles them with earlier runs.
    ///
    /// Only a bus failure aborts; a module that fails its structure read is
    /// recorded as unreachable and the others carry on.
    pub async fn discover(&mut self) -> Result<BTreeMap<String, Device>, ProtocolError> {
        let found = self
            .master
            .broadcast_echo(
                self.discovery.timeout,
                self.discovery.quiet_period,
                &mut self.book,
            )
            .await?;

        let mut seen = HashSet::new();
        for identity in found {
            seen.insert(identity.serial.clone());

            let previous = self.records.get(&identity.serial);
            let known = previous
                .and_then(|r| r.device.as_ref())
                .filter(|d| d.identity() == &identity)
                .cloned();

            let res = match known {
                Some(device) => Ok(device),
                None => GenericDevice::initialize(self.master.clone(), identity.clone())
                    .await
                    .map(Device::new),
            };

            let record = match res {
                Ok(device) => {
                    device.liveness().record_contact();
                    ModuleRecord {
                        identity,
                        status: ModuleStatus::Available,
                        device: Some(device),
                        last_error: None,
                    }
                }
                Err(err) => {
                    warn!("{}: structure read failed: {}", identity.serial, err);
                    ModuleRecord {
                        identity,
                        status: ModuleStatus::Unreachable,
                        device: previous.and_then(|r| r.device.clone()),
                        last_error: Some(err.to_string()),
                    }
                }
            };
            self.records.insert(record.identity.serial.clone(), record);
        }

        for (serial, record) in self.records.iter_mut() {
            if seen.contains(serial) {
                continue;
            }
            if record.status == ModuleStatus::Available {
                info!("{} no longer answers", serial);
            }
            record.status = ModuleStatus::Unreachable;
            record.last_error = Some("no answer to discovery".to_string());
        }

        Ok(self.available())
    }
}
