use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use itertools::Itertools;
use log::{info, warn};

use super::Master;
use crate::protocol::{
    Command, Frame, PacketType, ProtocolError, Result, SysCommand, ADDR_DEFAULT, ADDR_MASTER,
};

pub const ADDR_FIRST_ASSIGNABLE: u16 = ADDR_MASTER + 1;
pub const ADDR_LAST_ASSIGNABLE: u16 = ADDR_DEFAULT - 1;

const MODEL_LEN: usize = 5;

/// Who answered on the bus and where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    pub serial: String,
    pub model: String,
    pub address: u16,
}

pub(super) fn parse_serial_answer(data: &[u8]) -> Result<(String, String)> {
    if data.len() <= MODEL_LEN {
        return Err(ProtocolError::Malformed("serial answer too short"));
    }
    let model = String::from_utf8_lossy(&data[..MODEL_LEN])
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string();
    let serial = data[MODEL_LEN..]
        .iter()
        .map(|b| format!("{:02x}", b))
        .join("");
    Ok((model, serial))
}

/// Serial number to bus address assignments of the session.
#[derive(Debug, Clone)]
pub struct AddressBook {
    by_serial: BTreeMap<String, u16>,
    first: u16,
    last: u16,
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressBook {
    pub fn new() -> Self {
        Self::with_range(ADDR_FIRST_ASSIGNABLE, ADDR_LAST_ASSIGNABLE)
    }

    /// Book that hands out addresses from `first..=last` only.
    pub fn with_range(first: u16, last: u16) -> Self {
        Self {
            by_serial: BTreeMap::new(),
            first: first.max(ADDR_FIRST_ASSIGNABLE),
            last: last.min(ADDR_LAST_ASSIGNABLE),
        }
    }

    /// Seeds the book with assignments persisted elsewhere.
    pub fn from_assignments(assignments: impl IntoIterator<Item = (String, u16)>) -> Self {
        let mut book = Self::new();
        for (serial, address) in assignments {
            if book.is_assignable(address) && book.owner(address).is_none() {
                book.by_serial.insert(serial, address);
            }
        }
        book
    }

    pub fn get(&self, serial: &str) -> Option<u16> {
        self.by_serial.get(serial).copied()
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&str, u16)> {
        self.by_serial.iter().map(|(s, a)| (s.as_str(), *a))
    }

    pub fn len(&self) -> usize {
        self.by_serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_serial.is_empty()
    }

    pub fn is_assignable(&self, address: u16) -> bool {
        (ADDR_FIRST_ASSIGNABLE..=ADDR_LAST_ASSIGNABLE).contains(&address)
    }

    fn owner(&self, address: u16) -> Option<&str> {
        self.by_serial
            .iter()
            .find(|(_, a)| **a == address)
            .map(|(s, _)| s.as_str())
    }

    fn next_free(&self, occupied: &HashSet<u16>) -> Option<u16> {
        (self.first..=self.last).find(|a| self.owner(*a).is_none() && !occupied.contains(a))
    }

    /// Address `serial` should use given that it currently answers at
    /// `reported`. `occupied` holds addresses other modules answer from.
    pub fn resolve(&self, serial: &str, reported: u16, occupied: &HashSet<u16>) -> Option<u16> {
        if let Some(address) = self.get(serial) {
            return Some(address);
        }
        if self.is_assignable(reported) && self.owner(reported).is_none() {
            return Some(reported);
        }
        self.next_free(occupied)
    }

    /// Address for `serial` when its booked one stays taken by a module that
    /// will not move: where it answers now if nobody else owns that, else the
    /// lowest free one.
    pub fn fallback(&self, serial: &str, reported: u16, occupied: &HashSet<u16>) -> Option<u16> {
        let owned_by_other = self.owner(reported).map_or(false, |s| s != serial);
        if self.is_assignable(reported) && !owned_by_other {
            return Some(reported);
        }
        self.next_free(occupied)
    }

    pub fn claim(&mut self, serial: &str, address: u16) {
        self.by_serial.insert(serial.to_string(), address);
    }
}

impl Master {
    /// Finds every module on the bus and gives each a unique address.
    ///
    /// Modules known to `book` move to their booked address once nobody else
    /// answers from it, new ones keep the address they answered from when it
    /// is free, the rest get the lowest free one.
    /// Modules answering from the same address as another responder are
    /// skipped, a unicast cannot reach just one of them.
    pub async fn broadcast_echo(
        &self,
        timeout: Duration,
        quiet_period: Duration,
        book: &mut AddressBook,
    ) -> Result<Vec<ModuleIdentity>> {
        let answers = self
            .broadcast(
                Command::Sys,
                &[SysCommand::GetSerial as u8],
                timeout,
                quiet_period,
            )
            .await?;

        let mut responders: Vec<ModuleIdentity> = Vec::new();
        for answer in answers.into_iter().filter_map(|frame| parse_responder(&frame)) {
            if responders.iter().any(|r| r.serial == answer.serial) {
                continue;
            }
            responders.push(answer);
        }

        let mut per_address: HashMap<u16, usize> = HashMap::new();
        for r in &responders {
            *per_address.entry(r.address).or_default() += 1;
        }

        let mut occupied: HashSet<u16> = per_address.keys().copied().collect();
        let mut pending = Vec::with_capacity(responders.len());
        for module in responders {
            if per_address[&module.address] > 1 {
                warn!(
                    "{} shares address {:#05x} with another module, skipped",
                    module.serial, module.address
                );
                continue;
            }
            pending.push(module);
        }

        // A booked module only moves once its target is vacated, so two
        // responders never answer from the same address.
        let mut found = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let movable: HashSet<u16> = pending.iter().map(|m| m.address).collect();
            let before = pending.len();
            let mut waiting = Vec::new();

            for mut module in pending {
                let target = match book.resolve(&module.serial, module.address, &occupied) {
                    Some(address) => address,
                    None => {
                        warn!("no free address left for {}", module.serial);
                        continue;
                    }
                };

                let target = if target != module.address && occupied.contains(&target) {
                    if movable.contains(&target) {
                        waiting.push(module);
                        continue;
                    }
                    match book.fallback(&module.serial, module.address, &occupied) {
                        Some(address) => {
                            warn!(
                                "{} cannot take booked address {:#05x}, using {:#05x}",
                                module.serial, target, address
                            );
                            address
                        }
                        None => {
                            warn!("no free address left for {}", module.serial);
                            continue;
                        }
                    }
                } else {
                    target
                };

                if target != module.address
                    && !self.relocate(&mut module, target, &mut occupied).await
                {
                    continue;
                }
                book.claim(&module.serial, module.address);
                found.push(module);
            }

            if !waiting.is_empty() && waiting.len() == before {
                // booked addresses form a cycle, park one holder elsewhere
                let target = book.get(&waiting[0].serial);
                let holder = waiting.iter().position(|m| Some(m.address) == target);
                let parked = match (holder, book.next_free(&occupied)) {
                    (Some(pos), Some(free)) => {
                        self.relocate(&mut waiting[pos], free, &mut occupied).await
                    }
                    _ => false,
                };
                if !parked {
                    let module = waiting.remove(holder.unwrap_or(0));
                    warn!("{} left at {:#05x}", module.serial, module.address);
                }
            }
            pending = waiting;
        }

        info!("discovered {} module(s)", found.len());
        Ok(found)
    }

    async fn relocate(
        &self,
        module: &mut ModuleIdentity,
        target: u16,
        occupied: &mut HashSet<u16>,
    ) -> bool {
        if let Err(err) = self.set_address(module.address, target).await {
            warn!(
                "cannot move {} from {:#05x} to {:#05x}: {}",
                module.serial, module.address, target, err
            );
            return false;
        }
        info!(
            "{} moved from {:#05x} to {:#05x}",
            module.serial, module.address, target
        );
        occupied.remove(&module.address);
        occupied.insert(target);
        module.address = target;
        true
    }
}

fn parse_responder(frame: &Frame) -> Option<ModuleIdentity> {
    if frame.kind == PacketType::Nak {
        warn!("module {:#05x} refused serial request", frame.src);
        return None;
    }
    match parse_serial_answer(&frame.data) {
        Ok((model, serial)) => Some(ModuleIdentity {
            serial,
            model,
            address: frame.src,
        }),
        Err(err) => {
            warn!("bad serial answer from {:#05x}: {}", frame.src, err);
            None
        }
    }
}
