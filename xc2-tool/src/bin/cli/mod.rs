use anyhow::Result;
use clap::{Parser, Subcommand};
use hex::FromHex;
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

use xc2_lib::config::{DEFAULT_BAUDRATE, NUMBER_OF_ATTEMPTS};
use xc2_lib::protocol::{ProtocolKind, ADDR_BROADCAST, ADDR_MAX};
use xc2_lib::regs::RegSpec;

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("invalid range '{0}'")]
    BadRange(String),
    #[error("invalid hex data '{0}'")]
    BadHex(String),
}

/// Bus addresses given as `0x010-0x013,0x020`.
#[derive(Debug)]
pub struct AddressRange(Vec<u16>);

impl Deref for AddressRange {
    type Target = Vec<u16>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for AddressRange {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^((?:0x)?[[:xdigit:]]+)(?:-((?:0x)?[[:xdigit:]]+))?$").unwrap();
        }

        let mut result: Vec<u16> = Vec::new();

        for s in input.split(',') {
            let bad = || RangeError::BadRange(s.to_string());
            let c = RE.captures(s).ok_or_else(bad)?;

            let first = parse_with_radix::<u16>(&c[1]).map_err(|_| bad())?;
            let last = match c.get(2) {
                Some(m) => parse_with_radix::<u16>(m.as_str()).map_err(|_| bad())?,
                None => first,
            };
            let (lo, hi) = (cmp::min(first, last), cmp::max(first, last));
            if lo == ADDR_BROADCAST || hi > ADDR_MAX {
                return Err(bad());
            }
            result.extend(lo..=hi);
        }

        result.sort_unstable();
        result.dedup();
        Ok(AddressRange(result))
    }
}

/// Raw payload as a hex string, `0a1b2c`.
#[derive(Debug, Default)]
pub struct HexData(pub Vec<u8>);

impl FromStr for HexData {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Vec::from_hex(s.trim_start_matches("0x"))
            .map(HexData)
            .map_err(|_| RangeError::BadHex(s.to_string()))
    }
}

pub fn parse_with_radix<T>(input: &str) -> Result<T, T::FromStrRadixErr>
where
    T: num::Num,
    <T as num::Num>::FromStrRadixErr: std::error::Error + Send + Sync,
{
    if input.starts_with("0x") {
        T::from_str_radix(input.trim_start_matches("0x"), 16)
    } else if input.starts_with("0b") {
        T::from_str_radix(input.trim_start_matches("0b"), 2)
    } else {
        T::from_str_radix(input, 10)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// UART device or 'auto'
    #[clap(long, short, default_value = "auto")]
    pub port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = DEFAULT_BAUDRATE)]
    pub baudrate: u32,

    /// Attempts per transaction
    #[clap(long, short, default_value_t = NUMBER_OF_ATTEMPTS)]
    pub attempts: usize,

    /// Reply timeout, ms
    #[clap(long, short, default_value_t = 400, parse(try_from_str=parse_with_radix))]
    pub timeout: u64,

    /// Discovery quiet period, ms
    #[clap(long, short, default_value_t = 50, parse(try_from_str=parse_with_radix))]
    pub quiet_period: u64,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Bus framing, 'xc2' or 'modbus'
    #[clap(long, short = 'P', default_value = "xc2")]
    pub protocol: ProtocolKind,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known monitor models
    ListModels,

    /// Find modules and assign free addresses
    Discover,

    /// Echo modules
    Echo { addresses: AddressRange },

    /// Read model and serial number
    Serial { addresses: AddressRange },

    /// Read product information
    Feature {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
    },

    /// Move a module to another address
    SetAddress {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
        #[clap(parse(try_from_str=parse_with_radix))]
        new_address: u16,
    },

    /// List registers reported by a module
    ListRegisters {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
    },

    /// Read register, given as <serial or 0xADDR>/<name>
    ReadReg {
        #[clap(required = true)]
        regs: Vec<RegSpec>,
    },

    /// Read all registers of a module
    ReadAll {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
    },

    /// Write register, given as <serial or 0xADDR>/<name>
    WriteReg { reg: RegSpec, value: String },

    /// Save register values to non-volatile memory
    StoreRegs { addresses: AddressRange },

    /// Reload register values from non-volatile memory
    RestoreRegs { addresses: AddressRange },

    /// Read cell voltages
    #[clap(visible_alias = "volts")]
    Voltages { addresses: AddressRange },

    /// Read cell voltages periodically until interrupted
    Poll {
        addresses: AddressRange,
        /// Interval between reads, ms
        #[clap(long, short, default_value_t = 1000, parse(try_from_str=parse_with_radix))]
        interval: u64,
        /// Stop after this many rounds, 0 runs forever
        #[clap(long, short, default_value_t = 0)]
        count: usize,
    },

    /// Send a raw command and print the answer payload
    SendRaw {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
        #[clap(parse(try_from_str=parse_with_radix))]
        command: u8,
        #[clap(default_value = "")]
        data: HexData,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_ranges_parse() {
        let r: AddressRange = "0x010-0x012,0x020,5".parse().unwrap();
        assert_eq!(*r, vec![5, 0x010, 0x011, 0x012, 0x020]);

        let r: AddressRange = "0x012-0x010".parse().unwrap();
        assert_eq!(*r, vec![0x010, 0x011, 0x012]);

        assert!("0".parse::<AddressRange>().is_err());
        assert!("0x1000".parse::<AddressRange>().is_err());
        assert!("x".parse::<AddressRange>().is_err());
    }

    #[test]
    fn hex_data_parses() {
        assert_eq!("0a1B".parse::<HexData>().unwrap().0, vec![0x0a, 0x1b]);
        assert!("".parse::<HexData>().unwrap().0.is_empty());
        assert!("abc".parse::<HexData>().is_err());
    }
}
