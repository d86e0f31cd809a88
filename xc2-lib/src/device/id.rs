use std::{fmt::Display, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;

use super::DeviceError;
use crate::protocol::{ADDR_BROADCAST, ADDR_MAX};

/// Module location as `xc2://<bus>/<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub bus: String,
    pub address: u16,
}

impl DeviceId {
    pub fn new(bus: &str, address: u16) -> Self {
        Self {
            bus: bus.to_string(),
            address,
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xc2://{}/{:#05x}", self.bus, self.address)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^xc2://([^/\s]+)/(?:0x([[:xdigit:]]{1,3})|([[:digit:]]{1,4}))$")
                    .unwrap();
        }
        let bad = || DeviceError::BadDeviceId(s.to_string());

        let cap = RE.captures(s).ok_or_else(bad)?;
        let address = match (cap.get(2), cap.get(3)) {
            (Some(hex), _) => u16::from_str_radix(hex.as_str(), 16).map_err(|_| bad())?,
            (_, Some(dec)) => dec.as_str().parse().map_err(|_| bad())?,
            _ => return Err(bad()),
        };
        if address == ADDR_BROADCAST || address > ADDR_MAX {
            return Err(bad());
        }
        Ok(DeviceId::new(&cap[1], address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parses_and_formats() {
        let id: DeviceId = "xc2://ttyUSB0/0x012".parse().unwrap();
        assert_eq!(id, DeviceId::new("ttyUSB0", 0x012));
        assert_eq!(id.to_string(), "xc2://ttyUSB0/0x012");

        let id: DeviceId = "xc2://bus1/18".parse().unwrap();
        assert_eq!(id.address, 0x012);

        assert!("xc2://bus1/0x000".parse::<DeviceId>().is_err());
        assert!("xc2://bus1/5000".parse::<DeviceId>().is_err());
        assert!("modbus://bus1/0x012".parse::<DeviceId>().is_err());
    }
}
