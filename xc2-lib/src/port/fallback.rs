use super::{OpenPortError, Rs485};
use anyhow::Result;

// TODO: scan open handles on macos via lsof
pub fn is_port_open(_port_name: &str) -> bool {
    false
}

impl<T> Rs485 for T {
    fn rs485_is_enabled(&self) -> Result<bool> {
        Err(OpenPortError::Rs485Unsupported.into())
    }

    fn rs485_enable(&self, _enable: bool) -> Result<()> {
        Err(OpenPortError::Rs485Unsupported.into())
    }
}
