use std::time::Duration;

pub use tokio_serial::{DataBits, Parity, StopBits};

use crate::protocol::{ProtocolKind, ADDR_MASTER};

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const TIMEOUT_RESPONSE: Duration = Duration::from_millis(400);
pub const NUMBER_OF_ATTEMPTS: usize = 4;
pub const QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Serial line parameters, consumed when the port is opened.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Device path or `auto`.
    pub port: String,
    pub baudrate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Skip the busy-port and RS-485 checks.
    pub force: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "auto".to_string(),
            baudrate: DEFAULT_BAUDRATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reply window of a single attempt.
    pub timeout: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    /// How long a caller may queue for the bus, `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT_RESPONSE,
            max_attempts: NUMBER_OF_ATTEMPTS,
            acquire_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// How long to wait for the first broadcast reply.
    pub timeout: Duration,
    /// Collection ends once no reply arrived for this long.
    pub quiet_period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT_RESPONSE,
            quiet_period: QUIET_PERIOD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub serial: SerialSettings,
    pub protocol: ProtocolKind,
    pub retry: RetryPolicy,
    pub discovery: DiscoveryConfig,
    pub master_address: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            protocol: ProtocolKind::Xc2,
            retry: RetryPolicy::default(),
            discovery: DiscoveryConfig::default(),
            master_address: ADDR_MASTER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BusConfig::default();
        assert_eq!(config.serial.port, "auto");
        assert_eq!(config.serial.baudrate, 1_000_000);
        assert_eq!(config.protocol, ProtocolKind::Xc2);
        assert_eq!(config.retry.timeout, Duration::from_millis(400));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.acquire_timeout, None);
        assert_eq!(config.master_address, 0x001);
    }
}
