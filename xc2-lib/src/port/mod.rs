#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(target_os = "linux")]
mod linux;
mod transport;

#[cfg(not(target_os = "linux"))]
use fallback::is_port_open;
#[cfg(target_os = "linux")]
use linux::is_port_open;

pub use tokio_serial::SerialStream;
pub use transport::{AsyncStream, CloseHandle, Transport};

use anyhow::Result;
use core::time::Duration;
use log::debug;
use serialport::{self, SerialPortType};
use thiserror::Error;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::config::SerialSettings;
use crate::protocol::MAX_BAUDRATE;

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("no compatible ports found")]
    NoCompatiblePort,
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("cannot open {port_name:?}")]
    PortUnavailable {
        port_name: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("baud rate {0} out of range")]
    BadBaudrate(u32),
    #[error("rs485 configuration failed on {port_name:?}")]
    Rs485Error { port_name: String },
    #[error("rs485 not supported on this platform")]
    Rs485Unsupported,
}

trait Rs485 {
    fn rs485_is_enabled(&self) -> Result<bool>;
    fn rs485_enable(&self, enable: bool) -> Result<()>;

    fn rs485_is_supported(&self) -> bool {
        match self.rs485_is_enabled() {
            Ok(enabled) => self.rs485_enable(enabled).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(PartialEq)]
struct UsbId(u16, u16);

static COMPATIBLE_IDS: &[UsbId] = &[
    UsbId(0x0483, 0x5740), // STMicroelectronics Virtual COM Port
    UsbId(0x0403, 0x6001), // FTDI FT232R USB UART
    UsbId(0x0403, 0x6014), // FTDI FT232H Single HS USB-UART/FIFO IC
    UsbId(0x0403, 0x6015), // FTDI FT-X series
    UsbId(0x1a86, 0x7523), // QinHeng Electronics HL-340 USB-Serial adapter
];

/// Opens the bus port described by `settings`.
///
/// `auto` picks the first USB adapter with a known id, or failing that the
/// first free native port with RS-485 support.
pub fn open_port_async(settings: &SerialSettings) -> Result<SerialStream> {
    if settings.baudrate == 0 || settings.baudrate > MAX_BAUDRATE {
        return Err(OpenPortError::BadBaudrate(settings.baudrate).into());
    }

    let true_name: String = if settings.port == "auto" {
        guess_port()?
    } else {
        settings.port.clone()
    };

    if !settings.force && is_port_open(&true_name) {
        return Err(OpenPortError::PortBusy {
            port_name: true_name,
        }
        .into());
    }

    let mut port = tokio_serial::new(&true_name, settings.baudrate)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .open_native_async()
        .map_err(|source| OpenPortError::PortUnavailable {
            port_name: true_name.clone(),
            source,
        })?;

    if port.rs485_is_supported() && port.rs485_enable(true).is_err() && !settings.force {
        return Err(OpenPortError::Rs485Error {
            port_name: true_name,
        }
        .into());
    }

    port.set_timeout(Duration::from_millis(10))?;

    debug!(
        "open_port OK: {} @ {} baud, {:?} {:?} {:?}",
        &true_name, settings.baudrate, settings.data_bits, settings.parity, settings.stop_bits
    );
    Ok(port)
}

/// Opens the port and wraps it into a [`Transport`].
pub fn open_transport(settings: &SerialSettings) -> Result<(Transport, CloseHandle)> {
    let port = open_port_async(settings)?;
    Ok(Transport::new(settings.port.as_str(), port))
}

fn guess_port() -> Result<String> {
    serialport::available_ports()?
        .into_iter()
        .filter(|info| match &info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                COMPATIBLE_IDS.contains(&UsbId(usb_info.vid, usb_info.pid))
            }
            SerialPortType::Unknown => {
                !is_port_open(&info.port_name)
                    && match serialport::new(&info.port_name, 9600).open_native() {
                        Ok(p) => p.rs485_is_supported(),
                        Err(_) => false,
                    }
            }
            SerialPortType::PciPort | SerialPortType::BluetoothPort => false,
        })
        .map(|info| info.port_name)
        .next()
        .ok_or_else(|| OpenPortError::NoCompatiblePort.into())
}
