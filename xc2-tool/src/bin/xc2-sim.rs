use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::Parser;
use env_logger::TimestampPrecision;
use log::info;

use xc2_lib::config::{SerialSettings, DEFAULT_BAUDRATE};
use xc2_lib::port;
use xc2_lib::protocol::slave::{VirtualBus, VirtualModule};
use xc2_lib::protocol::{ProtocolKind, ADDR_BROADCAST, ADDR_DEFAULT, ADDR_MASTER};

/// Emulated module, `model[@address]`.
#[derive(Debug)]
struct ModuleSpec {
    model: String,
    address: Option<u16>,
}

impl FromStr for ModuleSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (model, address) = match s.split_once('@') {
            Some((model, addr)) => {
                let addr = u16::from_str_radix(addr.trim_start_matches("0x"), 16)?;
                if addr == ADDR_BROADCAST || addr == ADDR_MASTER || addr > ADDR_DEFAULT {
                    return Err(anyhow!("address {:#05x} cannot be used by a module", addr));
                }
                (model, Some(addr))
            }
            None => (s, None),
        };
        Ok(ModuleSpec {
            model: model.to_ascii_lowercase(),
            address,
        })
    }
}

/// Bus address of every module. The first one without an explicit address
/// answers from the factory default, later ones count down from it so that
/// discovery can still tell them apart.
fn module_addresses(specs: &[ModuleSpec]) -> Vec<u16> {
    let taken: Vec<u16> = specs.iter().filter_map(|s| s.address).collect();
    let mut next = ADDR_DEFAULT;
    specs
        .iter()
        .map(|spec| {
            spec.address.unwrap_or_else(|| {
                while taken.contains(&next) {
                    next -= 1;
                }
                next -= 1;
                next + 1
            })
        })
        .collect()
}

#[derive(Parser, Debug)]
#[clap(about = "Serve emulated modules on a serial port")]
struct Args {
    /// UART device
    #[clap(long, short, default_value = "auto")]
    port: String,

    /// UART baud rate
    #[clap(long, short, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,

    /// Bus framing, 'xc2' or 'modbus'
    #[clap(long, short = 'P', default_value = "xc2")]
    protocol: ProtocolKind,

    /// Modules to emulate, e.g. cvm24p@0x010 or cvm64h. Modules without an
    /// address get 0xfff, 0xffe, ... in order
    #[clap(required = true)]
    modules: Vec<ModuleSpec>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .format_target(false)
        .init();

    let addresses = module_addresses(&args.modules);
    let modules = args
        .modules
        .iter()
        .zip(addresses)
        .enumerate()
        .map(|(i, (spec, address))| {
            let serial = [0x5a, 0x00, i as u8];
            let module = match spec.model.as_str() {
                "cvm24p" => VirtualModule::cvm24p(address, &serial),
                "cvm32a" => VirtualModule::cvm32a(address, &serial),
                "cvm64h" => VirtualModule::cvm64h(address, &serial),
                other => return Err(anyhow!("unknown model {}", other)),
            };
            info!(
                "{} serial {} at {:#05x}",
                module.model,
                hex::encode(&module.serial),
                module.address
            );
            Ok(module)
        })
        .collect::<Result<Vec<_>>>()?;

    let settings = SerialSettings {
        port: args.port,
        baudrate: args.baudrate,
        force: true,
        ..Default::default()
    };
    let stream = port::open_port_async(&settings)?;

    let bus = VirtualBus::new(modules);
    let stats = bus.stats();
    let res = bus.serve(stream, args.protocol).await;
    info!(
        "served {} requests, {} overlapping",
        stats.requests(),
        stats.overlaps()
    );
    Ok(res?)
}
