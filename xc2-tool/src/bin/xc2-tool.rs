pub mod cli;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Bash};
use json::JsonValue;
use log::{error, info, warn};

use xc2_lib::config::{BusConfig, DiscoveryConfig, RetryPolicy, SerialSettings};
use xc2_lib::device::{self, Device, GenericDevice, Module};
use xc2_lib::protocol::master::{Master, ModuleIdentity};
use xc2_lib::registry::Registry;
use xc2_lib::regs::{RegSpec, Value};

use cli::{parse_with_radix, Cli, Commands};

enum OutputFormat {
    Plain,
    Json,
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => (*b).into(),
        Value::Unsigned(u) => (*u).into(),
        Value::Signed(i) => (*i).into(),
        Value::Float(f) => (*f).into(),
        Value::Text(s) => s.as_str().into(),
        Value::Array(items) => JsonValue::Array(items.iter().map(value_to_json).collect()),
    }
}

fn identity_to_json(identity: &ModuleIdentity) -> JsonValue {
    let mut obj = JsonValue::new_object();
    obj["serial"] = identity.serial.as_str().into();
    obj["model"] = identity.model.as_str().into();
    obj["address"] = identity.address.into();
    obj
}

fn identity_line(identity: &ModuleIdentity) -> String {
    format!(
        "{} {:<6} {:#05x}",
        identity.serial, identity.model, identity.address
    )
}

fn bus_config(cli: &Cli) -> BusConfig {
    let timeout = Duration::from_millis(cli.timeout);
    BusConfig {
        serial: SerialSettings {
            port: cli.port.clone(),
            baudrate: cli.baudrate,
            force: cli.force,
            ..Default::default()
        },
        protocol: cli.protocol,
        retry: RetryPolicy {
            timeout,
            max_attempts: cli.attempts,
            acquire_timeout: None,
        },
        discovery: DiscoveryConfig {
            timeout,
            quiet_period: Duration::from_millis(cli.quiet_period),
        },
        ..Default::default()
    }
}

async fn open_device(master: &Arc<Master>, address: u16) -> Result<Device> {
    let (model, serial) = master
        .read_serial_number(address)
        .await
        .with_context(|| format!("Failed to identify module {:#05x}", address))?;
    let identity = ModuleIdentity {
        serial,
        model,
        address,
    };
    let dev = GenericDevice::initialize(master.clone(), identity)
        .await
        .with_context(|| format!("Failed to read register structure of {:#05x}", address))?;
    Ok(Device::new(dev))
}

/// Module part of a `module/register` argument: `0x`-prefixed bus address or serial number.
async fn resolve_module(
    master: &Arc<Master>,
    discovery: DiscoveryConfig,
    module: &str,
) -> Result<Device> {
    if module.starts_with("0x") {
        let address = parse_with_radix::<u16>(module)
            .map_err(|_| anyhow!("Bad module address '{}'", module))?;
        return open_device(master, address).await;
    }

    let mut registry = Registry::new(master.clone()).with_discovery(discovery);
    let mut devices = registry.discover().await.context("Discovery failed")?;
    devices
        .remove(module)
        .ok_or_else(|| anyhow!("Module {} not found", module))
}

fn cmd_list_models(fmt: OutputFormat) -> Result<String> {
    let models = device::list_models();
    Ok(match fmt {
        OutputFormat::Plain => models.join("\n"),
        OutputFormat::Json => json::stringify(models),
    })
}

async fn cmd_discover(
    master: &Arc<Master>,
    discovery: DiscoveryConfig,
    fmt: OutputFormat,
) -> Result<String> {
    let mut registry = Registry::new(master.clone()).with_discovery(discovery);
    let devices = registry.discover().await.context("Discovery failed")?;

    let unreachable: Vec<_> = registry
        .records()
        .values()
        .filter(|r| r.last_error.is_some())
        .collect();
    for record in &unreachable {
        error!(
            "{}: {}",
            record.identity.serial,
            record.last_error.as_deref().unwrap_or_default()
        );
    }

    let identities: Vec<&ModuleIdentity> = devices.values().map(|d| d.identity()).collect();
    Ok(match fmt {
        OutputFormat::Plain => identities
            .iter()
            .map(|id| identity_line(id))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => json::stringify(JsonValue::Array(
            identities.iter().map(|id| identity_to_json(id)).collect(),
        )),
    })
}

async fn cmd_echo(master: &Master, addresses: &[u16], fmt: OutputFormat) -> Result<String> {
    let mut res = Vec::with_capacity(addresses.len());
    for &address in addresses {
        let mode = master
            .echo(address)
            .await
            .with_context(|| format!("Failed to echo {:#05x}", address))?;
        res.push(match mode {
            1 => "bootloader",
            2 => "application",
            _ => "unknown",
        });
    }

    Ok(match fmt {
        OutputFormat::Plain => res.join("\n"),
        OutputFormat::Json => json::stringify(res),
    })
}

async fn cmd_serial(master: &Master, addresses: &[u16], fmt: OutputFormat) -> Result<String> {
    let mut res = Vec::with_capacity(addresses.len());
    for &address in addresses {
        let (model, serial) = master
            .read_serial_number(address)
            .await
            .with_context(|| format!("Failed to read serial of {:#05x}", address))?;
        res.push(ModuleIdentity {
            serial,
            model,
            address,
        });
    }

    Ok(match fmt {
        OutputFormat::Plain => res.iter().map(identity_line).collect::<Vec<_>>().join("\n"),
        OutputFormat::Json => {
            json::stringify(JsonValue::Array(res.iter().map(identity_to_json).collect()))
        }
    })
}

async fn cmd_feature(master: &Arc<Master>, address: u16, fmt: OutputFormat) -> Result<String> {
    let dev = open_device(master, address).await?;
    let features = dev
        .generic()
        .read_feature()
        .await
        .with_context(|| format!("Failed to read features of {:#05x}", address))?;

    Ok(match fmt {
        OutputFormat::Plain => {
            let mut lines = vec![features.product, features.vendor, features.version];
            lines.extend(features.custom);
            lines.join("\n")
        }
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            obj["product"] = features.product.into();
            obj["vendor"] = features.vendor.into();
            obj["version"] = features.version.into();
            obj["custom"] = features.custom.into();
            json::stringify(obj)
        }
    })
}

async fn cmd_set_address(master: &Master, address: u16, new_address: u16) -> Result<String> {
    master
        .set_address(address, new_address)
        .await
        .with_context(|| format!("Failed to move {:#05x} to {:#05x}", address, new_address))?;
    info!("{:#05x} now answers at {:#05x}", address, new_address);
    Ok(String::new())
}

async fn cmd_list_registers(master: &Arc<Master>, address: u16) -> Result<String> {
    let dev = open_device(master, address).await?;
    Ok(dev
        .registers()
        .iter()
        .map(|reg| reg.to_string())
        .collect::<Vec<_>>()
        .join("\n"))
}

async fn cmd_read_reg(
    master: &Arc<Master>,
    discovery: DiscoveryConfig,
    specs: &[RegSpec],
    fmt: OutputFormat,
) -> Result<String> {
    let mut res = Vec::with_capacity(specs.len());
    for spec in specs {
        let dev = resolve_module(master, discovery, &spec.module).await?;
        let value = dev
            .read_register(&spec.name)
            .await
            .with_context(|| format!("Failed to read {}/{}", spec.module, spec.name))?;
        let reg = dev.register(&spec.name)?;
        res.push((reg.format_value(&value), value));
    }

    Ok(match fmt {
        OutputFormat::Plain => res
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => {
            if res.len() > 1 {
                json::stringify(JsonValue::Array(
                    res.iter().map(|(_, v)| value_to_json(v)).collect(),
                ))
            } else {
                json::stringify(value_to_json(&res[0].1))
            }
        }
    })
}

async fn cmd_read_all(master: &Arc<Master>, address: u16, fmt: OutputFormat) -> Result<String> {
    let dev = open_device(master, address).await?;
    let values = dev
        .generic()
        .read_all_registers()
        .await
        .with_context(|| format!("Failed to read registers of {:#05x}", address))?;

    Ok(match fmt {
        OutputFormat::Plain => values
            .iter()
            .map(|(name, value)| {
                let shown = dev
                    .registers()
                    .find(name)
                    .map(|reg| reg.format_value(value))
                    .unwrap_or_else(|| value.to_string());
                format!("{}: {}", name, shown)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            for (name, value) in &values {
                obj[name.as_str()] = value_to_json(value);
            }
            json::stringify(obj)
        }
    })
}

async fn cmd_write_reg(
    master: &Arc<Master>,
    discovery: DiscoveryConfig,
    spec: &RegSpec,
    input: &str,
) -> Result<String> {
    let dev = resolve_module(master, discovery, &spec.module).await?;
    let value = dev.register(&spec.name)?.parse_value(input)?;
    dev.write_register(&spec.name, value)
        .await
        .with_context(|| format!("Failed to write {}/{}", spec.module, spec.name))?;
    Ok(String::new())
}

async fn cmd_store_regs(master: &Arc<Master>, addresses: &[u16], restore: bool) -> Result<String> {
    for &address in addresses {
        let dev = open_device(master, address).await?;
        let res = if restore {
            dev.generic().restore_registers().await
        } else {
            dev.generic().store_registers().await
        };
        res.with_context(|| format!("Failed to update registers of {:#05x}", address))?;
    }
    Ok(String::new())
}

async fn monitors(master: &Arc<Master>, addresses: &[u16]) -> Result<Vec<Device>> {
    let mut res = Vec::with_capacity(addresses.len());
    for &address in addresses {
        let dev = open_device(master, address).await?;
        if dev.as_voltage_monitor().is_none() {
            return Err(anyhow!(
                "{:#05x} ({}) is not a voltage monitor",
                address,
                dev.identity().model
            ));
        }
        res.push(dev);
    }
    Ok(res)
}

async fn read_voltages(devices: &[Device]) -> Result<Vec<Vec<f64>>> {
    let mut res = Vec::with_capacity(devices.len());
    for dev in devices {
        let monitor = dev
            .as_voltage_monitor()
            .ok_or_else(|| anyhow!("{} is not a voltage monitor", dev.identity().serial))?;
        res.push(
            monitor
                .read_all_channel_voltages()
                .await
                .with_context(|| format!("Failed to read voltages of {}", dev.identity().serial))?,
        );
    }
    Ok(res)
}

/// One polling round. A module that fails its transaction is unreachable for
/// this round only and shows up as a gap.
async fn poll_round(devices: &[Device]) -> Vec<Option<Vec<f64>>> {
    let mut res = Vec::with_capacity(devices.len());
    for dev in devices {
        let volts = match dev.as_voltage_monitor() {
            Some(monitor) => match monitor.read_all_channel_voltages().await {
                Ok(volts) => Some(volts),
                Err(err) => {
                    warn!("{} unreachable: {}", dev.identity().serial, err);
                    None
                }
            },
            None => None,
        };
        res.push(volts);
    }
    res
}

fn format_voltages(volts: &[Option<Vec<f64>>], fmt: &OutputFormat) -> String {
    match fmt {
        OutputFormat::Plain => volts
            .iter()
            .map(|v| match v {
                Some(v) => v
                    .iter()
                    .map(|x| format!("{:.4}", x))
                    .collect::<Vec<_>>()
                    .join(" "),
                None => "-".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Json => {
            if volts.len() > 1 {
                json::stringify(volts.to_vec())
            } else {
                json::stringify(volts[0].clone())
            }
        }
    }
}

async fn cmd_voltages(master: &Arc<Master>, addresses: &[u16], fmt: OutputFormat) -> Result<String> {
    let devices = monitors(master, addresses).await?;
    let volts: Vec<_> = read_voltages(&devices).await?.into_iter().map(Some).collect();
    Ok(format_voltages(&volts, &fmt))
}

async fn cmd_poll(
    master: &Arc<Master>,
    addresses: &[u16],
    interval: Duration,
    count: usize,
    fmt: OutputFormat,
) -> Result<String> {
    let devices = monitors(master, addresses).await?;
    let mut ticker = tokio::time::interval(interval);

    let mut round = 0;
    while count == 0 || round < count {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }
        let volts = poll_round(&devices).await;
        println!("{}", format_voltages(&volts, &fmt));
        round += 1;
    }

    Ok(String::new())
}

async fn cmd_send_raw(master: &Master, address: u16, command: u8, data: &[u8]) -> Result<String> {
    let answer = master
        .command(address, command, data)
        .await
        .with_context(|| format!("Command {:#04x} to {:#05x} failed", command, address))?;
    Ok(hex::encode(answer))
}

async fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(Bash, &mut cli::Cli::command(), "xc2-tool", &mut io::stdout());

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    if let Commands::ListModels = cli.command {
        return cmd_list_models(fmt);
    }

    let config = bus_config(&cli);
    let master = Arc::new(Master::open(&config)?);
    let discovery = config.discovery;

    let res = match &cli.command {
        Commands::ListModels => cmd_list_models(fmt),
        Commands::Discover => cmd_discover(&master, discovery, fmt).await,
        Commands::Echo { addresses } => cmd_echo(&master, addresses, fmt).await,
        Commands::Serial { addresses } => cmd_serial(&master, addresses, fmt).await,
        Commands::Feature { address } => cmd_feature(&master, *address, fmt).await,
        Commands::SetAddress {
            address,
            new_address,
        } => cmd_set_address(&master, *address, *new_address).await,
        Commands::ListRegisters { address } => cmd_list_registers(&master, *address).await,
        Commands::ReadReg { regs } => cmd_read_reg(&master, discovery, regs, fmt).await,
        Commands::ReadAll { address } => cmd_read_all(&master, *address, fmt).await,
        Commands::WriteReg { reg, value } => cmd_write_reg(&master, discovery, reg, value).await,
        Commands::StoreRegs { addresses } => cmd_store_regs(&master, addresses, false).await,
        Commands::RestoreRegs { addresses } => cmd_store_regs(&master, addresses, true).await,
        Commands::Voltages { addresses } => cmd_voltages(&master, addresses, fmt).await,
        Commands::Poll {
            addresses,
            interval,
            count,
        } => {
            cmd_poll(
                &master,
                addresses,
                Duration::from_millis(*interval),
                *count,
                fmt,
            )
            .await
        }
        Commands::SendRaw {
            address,
            command,
            data,
        } => cmd_send_raw(&master, *address, *command, &data.0).await,
    };

    master.close();
    res
}

#[tokio::main]
async fn main() {
    match do_main().await {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xc2_lib::port::Transport;
    use xc2_lib::protocol::slave::{VirtualBus, VirtualModule};
    use xc2_lib::protocol::ProtocolKind;

    #[tokio::test]
    async fn silent_module_leaves_a_gap_in_the_round() {
        let (host, dev) = tokio::io::duplex(4096);
        let bus = VirtualBus::new(vec![
            VirtualModule::cvm24p(0x010, &[0xA0]),
            VirtualModule::cvm32a(0x011, &[0xB0]),
        ]);
        let modules = bus.modules();
        tokio::spawn(bus.serve(dev, ProtocolKind::Xc2));

        let (transport, closer) = Transport::new("virtual", host);
        let master = Arc::new(Master::new(transport, closer, ProtocolKind::Xc2).with_policy(
            RetryPolicy {
                timeout: Duration::from_millis(50),
                max_attempts: 2,
                acquire_timeout: None,
            },
        ));
        let devices = monitors(&master, &[0x010, 0x011]).await.unwrap();

        modules.lock().await[1].mute = true;
        let round = poll_round(&devices).await;
        assert_eq!(round.len(), 2);
        assert_eq!(round[0].as_ref().map(Vec::len), Some(24));
        assert!(round[1].is_none());

        let text = format_voltages(&round, &OutputFormat::Plain);
        assert_eq!(text.lines().last(), Some("-"));
        assert!(format_voltages(&round, &OutputFormat::Json).ends_with(",null]"));

        modules.lock().await[1].mute = false;
        let round = poll_round(&devices).await;
        assert_eq!(round[1].as_ref().map(Vec::len), Some(32));
    }
}
