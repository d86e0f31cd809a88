use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use env_logger::TimestampPrecision;
use log::{info, warn};

use xc2_lib::config::{BusConfig, SerialSettings, DEFAULT_BAUDRATE};
use xc2_lib::device::{Device, GenericDevice, Module};
use xc2_lib::protocol::master::{AddressBook, Master};
use xc2_lib::protocol::ProtocolKind;

#[derive(Parser, Debug)]
#[clap(about = "Poll every monitor on the bus from concurrent tasks")]
struct Args {
    #[clap(long, short, default_value = "auto")]
    port: String,

    #[clap(long, short, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,

    #[clap(long, short = 'P', default_value = "xc2")]
    protocol: ProtocolKind,

    /// Pollers per module
    #[clap(long, short, default_value_t = 2)]
    tasks: usize,

    /// Reads per poller
    #[clap(long, short, default_value_t = 100)]
    rounds: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(TimestampPrecision::Millis))
        .format_target(false)
        .init();

    let config = BusConfig {
        serial: SerialSettings {
            port: args.port,
            baudrate: args.baudrate,
            ..Default::default()
        },
        protocol: args.protocol,
        ..Default::default()
    };
    let master = Arc::new(Master::open(&config)?);

    let mut book = AddressBook::new();
    let found = master
        .broadcast_echo(
            config.discovery.timeout,
            config.discovery.quiet_period,
            &mut book,
        )
        .await?;

    let mut monitors = Vec::new();
    for identity in found {
        let dev = Device::new(GenericDevice::initialize(master.clone(), identity).await?);
        if dev.as_voltage_monitor().is_some() {
            monitors.push(dev);
        }
    }
    info!("{} monitor(s), {} pollers each", monitors.len(), args.tasks);

    let start = Instant::now();
    let mut handles = Vec::new();
    for dev in &monitors {
        for _ in 0..args.tasks {
            let dev = dev.clone();
            let rounds = args.rounds;
            handles.push(tokio::spawn(async move {
                let mut failed = 0;
                for _ in 0..rounds {
                    if let Some(monitor) = dev.as_voltage_monitor() {
                        if let Err(err) = monitor.read_all_channel_voltages().await {
                            warn!("{}: {}", dev.identity().serial, err);
                            failed += 1;
                        }
                    }
                }
                failed
            }));
        }
    }

    let mut failed = 0;
    for handle in handles {
        failed += handle.await?;
    }

    let total = monitors.len() * args.tasks * args.rounds;
    let elapsed = start.elapsed();
    info!(
        "{} reads, {} failed, {:.1} reads/s",
        total,
        failed,
        total as f64 / elapsed.max(Duration::from_millis(1)).as_secs_f64()
    );
    master.close();
    Ok(())
}
