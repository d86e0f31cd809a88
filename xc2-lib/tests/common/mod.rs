#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use xc2_lib::config::{DiscoveryConfig, RetryPolicy};
use xc2_lib::port::Transport;
use xc2_lib::protocol::master::Master;
use xc2_lib::protocol::slave::{BusStats, VirtualBus, VirtualModule};
use xc2_lib::protocol::ProtocolKind;

pub const TIMEOUT: Duration = Duration::from_millis(100);

pub fn policy(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        timeout: TIMEOUT,
        max_attempts,
        acquire_timeout: None,
    }
}

pub fn discovery() -> DiscoveryConfig {
    DiscoveryConfig {
        timeout: Duration::from_millis(200),
        quiet_period: Duration::from_millis(50),
    }
}

pub struct TestBus {
    pub master: Arc<Master>,
    pub stats: Arc<BusStats>,
    pub modules: Arc<Mutex<Vec<VirtualModule>>>,
}

/// Master talking to `modules` over an in-memory stream.
pub fn start(modules: Vec<VirtualModule>, kind: ProtocolKind) -> TestBus {
    let _ = env_logger::builder().is_test(true).try_init();

    let (host, dev) = tokio::io::duplex(4096);
    let bus = VirtualBus::new(modules);
    let stats = bus.stats();
    let modules = bus.modules();
    tokio::spawn(bus.serve(dev, kind));

    let (transport, closer) = Transport::new("virtual", host);
    let master = Master::new(transport, closer, kind).with_policy(policy(3));
    TestBus {
        master: Arc::new(master),
        stats,
        modules,
    }
}
