mod common;

use std::time::Duration;

use xc2_lib::device::{
    Device, DeviceError, GenericDevice, Module, MonitorModel, CHANNEL_REGISTER,
};
use xc2_lib::protocol::master::ModuleIdentity;
use xc2_lib::protocol::slave::VirtualModule;
use xc2_lib::protocol::ProtocolKind;
use xc2_lib::registry::{ModuleStatus, Registry};
use xc2_lib::regs::Value;

use common::{start, TestBus};

fn registry(bus: &TestBus) -> Registry {
    Registry::new(bus.master.clone()).with_discovery(common::discovery())
}

fn spaced(mut modules: Vec<VirtualModule>) -> Vec<VirtualModule> {
    for (i, m) in modules.iter_mut().enumerate() {
        m.reply_delay = Duration::from_millis(2 + 2 * i as u64);
    }
    modules
}

#[tokio::test]
async fn structure_read_in_chunks() {
    let mut module = VirtualModule::cvm24p(0x010, &[1]);
    module.structure_chunk = 2;
    let bus = start(vec![module], ProtocolKind::Xc2);

    let identity = ModuleIdentity {
        serial: "01".to_string(),
        model: "CVM24".to_string(),
        address: 0x010,
    };
    let dev = GenericDevice::initialize(bus.master.clone(), identity)
        .await
        .unwrap();

    let regs = dev.registers();
    assert_eq!(regs.len(), 6);
    let ch = regs.find(CHANNEL_REGISTER).unwrap();
    assert_eq!(ch.array_len, 24);
    assert!(ch.read_only);
    assert_eq!(ch.offset, 2 + 1 + 2);
    assert_eq!(regs.total_bytes(), 2 + 1 + 2 + 96 + 8 + 4);
    // size request plus three structure chunks
    assert_eq!(bus.stats.requests(), 4);
}

#[tokio::test]
async fn voltages_of_a_24_channel_monitor() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[0x24])], ProtocolKind::Xc2);
    let mut registry = registry(&bus);

    let devices = registry.discover().await.unwrap();
    let monitor = devices["24"].as_voltage_monitor().unwrap();
    assert_eq!(monitor.model(), MonitorModel::Cvm24p);
    assert_eq!(monitor.channel_count(), 24);

    let before = bus.stats.requests();
    let volts = monitor.read_all_channel_voltages().await.unwrap();
    assert_eq!(bus.stats.requests(), before + 1);
    assert_eq!(volts.len(), 24);

    let (lo, hi) = monitor
        .register(CHANNEL_REGISTER)
        .unwrap()
        .decode_range()
        .unwrap();
    for (i, v) in volts.iter().enumerate() {
        assert!(*v >= lo && *v <= hi);
        assert!((v - (3.2 + i as f64 * 0.001)).abs() < 1e-4);
    }

    bus.modules.lock().await[0].set_channels(&[0.0; 24]);
    let volts = monitor.read_all_channel_voltages().await.unwrap();
    assert_eq!(volts, vec![0.0; 24]);
}

#[tokio::test]
async fn millivolt_channels_are_scaled() {
    let bus = start(vec![VirtualModule::cvm64h(0x010, &[0x64])], ProtocolKind::Xc2);
    let mut registry = registry(&bus);

    let devices = registry.discover().await.unwrap();
    let monitor = devices["64"].as_voltage_monitor().unwrap();
    assert_eq!(monitor.channel_count(), 64);

    let volts = monitor.read_all_channel_voltages().await.unwrap();
    assert_eq!(volts.len(), 64);
    assert!((volts[0] - 3.2).abs() < 1e-9);
    assert!((volts[63] - 3.263).abs() < 1e-9);

    let (lo, hi) = monitor
        .register(CHANNEL_REGISTER)
        .unwrap()
        .decode_range()
        .unwrap();
    assert!((lo + 32.768).abs() < 1e-9);
    assert!((hi - 32.767).abs() < 1e-9);
}

#[tokio::test]
async fn register_access_by_name() {
    let bus = start(vec![VirtualModule::cvm32a(0x010, &[0x32])], ProtocolKind::Xc2);
    let mut registry = registry(&bus);
    let devices = registry.discover().await.unwrap();
    let dev: &Device = &devices["32"];

    assert_eq!(dev.read_register("fw_ver").await.unwrap(), Value::Unsigned(0x0102));
    assert_eq!(
        dev.read_register("name").await.unwrap(),
        Value::Text("cvm".to_string())
    );

    dev.write_register("avg_cnt", Value::Unsigned(32))
        .await
        .unwrap();
    assert_eq!(dev.read_register("avg_cnt").await.unwrap(), Value::Unsigned(32));

    dev.write_register("name", Value::from("pack-1"))
        .await
        .unwrap();
    assert_eq!(
        dev.read_register("name").await.unwrap(),
        Value::Text("pack-1".to_string())
    );

    assert!(matches!(
        dev.read_register("nope").await,
        Err(DeviceError::UnknownRegister(_))
    ));

    let before = bus.stats.requests();
    assert!(matches!(
        dev.write_register("ch_V", Value::Array(vec![Value::Float(1.0)]))
            .await,
        Err(DeviceError::ReadOnlyRegister(_))
    ));
    assert!(matches!(
        dev.write_register("avg_cnt", Value::Unsigned(70000)).await,
        Err(DeviceError::Register(_))
    ));
    assert_eq!(bus.stats.requests(), before);

    let all = dev.generic().read_all_registers().await.unwrap();
    assert_eq!(all.len(), 6);
    assert_eq!(all[2], ("avg_cnt".to_string(), Value::Unsigned(32)));
}

#[tokio::test]
async fn read_only_answer_from_device_is_mapped() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[0x24])], ProtocolKind::Xc2);
    let mut registry = registry(&bus);
    let devices = registry.discover().await.unwrap();
    let dev = devices["24"].generic();

    // the local table says writable, the module disagrees
    let mut regs = dev.registers().clone();
    let mut ch = regs.find(CHANNEL_REGISTER).unwrap().clone();
    ch.read_only = false;
    regs = xc2_lib::regs::RegisterMap::new(
        regs.iter()
            .map(|r| if r.name == ch.name { ch.clone() } else { r.clone() })
            .collect(),
    );
    let dev = dev.with_registers(regs);
    dev.liveness().record_failure();

    assert!(matches!(
        dev.write_register("ch_V", Value::Array(vec![Value::Float(1.0)]))
            .await,
        Err(DeviceError::ReadOnlyRegister(_))
    ));
    // a refusal is still an answer
    assert_eq!(dev.liveness().consecutive_failures(), 0);
}

#[tokio::test]
async fn feature_and_register_actions() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[0x24])], ProtocolKind::Xc2);
    let mut registry = registry(&bus);
    let devices = registry.discover().await.unwrap();
    let dev = devices["24"].generic();

    let features = dev.read_feature().await.unwrap();
    assert_eq!(features.product, "CVM24");
    assert_eq!(features.vendor, "xc2");
    assert_eq!(features.version, "1.0.0");
    assert!(features.custom.is_empty());

    dev.store_registers().await.unwrap();
    dev.restore_registers().await.unwrap();
    assert_eq!(dev.echo().await.unwrap(), 2);
}

#[tokio::test]
async fn rediscovery_marks_silent_modules_unreachable() {
    let bus = start(
        spaced(vec![
            VirtualModule::cvm24p(0x010, &[0xA0]),
            VirtualModule::cvm32a(0x011, &[0xB0]),
        ]),
        ProtocolKind::Xc2,
    );
    let mut registry = registry(&bus);

    let devices = registry.discover().await.unwrap();
    assert_eq!(devices.len(), 2);

    bus.modules.lock().await[1].mute = true;
    let before = bus.stats.requests();
    let devices = registry.discover().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(devices.contains_key("a0"));
    // known layout is reused, only the broadcast went out
    assert_eq!(bus.stats.requests(), before + 1);

    let record = &registry.records()["b0"];
    assert_eq!(record.status, ModuleStatus::Unreachable);
    assert!(record.device.is_some());
    assert!(record.last_error.is_some());
    assert!(registry.device("b0").is_none());

    bus.modules.lock().await[1].mute = false;
    let devices = registry.discover().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(registry.records()["b0"].status, ModuleStatus::Available);
}

#[tokio::test]
async fn one_broken_module_does_not_stop_discovery() {
    let mut broken = VirtualModule::cvm24p(0x011, &[0xB0]);
    broken.structure_chunk = 0;
    let bus = start(
        spaced(vec![VirtualModule::cvm24p(0x010, &[0xA0]), broken]),
        ProtocolKind::Xc2,
    );
    let mut registry = registry(&bus);

    let devices = registry.discover().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(devices.contains_key("a0"));

    let record = &registry.records()["b0"];
    assert_eq!(record.status, ModuleStatus::Unreachable);
    assert!(record.device.is_none());

    assert!(registry.mark_unreachable("a0", &"link lost"));
    assert_eq!(
        registry.records()["a0"].last_error.as_deref(),
        Some("link lost")
    );
    assert!(!registry.mark_unreachable("zz", &"unknown"));
}

#[tokio::test]
async fn consecutive_failures_are_counted_and_reported() {
    let bus = start(
        spaced(vec![
            VirtualModule::cvm24p(0x010, &[0xA0]),
            VirtualModule::cvm32a(0x011, &[0xB0]),
        ]),
        ProtocolKind::Xc2,
    );
    let mut registry = registry(&bus);
    let devices = registry.discover().await.unwrap();
    let a = devices["a0"].clone();
    let b = devices["b0"].clone();
    assert_eq!(b.liveness().consecutive_failures(), 0);
    let first_contact = b.liveness().last_contact().unwrap();

    bus.modules.lock().await[1].mute = true;
    for n in 1..=3 {
        assert!(matches!(
            b.read_register("fw_ver").await,
            Err(DeviceError::TransactionFailed(_))
        ));
        assert_eq!(b.liveness().consecutive_failures(), n);
    }
    assert_eq!(b.liveness().last_contact(), Some(first_contact));

    assert!(a.read_register("avg_cnt").await.is_ok());
    assert_eq!(a.liveness().consecutive_failures(), 0);

    assert!(registry.mark_stale(4).is_empty());
    assert_eq!(registry.mark_stale(3), vec!["b0".to_string()]);
    let record = &registry.records()["b0"];
    assert_eq!(record.status, ModuleStatus::Unreachable);
    assert_eq!(
        record.last_error.as_deref(),
        Some("3 failed transactions in a row")
    );
    assert!(registry.device("a0").is_some());
    assert!(registry.device("b0").is_none());

    bus.modules.lock().await[1].mute = false;
    assert_eq!(b.echo().await.unwrap(), 2);
    assert_eq!(b.liveness().consecutive_failures(), 0);
    assert!(b.liveness().last_contact().unwrap() > first_contact);
}

#[tokio::test]
async fn modbus_monitor_end_to_end() {
    let bus = start(vec![VirtualModule::cvm24p(0xFFF, &[0x24])], ProtocolKind::Modbus);
    let mut registry = registry(&bus);

    let devices = registry.discover().await.unwrap();
    let monitor = devices["24"].as_voltage_monitor().unwrap();
    assert_eq!(monitor.identity().address, 0x002);

    let volts = monitor.read_all_channel_voltages().await.unwrap();
    assert_eq!(volts.len(), 24);
    assert_eq!(registry.address_book().get("24"), Some(0x002));
}
