mod common;

use std::time::Duration;

use tokio::time::Instant;
use xc2_lib::port::Transport;
use xc2_lib::protocol::master::{AddressBook, ADDR_FIRST_ASSIGNABLE};
use xc2_lib::protocol::slave::{VirtualBus, VirtualModule};
use xc2_lib::protocol::{
    packet, AnswerCode, Command, Frame, ProtocolError, ProtocolKind, ADDR_BROADCAST,
    ADDR_DEFAULT, ADDR_MASTER,
};

use common::{start, TIMEOUT};

#[tokio::test]
async fn answer_on_first_attempt() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[1, 2])], ProtocolKind::Xc2);

    let frame = bus
        .master
        .send_and_wait(0x010, Command::Echo, &[], TIMEOUT, 3)
        .await
        .unwrap();
    assert_eq!(frame.src, 0x010);
    assert_eq!(frame.data, vec![2]);
    assert_eq!(bus.stats.requests(), 1);

    let (model, serial) = bus.master.read_serial_number(0x010).await.unwrap();
    assert_eq!(model, "CVM24");
    assert_eq!(serial, "0102");
}

#[tokio::test]
async fn silent_bus_is_tried_max_attempts_times() {
    let mut module = VirtualModule::cvm24p(0x010, &[1]);
    module.mute = true;
    let bus = start(vec![module], ProtocolKind::Xc2);

    let res = bus
        .master
        .send_and_wait(0x010, Command::Echo, &[], Duration::from_millis(30), 3)
        .await;
    assert!(matches!(res, Err(ProtocolError::NoResponse { attempts: 3 })));
    assert_eq!(bus.stats.requests(), 3);
}

#[tokio::test]
async fn corrupt_answer_is_retried() {
    let mut module = VirtualModule::cvm24p(0x010, &[1]);
    module.corrupt_replies = 1;
    let bus = start(vec![module], ProtocolKind::Xc2);

    assert_eq!(bus.master.echo(0x010).await.unwrap(), 2);
    assert_eq!(bus.stats.requests(), 2);
}

#[tokio::test]
async fn corruption_on_every_attempt_reports_checksum() {
    let mut module = VirtualModule::cvm24p(0x010, &[1]);
    module.corrupt_replies = 10;
    let bus = start(vec![module], ProtocolKind::Xc2);

    let res = bus
        .master
        .send_and_wait(0x010, Command::Echo, &[], TIMEOUT, 2)
        .await;
    assert!(matches!(res, Err(ProtocolError::ChecksumMismatch(_))));
    assert_eq!(bus.stats.requests(), 2);
}

#[tokio::test]
async fn nak_is_not_retried() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[1])], ProtocolKind::Xc2);

    // ch_V is read only
    let res = bus
        .master
        .send_and_wait(0x010, Command::RegistryWrite, &[0, 3, 0, 0, 0, 0, 0, 0], TIMEOUT, 3)
        .await;
    assert!(matches!(res, Err(ProtocolError::Nak(AnswerCode::ReadOnly))));
    assert_eq!(bus.stats.requests(), 1);
}

#[tokio::test]
async fn broadcast_address_is_refused_for_transactions() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[1])], ProtocolKind::Xc2);

    let res = bus
        .master
        .send_and_wait(ADDR_BROADCAST, Command::Echo, &[], TIMEOUT, 3)
        .await;
    assert!(matches!(res, Err(ProtocolError::BroadcastNotAllowed)));
    assert_eq!(bus.stats.requests(), 0);
}

#[tokio::test]
async fn suppressed_answer_leaves_bus_clean() {
    let bus = start(vec![VirtualModule::cvm24p(0x010, &[1])], ProtocolKind::Xc2);

    bus.master
        .send_no_response(0x010, Command::Echo, &[])
        .await
        .unwrap();
    assert_eq!(bus.master.echo(0x010).await.unwrap(), 2);
    assert_eq!(bus.stats.requests(), 2);
}

#[tokio::test]
async fn discovery_assigns_distinct_addresses() {
    let mut a = VirtualModule::cvm24p(0x010, &[0xA0]);
    let mut b = VirtualModule::cvm32a(ADDR_DEFAULT, &[0xB0]);
    let mut c = VirtualModule::cvm64h(0x011, &[0xC0]);
    a.reply_delay = Duration::from_millis(2);
    b.reply_delay = Duration::from_millis(4);
    c.reply_delay = Duration::from_millis(6);
    let bus = start(vec![a, b, c], ProtocolKind::Xc2);

    let mut book = AddressBook::new();
    let config = common::discovery();
    let found = bus
        .master
        .broadcast_echo(config.timeout, config.quiet_period, &mut book)
        .await
        .unwrap();

    assert_eq!(found.len(), 3);
    let mut addresses: Vec<u16> = found.iter().map(|m| m.address).collect();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), 3);

    let b = found.iter().find(|m| m.serial == "b0").unwrap();
    assert_eq!(b.model, "CVM32");
    assert_eq!(b.address, ADDR_FIRST_ASSIGNABLE);
    assert_eq!(book.get("b0"), Some(ADDR_FIRST_ASSIGNABLE));
    assert_eq!(book.get("a0"), Some(0x010));

    // the module really moved
    assert_eq!(bus.modules.lock().await[1].address, ADDR_FIRST_ASSIGNABLE);
    assert_eq!(bus.master.echo(ADDR_FIRST_ASSIGNABLE).await.unwrap(), 2);
}

#[tokio::test]
async fn discovery_keeps_booked_addresses() {
    let bus = start(
        vec![VirtualModule::cvm24p(0x030, &[0xA0])],
        ProtocolKind::Xc2,
    );

    let mut book = AddressBook::from_assignments(vec![("a0".to_string(), 0x005)]);
    let config = common::discovery();
    let found = bus
        .master
        .broadcast_echo(config.timeout, config.quiet_period, &mut book)
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address, 0x005);
    assert_eq!(bus.modules.lock().await[0].address, 0x005);
}

async fn discover(bus: &common::TestBus, book: &mut AddressBook) -> Vec<(String, u16)> {
    let config = common::discovery();
    let mut found: Vec<(String, u16)> = bus
        .master
        .broadcast_echo(config.timeout, config.quiet_period, book)
        .await
        .unwrap()
        .into_iter()
        .map(|m| (m.serial, m.address))
        .collect();
    found.sort();
    found
}

async fn bus_addresses(bus: &common::TestBus) -> Vec<u16> {
    bus.modules.lock().await.iter().map(|m| m.address).collect()
}

#[tokio::test]
async fn booked_module_waits_for_its_address_to_be_vacated() {
    let mut a = VirtualModule::cvm24p(0x020, &[0xA0]);
    let mut b = VirtualModule::cvm24p(0x010, &[0xB0]);
    a.reply_delay = Duration::from_millis(2);
    b.reply_delay = Duration::from_millis(4);
    let bus = start(vec![a, b], ProtocolKind::Xc2);

    let mut book = AddressBook::from_assignments(vec![("a0".to_string(), 0x010)]);
    let found = discover(&bus, &mut book).await;

    assert_eq!(
        found,
        vec![
            ("a0".to_string(), 0x010),
            ("b0".to_string(), ADDR_FIRST_ASSIGNABLE)
        ]
    );
    assert_eq!(bus_addresses(&bus).await, vec![0x010, ADDR_FIRST_ASSIGNABLE]);
    assert_eq!(book.get("b0"), Some(ADDR_FIRST_ASSIGNABLE));
    assert_eq!(bus.master.echo(0x010).await.unwrap(), 2);
}

#[tokio::test]
async fn swapped_bookings_are_resolved() {
    let mut a = VirtualModule::cvm24p(0x010, &[0xA0]);
    let mut b = VirtualModule::cvm24p(0x020, &[0xB0]);
    a.reply_delay = Duration::from_millis(2);
    b.reply_delay = Duration::from_millis(4);
    let bus = start(vec![a, b], ProtocolKind::Xc2);

    let mut book = AddressBook::from_assignments(vec![
        ("a0".to_string(), 0x020),
        ("b0".to_string(), 0x010),
    ]);
    let found = discover(&bus, &mut book).await;

    assert_eq!(
        found,
        vec![("a0".to_string(), 0x020), ("b0".to_string(), 0x010)]
    );
    assert_eq!(bus_addresses(&bus).await, vec![0x020, 0x010]);
}

#[tokio::test]
async fn booked_address_held_by_skipped_modules_is_not_taken() {
    let mut a = VirtualModule::cvm24p(0x020, &[0xA0]);
    let mut b = VirtualModule::cvm24p(0x010, &[0xB0]);
    let mut c = VirtualModule::cvm24p(0x010, &[0xC0]);
    a.reply_delay = Duration::from_millis(2);
    b.reply_delay = Duration::from_millis(4);
    c.reply_delay = Duration::from_millis(6);
    let bus = start(vec![a, b, c], ProtocolKind::Xc2);

    let mut book = AddressBook::from_assignments(vec![("a0".to_string(), 0x010)]);
    let found = discover(&bus, &mut book).await;

    assert_eq!(found, vec![("a0".to_string(), 0x020)]);
    assert_eq!(bus_addresses(&bus).await, vec![0x020, 0x010, 0x010]);
    assert_eq!(book.get("a0"), Some(0x020));
}

#[tokio::test]
async fn modules_sharing_an_address_are_skipped() {
    let mut a = VirtualModule::cvm24p(0x010, &[0xA0]);
    let mut b = VirtualModule::cvm24p(0x010, &[0xB0]);
    let mut c = VirtualModule::cvm24p(0x020, &[0xC0]);
    a.reply_delay = Duration::from_millis(2);
    b.reply_delay = Duration::from_millis(4);
    c.reply_delay = Duration::from_millis(6);
    let bus = start(vec![a, b, c], ProtocolKind::Xc2);

    let mut book = AddressBook::new();
    let config = common::discovery();
    let found = bus
        .master
        .broadcast_echo(config.timeout, config.quiet_period, &mut book)
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].serial, "c0");
}

#[tokio::test]
async fn empty_bus_discovers_nothing() {
    let bus = start(Vec::new(), ProtocolKind::Xc2);

    let mut book = AddressBook::new();
    let found = bus
        .master
        .broadcast_echo(Duration::from_millis(50), Duration::from_millis(20), &mut book)
        .await
        .unwrap();
    assert!(found.is_empty());
    assert!(book.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_do_not_interleave() {
    let modules = (0..4)
        .map(|i| VirtualModule::cvm24p(0x010 + i, &[i as u8]))
        .collect();
    let bus = start(modules, ProtocolKind::Xc2);

    let tasks: Vec<_> = (0..8u16)
        .map(|i| {
            let master = bus.master.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    master.echo(0x010 + i % 4).await?;
                }
                Ok::<_, ProtocolError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(bus.stats.requests(), 40);
    assert_eq!(bus.stats.overlaps(), 0);
}

#[tokio::test]
async fn close_aborts_pending_transaction() {
    let mut module = VirtualModule::cvm24p(0x010, &[1]);
    module.reply_delay = Duration::from_millis(500);
    let bus = start(vec![module], ProtocolKind::Xc2);

    let master = bus.master.clone();
    let pending = tokio::spawn(async move {
        master
            .send_and_wait(0x010, Command::Echo, &[], Duration::from_secs(2), 3)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.master.close();

    let res = pending.await.unwrap();
    assert!(matches!(res, Err(ProtocolError::TransportClosed)));
    assert!(bus.master.is_closed());
    assert!(matches!(
        bus.master.echo(0x010).await,
        Err(ProtocolError::TransportClosed)
    ));
    assert_eq!(bus.stats.requests(), 1);
}

#[tokio::test]
async fn transport_without_close_handle_keeps_reading() {
    let (host, dev) = tokio::io::duplex(4096);
    let bus = VirtualBus::new(vec![VirtualModule::cvm24p(0x010, &[1])]);
    tokio::spawn(bus.serve(dev, ProtocolKind::Xc2));
    let (mut transport, _) = Transport::new("virtual", host);

    let request = Frame::command(0x010, ADDR_MASTER, Command::Echo, &[]);
    transport
        .write(&packet::encode(&request).unwrap())
        .await
        .unwrap();
    let bytes = transport
        .read_until(Instant::now() + Duration::from_millis(300), packet::frame_len)
        .await
        .unwrap();
    let (answer, _) = packet::decode(&bytes).unwrap();
    assert_eq!(answer.src, 0x010);
    assert_eq!(answer.data, vec![2]);
    assert!(!transport.is_closed());
}

#[tokio::test]
async fn modbus_envelope_end_to_end() {
    let mut module = VirtualModule::cvm24p(0x010, &[0xAB]);
    module.corrupt_replies = 1;
    let bus = start(vec![module], ProtocolKind::Modbus);

    assert_eq!(bus.master.protocol(), ProtocolKind::Modbus);
    assert_eq!(bus.master.echo(0x010).await.unwrap(), 2);
    assert_eq!(bus.stats.requests(), 2);

    let mut book = AddressBook::new();
    let config = common::discovery();
    let found = bus
        .master
        .broadcast_echo(config.timeout, config.quiet_period, &mut book)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].serial, "ab");
}
