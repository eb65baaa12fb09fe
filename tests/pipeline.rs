#![cfg(feature = "emul")]

use futures::future::join_all;
use globalcache_bridge::{
    command::{code, Address, ChannelClass, CommandDescriptor, ParsedReply, Relay, RequestEnvelope},
    config::Config,
    emulator::Emulator,
    link,
    status::{StatusDetail, ThingStatus},
    thing::{self, CodeError, Command, Thing},
};
use std::{fs, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{sleep, timeout},
};

fn config(model: &str, top: &str, tables: &str) -> Config {
    Config::parse(&format!(
        r#"
id = "gc"
host = "emulator"
model = "{}"
poll_interval_ms = 0
{}

[link]
reply_timeout_ms = 200
command_timeout_ms = 1000
reconnect_backoff_ms = 100

{}
"#,
        model, top, tables
    ))
    .unwrap()
}

const RELAYS: &str = r#"
[[channels]]
id = "relay"
type = "cc"
module = "1"
connector = "3"
"#;

fn addr(m: u8, c: u8) -> Address {
    Address::new(m, c).unwrap()
}

async fn wait_for(thing: &Thing, f: impl Fn(&ThingStatus) -> bool) {
    let mut rx = thing.status().watch();
    timeout(Duration::from_secs(3), async {
        while !f(&*rx.borrow_and_update()) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("status did not change in time");
}

async fn wait_relay(rx: &mut watch::Receiver<Option<Relay>>, want: Relay) {
    timeout(Duration::from_secs(1), async {
        while *rx.borrow_and_update() != Some(want) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("relay did not change in time");
}

async fn start_online(config: &Config, emu: &Emulator) -> Arc<Thing> {
    let thing = Thing::start(config, emu.connector()).unwrap();
    wait_for(&thing, ThingStatus::is_online).await;
    thing
}

#[tokio::test]
async fn get_state_reports_off() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", RELAYS), &emu).await;

    let parsed = thing.execute(CommandDescriptor::get_state(&addr(1, 3))).await.unwrap();
    assert!(!parsed.fallback);
    assert_eq!(
        parsed.reply,
        ParsedReply::State {
            module: "1".into(),
            connector: "3".into(),
            state: Relay::Off,
        }
    );

    thing.handle_command("relay", Command::Refresh).await.unwrap();
    assert_eq!(thing.relay("relay").unwrap().get(), Some(Relay::Off));
    thing.stop().await;
}

#[tokio::test]
async fn set_state_updates_relay() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", RELAYS), &emu).await;

    thing.handle_command("relay", "on".parse().unwrap()).await.unwrap();
    assert_eq!(emu.relay(&addr(1, 3)), Some(true));
    assert_eq!(thing.relay("relay").unwrap().get(), Some(Relay::On));

    let err = thing.handle_command("relay", Command::Text("BLINK".into())).await;
    assert!(matches!(err, Err(thing::Error::Unsupported { .. })));
    let err = thing.handle_command("nope", Command::On).await;
    assert!(matches!(err, Err(thing::Error::UnknownChannel(..))));
    thing.stop().await;
}

#[tokio::test]
async fn device_errors_are_reported() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;

    let err = thing.execute(CommandDescriptor::get_state(&addr(1, 9))).await;
    match err {
        Err(thing::Error::Device { code, message }) => {
            assert_eq!(code, 3);
            assert_eq!(message, "Invalid connector address");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(thing.status().is_online());
    thing.stop().await;
}

#[tokio::test]
async fn version_and_devices() {
    let emu = Emulator::new("710-2000-15").with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;

    let parsed = thing.execute(CommandDescriptor::get_version()).await.unwrap();
    assert_eq!(parsed.reply, ParsedReply::Version("710-2000-15".into()));

    let parsed = thing.execute(CommandDescriptor::get_devices()).await.unwrap();
    assert_eq!(
        parsed.reply,
        ParsedReply::Devices(vec!["device,0,0 ETHERNET".into(), "device,1,3 RELAY".into()])
    );
    thing.stop().await;
}

#[tokio::test]
async fn send_ir_returns_counter() {
    let emu = Emulator::default();
    let thing = start_online(&config("itach-ir", "", ""), &emu).await;

    let parsed = thing
        .execute(CommandDescriptor::send_ir(&addr(1, 1), 42, "38000,1,1,343,171,21,21"))
        .await
        .unwrap();
    assert_eq!(
        parsed.reply,
        ParsedReply::Ir {
            module: "1".into(),
            connector: "1".into(),
            receive_counter: "42".into(),
        }
    );
    thing.stop().await;
}

#[tokio::test]
async fn ir_channel_uses_map_file() {
    let path = std::env::temp_dir().join(format!("gc-bridge-{}.map", std::process::id()));
    fs::write(&path, "POWER=38000,1,1,343,171,21,21\nMUTE=0000 006D 0002 0000 0157 00AC 0015 0016\n")
        .unwrap();
    let top = format!("map_file = {:?}", path.display().to_string());
    let tables = "[[channels]]\nid = \"tv\"\ntype = \"ir\"\nmodule = \"1\"\nconnector = \"2\"\n";
    let emu = Emulator::default();
    let thing = start_online(&config("itach-ir", &top, tables), &emu).await;

    thing.handle_command("tv", "POWER".parse().unwrap()).await.unwrap();
    thing.handle_command("tv", "MUTE".parse().unwrap()).await.unwrap();
    let err = thing.handle_command("tv", "VOL+".parse().unwrap()).await;
    assert!(matches!(err, Err(thing::Error::Code(CodeError::Missing(..)))));

    let commands = emu.commands();
    assert_eq!(
        &commands[commands.len() - 2..],
        [
            "sendir,1:2,1,38000,1,1,343,171,21,21".to_string(),
            "sendir,1:2,2,38028,1,5,343,172,21,22".to_string(),
        ]
    );
    thing.stop().await;
    let _ = fs::remove_file(path);
}

#[tokio::test]
async fn requests_are_answered_in_order() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;
    let before = emu.commands().len();

    let addrs = (0..12).map(|i| addr(1, i % 3 + 1)).collect::<Vec<_>>();
    let results = join_all(
        addrs
            .iter()
            .map(|a| thing.execute(CommandDescriptor::get_state(a))),
    )
    .await;
    for (a, res) in addrs.iter().zip(results) {
        match res.unwrap().reply {
            ParsedReply::State { connector, .. } => assert_eq!(connector, a.connector().to_string()),
            other => panic!("unexpected {:?}", other),
        }
    }
    let sent = emu.commands()[before..].to_vec();
    let expected = addrs.iter().map(|a| format!("getstate,{}", a)).collect::<Vec<_>>();
    assert_eq!(sent, expected);
    thing.stop().await;
}

#[tokio::test]
async fn hang_up_fails_queued_requests() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;
    let mut events = thing.status().subscribe();

    emu.set_refuse(true);
    emu.hang_up();
    let (first, first_reply) = RequestEnvelope::new(CommandDescriptor::get_state(&addr(1, 1)));
    let (second, second_reply) = RequestEnvelope::new(CommandDescriptor::get_state(&addr(1, 2)));
    thing.link().enqueue(first).unwrap();
    thing.link().enqueue(second).unwrap();

    let first = timeout(Duration::from_secs(2), first_reply).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), second_reply).await.unwrap().unwrap();
    assert!(first.is_failure());
    assert_eq!(first.error_code(), Some(code::IO));
    assert!(second.is_failure());
    assert_eq!(second.error_code(), Some(code::NOT_CONNECTED));

    // Let a few reconnect attempts fail.
    sleep(Duration::from_millis(350)).await;
    let mut offline = 0;
    while let Ok(status) = events.try_recv() {
        if status.is_offline() {
            assert_eq!(status.detail(), StatusDetail::CommunicationError);
            offline += 1;
        }
    }
    assert_eq!(offline, 1);

    let err = thing.handle_command("relay", Command::On).await;
    assert!(matches!(err, Err(thing::Error::Offline)));
    thing.stop().await;
}

#[tokio::test]
async fn reconnects_after_hang_up() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", RELAYS), &emu).await;

    emu.hang_up();
    let res = thing.execute(CommandDescriptor::get_state(&addr(1, 3))).await;
    assert!(matches!(res, Err(thing::Error::Communication(link::Error::Failed { .. }))));
    wait_for(&thing, ThingStatus::is_offline).await;
    wait_for(&thing, ThingStatus::is_online).await;
    assert_eq!(emu.connections(), 2);

    thing.handle_command("relay", Command::On).await.unwrap();
    assert_eq!(emu.relay(&addr(1, 3)), Some(true));
    thing.stop().await;
}

#[tokio::test]
async fn silent_device_times_out() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;

    emu.set_silent(true);
    emu.set_refuse(true);
    let res = thing.execute(CommandDescriptor::get_state(&addr(1, 1))).await;
    match res {
        Err(thing::Error::Communication(link::Error::Failed { code: c, .. })) => {
            assert_eq!(c, code::TIMEOUT)
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_for(&thing, |s| {
        matches!(
            s,
            ThingStatus::Offline {
                detail: StatusDetail::CommunicationError,
                ..
            }
        )
    })
    .await;
    thing.stop().await;
}

#[tokio::test]
async fn refused_connection_gates_commands() {
    let emu = Emulator::default().with_relays(1, 3);
    emu.set_refuse(true);
    let thing = Thing::start(&config("itach-cc", "", RELAYS), emu.connector()).unwrap();
    wait_for(&thing, ThingStatus::is_offline).await;

    let err = thing.handle_command("relay", Command::On).await;
    assert!(matches!(err, Err(thing::Error::Offline)));
    assert_eq!(emu.connections(), 0);

    emu.set_refuse(false);
    wait_for(&thing, ThingStatus::is_online).await;
    thing.handle_command("relay", Command::On).await.unwrap();
    thing.stop().await;
}

#[tokio::test]
async fn stopped_thing_rejects_requests() {
    let emu = Emulator::default().with_relays(1, 3);
    let thing = start_online(&config("itach-cc", "", ""), &emu).await;

    thing.stop().await;
    assert!(thing.status().current().is_offline());
    let res = thing.execute(CommandDescriptor::get_version()).await;
    assert!(matches!(res, Err(thing::Error::Communication(link::Error::Stopped))));
}

#[tokio::test]
async fn serial_send_and_feedback() {
    let tables = r#"
[serial1]
two_way = true
end_of_message = "%0D"

[[channels]]
id = "amp"
type = "sl-direct"
module = "1"
connector = "1"
"#;
    let emu = Emulator::default();
    let thing = start_online(&config("itach-sl", "", tables), &emu).await;
    let received = thing.received(ChannelClass::Serial1).unwrap();
    let mut feedback = received.watch();

    thing.handle_command("amp", "PWR+ON%0D".parse().unwrap()).await.unwrap();
    timeout(Duration::from_secs(1), async {
        while emu.serial_received(ChannelClass::Serial1) != b"PWR ON\r" {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert!(emu.serial_send(ChannelClass::Serial1, b"VOL 10\rMUTE"));
    timeout(Duration::from_secs(1), feedback.changed()).await.unwrap().unwrap();
    assert_eq!(received.get().as_deref(), Some("VOL%2010%0D"));
    thing.stop().await;
}

#[tokio::test]
async fn polling_picks_up_relay_changes() {
    let emu = Emulator::default().with_relays(1, 3);
    let mut config = config("itach-cc", "", RELAYS);
    config.poll_interval_ms = 50;
    let thing = start_online(&config, &emu).await;
    let relay = thing.relay("relay").unwrap();
    let mut rx = relay.watch();

    wait_relay(&mut rx, Relay::Off).await;
    emu.set_relay(&addr(1, 3), true);
    wait_relay(&mut rx, Relay::On).await;
    thing.stop().await;
}

#[tokio::test]
async fn caller_timeout_recovers_on_live_link() {
    let emu = Emulator::default()
        .with_relays(1, 3)
        .with_latency(Duration::from_millis(150));
    let mut config = config("itach-cc", "", RELAYS);
    config.link.command_timeout_ms = 300;
    config.link.monitor_interval_ms = 100;
    let thing = start_online(&config, &emu).await;

    let results = join_all(
        (1..=3).map(|c| thing.execute(CommandDescriptor::get_state(&addr(1, c)))),
    )
    .await;
    assert!(results[0].is_ok());
    assert!(matches!(
        results[2],
        Err(thing::Error::Communication(link::Error::Timeout))
    ));

    // The link itself is fine: no reconnect, the Thing comes back by itself.
    wait_for(&thing, ThingStatus::is_online).await;
    assert_eq!(emu.connections(), 1);
    thing.handle_command("relay", Command::On).await.unwrap();
    assert_eq!(emu.relay(&addr(1, 3)), Some(true));
    thing.stop().await;
}

#[tokio::test]
async fn stalled_serial_write_does_not_block_queue() {
    let tables = r#"
[[channels]]
id = "amp"
type = "sl-direct"
module = "1"
connector = "1"
"#;
    let emu = Emulator::default();
    let thing = start_online(&config("itach-sl", "", tables), &emu).await;

    emu.set_serial_stalled(true);
    let payload = "A".repeat(4096);
    let descriptor = CommandDescriptor::send_serial(&addr(1, 1), ChannelClass::Serial1, &payload);
    let (serial, serial_reply) = RequestEnvelope::new(descriptor);
    let (version, version_reply) = RequestEnvelope::new(CommandDescriptor::get_version());
    thing.link().enqueue(serial).unwrap();
    thing.link().enqueue(version).unwrap();

    let serial = timeout(Duration::from_secs(2), serial_reply).await.unwrap().unwrap();
    let version = timeout(Duration::from_secs(2), version_reply).await.unwrap().unwrap();
    assert_eq!(serial.error_code(), Some(code::TIMEOUT));
    assert!(version.is_failure());

    emu.set_serial_stalled(false);
    wait_for(&thing, ThingStatus::is_online).await;
    assert_eq!(emu.connections(), 2);
    thing.stop().await;
}
