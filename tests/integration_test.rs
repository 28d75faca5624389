use std::{net::SocketAddr, time::Duration, time::Instant};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_modbus::prelude::*;

use dcsystem_aggregator::{
    dc_system_device::{
        self, decode_f32, REG_CONTRIBUTING_PEERS, REG_POWER, REG_PUBLICATION_COUNT,
    },
    Config, DcSystemDevice, DcSystemEngine, EventFeed, NoDataPolicy,
};

/// Starts feed, engine and Modbus device on ephemeral ports.
async fn start_aggregator(config: Config) -> (SocketAddr, SocketAddr) {
    let (device, publication_sender) = DcSystemDevice::new();
    let (event_sender, event_receiver) = mpsc::channel(128);

    let feed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed_addr = feed_listener.local_addr().unwrap();
    EventFeed::new(feed_listener, event_sender).spawn();

    let engine = DcSystemEngine::new(&config, Instant::now());
    tokio::spawn(async move {
        engine
            .run(&config, event_receiver, publication_sender)
            .await;
    });

    let device_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let device_addr = device_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = dc_system_device::serve(device_listener, device).await;
    });

    (feed_addr, device_addr)
}

/// Power, voltage and current as read back from the device; `None` is NaN on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
struct DeviceValues {
    power: Option<f32>,
    voltage: Option<f32>,
    current: Option<f32>,
    contributing_peers: u16,
    publications: u16,
}

async fn read_device(
    device_addr: SocketAddr,
) -> Result<DeviceValues, Box<dyn std::error::Error>> {
    let mut ctx = tcp::connect(device_addr).await?;
    let triple = ctx.read_holding_registers(REG_POWER, 6).await??;
    let counters = ctx
        .read_holding_registers(REG_CONTRIBUTING_PEERS, 2)
        .await??;
    assert_eq!(REG_PUBLICATION_COUNT, REG_CONTRIBUTING_PEERS + 1);

    Ok(DeviceValues {
        power: decode_f32(triple[0], triple[1]),
        voltage: decode_f32(triple[2], triple[3]),
        current: decode_f32(triple[4], triple[5]),
        contributing_peers: counters[0],
        publications: counters[1],
    })
}

/// Polls the device until `check` holds, panicking after a few seconds.
async fn wait_for(
    device_addr: SocketAddr,
    what: &str,
    check: impl Fn(&DeviceValues) -> bool,
) -> DeviceValues {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let values = timeout(Duration::from_secs(2), read_device(device_addr))
            .await
            .expect("Timeout waiting for Modbus response")
            .expect("Failed to read from DC system device");
        if check(&values) {
            return values;
        }
        assert!(
            Instant::now() < deadline,
            "Gave up waiting for {what}, device shows {values:?}"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

fn close(actual: Option<f32>, expected: f32) -> bool {
    actual.is_some_and(|value| (value - expected).abs() < 0.01)
}

async fn send_lines(feed: &mut TcpStream, lines: &[&str]) {
    for line in lines {
        feed.write_all(line.as_bytes()).await.unwrap();
        feed.write_all(b"\n").await.unwrap();
    }
    feed.flush().await.unwrap();
}

const SCENARIO_A: &[&str] = &[
    r#"{"event":"discovered","id":":1.10","service":"com.victronenergy.alternator.ttyS5"}"#,
    r#"{"event":"discovered","id":":1.11","service":"com.victronenergy.dcload.fridge"}"#,
    r#"{"event":"changed","id":":1.10","path":"/Dc/0/Power","value":500.0}"#,
    r#"{"event":"changed","id":":1.10","path":"/Dc/0/Voltage","value":48.0}"#,
    r#"{"event":"changed","id":":1.11","path":"/Dc/0/Power","value":200.0}"#,
];

#[tokio::test]
async fn test_end_to_end_scenarios() {
    let config = Config {
        freshness_window: Duration::from_secs(60),
        sweep_interval: Duration::from_millis(50),
        ..Config::default()
    };
    let (feed_addr, device_addr) = start_aggregator(config).await;

    // Nothing published yet: every value is invalid, not zero
    let initial = read_device(device_addr).await.unwrap();
    assert_eq!(initial.power, None);
    assert_eq!(initial.current, None);
    assert_eq!(initial.publications, 0);

    let mut feed = TcpStream::connect(feed_addr).await.unwrap();

    // Scenario A: source 500W at 48V, load 200W
    send_lines(&mut feed, SCENARIO_A).await;
    let values = wait_for(device_addr, "scenario A", |v| {
        close(v.power, 300.0) && close(v.current, 6.25)
    })
    .await;
    assert!(close(values.voltage, 48.0));
    assert_eq!(values.contributing_peers, 2);

    // Scenario B: the load disconnects
    send_lines(&mut feed, &[r#"{"event":"lost","id":":1.11"}"#]).await;
    let values = wait_for(device_addr, "scenario B", |v| close(v.power, 500.0)).await;
    assert!(close(values.voltage, 48.0));
    assert!(close(values.current, 10.4167));
    assert_eq!(values.contributing_peers, 1);

    // Scenario C: voltage goes invalid, power stays computable
    send_lines(
        &mut feed,
        &[r#"{"event":"changed","id":":1.10","path":"/Dc/0/Voltage","value":null}"#],
    )
    .await;
    let values = wait_for(device_addr, "scenario C", |v| v.voltage.is_none()).await;
    assert_eq!(values.current, None);
    assert!(close(values.power, 500.0));
}

#[tokio::test]
async fn test_quiet_peer_goes_stale() {
    let config = Config {
        freshness_window: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        max_silence: Duration::from_secs(60),
        ..Config::default()
    };
    let (feed_addr, device_addr) = start_aggregator(config).await;
    let mut feed = TcpStream::connect(feed_addr).await.unwrap();

    send_lines(&mut feed, SCENARIO_A).await;
    wait_for(device_addr, "initial aggregate", |v| close(v.power, 300.0)).await;

    // Keep only the source talking; the load must drop out on its own
    let keep_alive = r#"{"event":"changed","id":":1.10","path":"/Dc/0/Power","value":500.0}"#;
    let started = Instant::now();
    let mut stale = None;
    while started.elapsed() < Duration::from_secs(3) {
        send_lines(&mut feed, &[keep_alive]).await;
        let values = read_device(device_addr).await.unwrap();
        if close(values.power, 500.0) {
            stale = Some(values);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    let values = stale.expect("Load should have gone stale");
    assert_eq!(values.contributing_peers, 1);
}

#[tokio::test]
async fn test_no_data_published_as_invalid() {
    let config = Config {
        freshness_window: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(50),
        no_data: NoDataPolicy::PublishInvalid,
        ..Config::default()
    };
    let (feed_addr, device_addr) = start_aggregator(config).await;

    // The invalid marker goes out on the first sweep
    wait_for(device_addr, "invalid marker", |v| v.publications >= 1).await;

    let mut feed = TcpStream::connect(feed_addr).await.unwrap();
    send_lines(&mut feed, SCENARIO_A).await;
    wait_for(device_addr, "scenario A", |v| close(v.power, 300.0)).await;

    // Everyone goes quiet: power returns to invalid rather than zero
    let values = wait_for(device_addr, "stale invalid marker", |v| v.power.is_none()).await;
    assert_eq!(values.voltage, None);
    assert_eq!(values.current, None);
    assert_eq!(values.contributing_peers, 0);
}
