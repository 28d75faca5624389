use anyhow::Context;
use dcsystem_aggregator::{dc_system_device, Config, DcSystemDevice, DcSystemEngine, EventFeed};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting DC system aggregator");
    let config = Config::from_env()?;
    config.log_summary();

    let (device, publication_sender) = DcSystemDevice::new();
    let (event_sender, event_receiver) = mpsc::channel(128);

    let feed_listener = TcpListener::bind(config.feed_addr)
        .await
        .with_context(|| format!("Cannot bind event feed on {}", config.feed_addr))?;
    EventFeed::new(feed_listener, event_sender).spawn();

    let engine = DcSystemEngine::new(&config, Instant::now());
    let engine_config = config.clone();
    tokio::spawn(async move {
        engine
            .run(&engine_config, event_receiver, publication_sender)
            .await;
    });

    let device_listener = TcpListener::bind(config.modbus_addr)
        .await
        .with_context(|| format!("Cannot bind Modbus device on {}", config.modbus_addr))?;
    dc_system_device::serve(device_listener, device).await
}
