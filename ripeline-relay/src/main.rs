use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ripeline_connectors::mqtt::{self, SessionState};
use ripeline_connectors::{Forwarder, HttpForwarder};
use ripeline_relay::{Primed, RelayArgs, RelayHandler};

/// How long startup waits for the first broker ConnAck
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayArgs::parse().into_config().context("invalid configuration")?;
    let forwarder = HttpForwarder::from_config(&config)?;

    log::info!("connecting to MQTT broker {}:{}", config.broker.host, config.broker.port);
    let (client, eventloop) = mqtt::connect_async(&config.broker);
    let mut source = Primed::connect(eventloop, CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("could not connect to MQTT broker at {}:{}", config.broker.host, config.broker.port))?;

    log::info!("relaying {} to {}", config.broker.topic, forwarder.endpoint());
    let mut handler = RelayHandler::new(config.broker.topic.clone(), forwarder);
    let mut session = SessionState::new();
    mqtt::drive_async(
        &mut source,
        &mut session,
        &mut handler,
        &client,
        config.broker.reconnect_delay,
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        },
    )
    .await;

    if let Err(e) = client.disconnect().await {
        log::warn!("broker disconnect failed: {e}");
    }

    let stats = handler.stats();
    let http = handler.forwarder().stats();
    log::info!(
        "stopped after {} messages: {} forwarded, {} malformed, {} API errors, {} transport failures ({} bytes sent)",
        stats.received,
        stats.forwarded,
        stats.decode_failures,
        stats.api_errors,
        stats.transport_failures,
        http.bytes_sent
    );
    Ok(())
}
