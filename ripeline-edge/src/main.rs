use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use ripeline_connectors::mqtt::{self, SessionState};
use ripeline_connectors::serial;
use ripeline_core::time::SystemTime;
use ripeline_edge::hardware::{list_cameras, open_camera, open_model};
use ripeline_edge::{EdgeArgs, Pipeline, RunStats};
use ripeline_vision::Classifier;

/// How long startup waits for the first broker ConnAck
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EdgeArgs::parse().into_config().context("invalid configuration")?;
    log::info!("starting ripeline edge node {}", config.device_id);

    let shutdown = Arc::new(AtomicBool::new(false));

    log::info!("connecting to MQTT broker {}:{}", config.broker.host, config.broker.port);
    let (publisher, mut link, session_client, mut connection) = mqtt::connect_publisher(&config.broker);
    {
        let shutdown = Arc::clone(&shutdown);
        let reconnect_delay = config.broker.reconnect_delay;
        thread::Builder::new()
            .name("mqtt-session".into())
            .spawn(move || {
                let mut session = SessionState::new();
                mqtt::drive_blocking(
                    connection.iter(),
                    &mut session,
                    &mut link,
                    &session_client,
                    reconnect_delay,
                    &shutdown,
                );
            })
            .context("failed to spawn broker session thread")?;
    }
    if !publisher.wait_connected(CONNECT_TIMEOUT) {
        bail!(
            "could not connect to MQTT broker at {}:{}",
            config.broker.host,
            config.broker.port
        );
    }

    let worker_shutdown = Arc::clone(&shutdown);
    let mut worker = tokio::task::spawn_blocking(move || -> anyhow::Result<RunStats> {
        let (trigger, actuator) = serial::open(&config.serial)?;
        let camera = open_camera(&config.camera).into_result().inspect_err(|_| {
            let found = list_cameras();
            if !found.is_empty() {
                let devices: Vec<String> = found.iter().map(|info| format!("/dev/video{}", info.device)).collect();
                log::info!("cameras present: {}", devices.join(", "));
            }
        })?;
        let model = open_model(&config.model).into_result()?;
        let classifier = Classifier::new(model, config.model.input_size);

        let mut pipeline = Pipeline::new(&config, trigger, camera, classifier, publisher, actuator, SystemTime);
        Ok(pipeline.run(&worker_shutdown))
    });

    let stats = tokio::select! {
        result = &mut worker => result??,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            log::info!("interrupt received, finishing current cycle");
            shutdown.store(true, Ordering::SeqCst);
            worker.await??
        }
    };

    shutdown.store(true, Ordering::SeqCst);
    log::info!(
        "stopped after {} triggers: {} classified, {} dropped, {} published, {} actuated",
        stats.triggers,
        stats.completed,
        stats.dropped,
        stats.published,
        stats.actuated
    );
    log::info!(
        "broker link: {} messages sent, {} failed, {} bytes, {} reconnections",
        stats.link.messages_sent,
        stats.link.messages_failed,
        stats.link.bytes_sent,
        stats.link.reconnections
    );
    if let Some(error) = &stats.link.last_error {
        log::info!("last broker error: {error}");
    }
    Ok(())
}
