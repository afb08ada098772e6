//! Ripeline relay
//!
//! Subscribes to the classification topic and hands every event to the
//! backend persistence API. Each message is decoded, forwarded once, and
//! the outcome logged:
//!
//! | Outcome                  | Counted as           | Effect                  |
//! |--------------------------|----------------------|-------------------------|
//! | `201 Created`            | `forwarded`          | backend message logged  |
//! | any other status         | `api_errors`         | dropped                 |
//! | timeout / refused / I/O  | `transport_failures` | dropped                 |
//! | payload does not decode  | `decode_failures`    | dropped, never forwarded |
//!
//! Forwarding is awaited inside the message handler, so events reach the
//! backend in broker order and a slow backend delays the next message.

#![deny(unsafe_code)]

pub mod cli;

use std::time::Duration;

use ripeline_connectors::mqtt::{AsyncSessionHandler, EventSource};
use ripeline_connectors::{ForwardError, ForwardReceipt, Forwarder};
use ripeline_core::{ClassificationEvent, DecodeError};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet};
use thiserror::Error;

pub use cli::RelayArgs;

/// Why a single message did not reach the backend
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Per-message counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub forwarded: u64,
    pub decode_failures: u64,
    pub api_errors: u64,
    pub transport_failures: u64,
}

/// Session handler that forwards each decoded event to the backend
pub struct RelayHandler<F: Forwarder> {
    topic: String,
    forwarder: F,
    stats: RelayStats,
}

impl<F: Forwarder> RelayHandler<F> {
    pub fn new(topic: impl Into<String>, forwarder: F) -> Self {
        Self {
            topic: topic.into(),
            forwarder,
            stats: RelayStats::default(),
        }
    }

    /// Decode one payload and forward it
    pub async fn relay(&mut self, payload: &[u8]) -> Result<ForwardReceipt, RelayError> {
        self.stats.received += 1;

        let event = match ClassificationEvent::from_json(payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures += 1;
                return Err(e.into());
            }
        };
        log::info!(
            "received {}: {} ({:.2}%)",
            event.event_id,
            event.class_name,
            event.confidence * 100.0
        );

        match self.forwarder.forward(&event).await {
            Ok(receipt) => {
                self.stats.forwarded += 1;
                Ok(receipt)
            }
            Err(e) => {
                match e {
                    ForwardError::UnexpectedStatus { .. } => self.stats.api_errors += 1,
                    _ => self.stats.transport_failures += 1,
                }
                Err(e.into())
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }
}

#[async_trait::async_trait]
impl<F: Forwarder> AsyncSessionHandler for RelayHandler<F> {
    fn on_connect(&mut self, reconnected: bool) -> Vec<String> {
        if reconnected {
            log::info!("resubscribing to {}", self.topic);
        } else {
            log::info!("listening for classifications on {}", self.topic);
        }
        vec![self.topic.clone()]
    }

    fn on_disconnect(&mut self, reason: &str) {
        log::warn!("relay lost the broker ({reason}), waiting for reconnect");
    }

    async fn on_message(&mut self, topic: &str, payload: &[u8]) {
        match self.relay(payload).await {
            Ok(receipt) => log::info!(
                "saved to backend: {}",
                receipt.message.as_deref().unwrap_or("OK")
            ),
            Err(RelayError::Decode(e)) => {
                log::warn!("dropping malformed message on {topic} ({} bytes): {e}", payload.len())
            }
            Err(RelayError::Forward(ForwardError::UnexpectedStatus { status, body })) => {
                log::error!("API error ({status}): {body}")
            }
            Err(RelayError::Forward(e)) => log::error!("forward failed, event dropped: {e}"),
        }
    }
}

/// Startup failures while waiting for the broker
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no answer from broker within {0:?}")]
    Timeout(Duration),

    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("broker connection failed: {0}")]
    Connection(#[from] ConnectionError),
}

/// Event source whose first notification was already consumed at startup
pub struct Primed<E> {
    first: Option<Event>,
    inner: E,
}

impl<E: EventSource> Primed<E> {
    /// Poll until the broker answers the first connect, then hand the
    /// source back with that answer queued for replay
    pub async fn connect(mut source: E, timeout: Duration) -> Result<Self, StartupError> {
        let first = tokio::time::timeout(timeout, source.next_event())
            .await
            .map_err(|_| StartupError::Timeout(timeout))??;

        if let Event::Incoming(Packet::ConnAck(ack)) = &first {
            if ack.code != ConnectReturnCode::Success {
                return Err(StartupError::Refused(ack.code));
            }
        }
        Ok(Self {
            first: Some(first),
            inner: source,
        })
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

#[async_trait::async_trait]
impl<E: EventSource> EventSource for Primed<E> {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        match self.first.take() {
            Some(event) => Ok(event),
            None => self.inner.next_event().await,
        }
    }
}
