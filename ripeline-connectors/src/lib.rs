//! Protocol connectors for the Ripeline pipeline
//!
//! ## Overview
//!
//! Ripeline has three links to the outside world, one module each:
//!
//! | Module     | Peer                     | Direction            | Crate      |
//! |------------|--------------------------|----------------------|------------|
//! | [`mqtt`]   | message broker           | edge out, relay in   | `rumqttc`  |
//! | [`http`]   | backend persistence API  | relay out            | `ureq`     |
//! | [`serial`] | sensor / actuator board  | both, line-delimited | `serialport` |
//!
//! ## Delivery Semantics
//!
//! Every link is best effort with a single attempt per event:
//!
//! - **MQTT publish** succeeds once the broker acknowledges the message
//!   (QoS 1 `PubAck`) within the publish timeout. A failed publish is
//!   reported, never retried.
//! - **HTTP forward** succeeds on `201 Created` only. Any other status,
//!   a timeout or a refused connection drops the event.
//! - **Serial** lines that do not parse are logged and skipped.
//!
//! Connection maintenance (reconnect, resubscribe) happens in the broker
//! session driver, not per publish. See [`mqtt::SessionState`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ripeline_connectors::http::HttpForwarder;
//! use ripeline_core::config::{BrokerConfig, RelayConfig};
//!
//! let config = RelayConfig::new(BrokerConfig::new("localhost"), "http://localhost:8000/api/tomatoes");
//! let forwarder = HttpForwarder::from_config(&config)?;
//! assert!(forwarder.endpoint().ends_with("/tomatoes"));
//! # Ok::<(), ripeline_connectors::http::ForwardError>(())
//! ```

#![deny(unsafe_code)]

pub mod http;
pub mod mqtt;
pub mod serial;

// Re-export common types
pub use http::{ForwardError, ForwardReceipt, HttpForwarder};
pub use mqtt::{MqttPublisher, PublishError, SessionEvent, SessionState};
pub use serial::{Actuator, LineActuator, LineTrigger, SerialError, Trigger, TriggerSource};

use ripeline_core::ClassificationEvent;

/// Delivers decoded events to the system of record
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward one event; resolves once the backend answered or the attempt failed
    async fn forward(&self, event: &ClassificationEvent) -> Result<ForwardReceipt, ForwardError>;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;
}

/// Connection statistics common to all connectors
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total messages sent successfully
    pub messages_sent: u64,
    /// Total messages failed to send
    pub messages_failed: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ConnectionStats {
    pub(crate) fn record_success(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_failure(&mut self, error: impl ToString) {
        self.messages_failed += 1;
        self.last_error = Some(error.to_string());
    }
}
