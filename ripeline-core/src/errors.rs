//! Error types shared across the pipeline
//!
//! ## Error Categories
//!
//! Errors split along the line between startup and steady state:
//!
//! ### Startup (fatal)
//! - [`ConfigError`]: a required value is missing or out of range
//! - [`InitError`]: a component could not be brought up (camera, model,
//!   broker, serial link)
//!
//! ### Per event (drop and continue)
//! - [`DecodeError`]: a broker payload is not a valid classification event
//! - component errors defined next to their components (`CaptureError`,
//!   `InferenceError`, `PublishError`, `ForwardError`)
//!
//! Per-event errors never propagate out of the processing loops. The loop
//! logs the failure, drops the event and returns to idle.
//!
//! ```rust
//! use ripeline_core::{ClassificationEvent, DecodeError};
//!
//! match ClassificationEvent::from_json(b"not json") {
//!     Ok(event) => println!("forwarding {}", event.event_id),
//!     Err(DecodeError::Json(e)) => println!("dropping malformed payload: {e}"),
//!     Err(DecodeError::Invalid(reason)) => println!("dropping invalid event: {reason}"),
//! }
//! ```

use thiserror::Error;

/// Configuration problems detected at startup
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required value absent
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// Value present but unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A broker payload that cannot become a [`ClassificationEvent`](crate::ClassificationEvent)
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or JSON of the wrong shape
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed but violates an event invariant
    #[error("invalid event: {0}")]
    Invalid(String),
}

/// A component failed to come up
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{component} failed to initialize: {reason}")]
pub struct InitError {
    pub component: &'static str,
    pub reason: String,
}

impl InitError {
    pub fn new(component: &'static str, reason: impl Into<String>) -> Self {
        Self {
            component,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self {
        Self::new("configuration", e.to_string())
    }
}
