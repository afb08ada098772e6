//! Core types for Ripeline
//!
//! Ripeline turns an object passing an infrared gate into a classified,
//! persisted record and a sorting action:
//!
//! ```text
//! IR trigger ─▶ camera ─▶ classifier ─┬─▶ actuator (servo)
//!                                     └─▶ MQTT ─▶ relay ─▶ backend API
//! ```
//!
//! This crate holds what every stage agrees on: the [`ClassificationEvent`]
//! record, the class and actuation tables, configuration, the error
//! taxonomy and the clock abstraction. It performs no I/O.

#![deny(unsafe_code)]

pub mod classes;
pub mod config;
pub mod errors;
pub mod event;
pub mod init;
pub mod time;

// Public API
pub use classes::{ActuationMap, ActuatorCommand, ClassTable, UNKNOWN_CLASS};
pub use errors::{ConfigError, DecodeError, InitError};
pub use event::{ClassificationEvent, EventFactory};
pub use init::InitOutcome;
pub use time::{TimeSource, Timestamp};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
