//! Ripeline edge node
//!
//! Glues the vision and connector crates into the per-trigger loop in
//! [`pipeline`]. The binary adds process wiring: configuration from flags
//! and environment ([`cli`]), hardware bring-up ([`hardware`]), the broker
//! session thread and Ctrl-C handling.

#![deny(unsafe_code)]

pub mod cli;
pub mod hardware;
pub mod pipeline;

pub use cli::EdgeArgs;
pub use pipeline::{Capture, Classify, CycleOutcome, Pipeline, Publish, RunStats, Stage};
