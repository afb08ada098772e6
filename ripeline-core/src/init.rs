//! Typed startup outcome
//!
//! Camera and model bring-up are eager and blocking. Rather than aborting
//! deep inside a constructor they report an [`InitOutcome`], which the
//! binaries turn into a fatal error and tests can inspect directly.

use crate::errors::InitError;

/// Result of bringing up a long-lived component
#[derive(Debug)]
pub enum InitOutcome<T> {
    /// Component is usable
    Ready(T),
    /// Component could not be initialized; it must not be used
    FailedToInit(InitError),
}

impl<T> InitOutcome<T> {
    pub fn failed(component: &'static str, reason: impl Into<String>) -> Self {
        Self::FailedToInit(InitError::new(component, reason))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_result(self) -> Result<T, InitError> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::FailedToInit(e) => Err(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> InitOutcome<U> {
        match self {
            Self::Ready(value) => InitOutcome::Ready(f(value)),
            Self::FailedToInit(e) => InitOutcome::FailedToInit(e),
        }
    }
}

impl<T, E: std::fmt::Display> From<(&'static str, Result<T, E>)> for InitOutcome<T> {
    fn from((component, result): (&'static str, Result<T, E>)) -> Self {
        match result {
            Ok(value) => Self::Ready(value),
            Err(e) => Self::failed(component, e.to_string()),
        }
    }
}
