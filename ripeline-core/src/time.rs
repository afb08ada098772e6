//! Time sources for event stamping
//!
//! Classification events carry a UTC capture time that must never run
//! backwards for a given device, even when the wall clock is stepped by NTP
//! after the edge device boots without network. The clock abstraction keeps
//! that rule out of the orchestration loop:
//!
//! - [`SystemTime`] reads the host wall clock
//! - [`FixedTime`] is a settable clock for tests
//! - [`MonotonicStamp`] wraps any source and clamps readings so they are
//!   non-decreasing

use chrono::{DateTime, Utc};

/// Timestamp used on every classification event
pub type Timestamp = DateTime<Utc>;

/// Source of wall clock time
pub trait TimeSource {
    /// Current UTC time
    fn now(&self) -> Timestamp;
}

/// Host wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Fixed time source for testing
#[derive(Debug, Clone)]
pub struct FixedTime {
    timestamp: Timestamp,
}

impl FixedTime {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// Fixed clock at a unix timestamp in seconds
    pub fn at_unix(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    pub fn advance_ms(&mut self, ms: i64) {
        self.timestamp += chrono::Duration::milliseconds(ms);
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> Timestamp {
        self.timestamp
    }
}

/// Clamps a time source so successive stamps never decrease
///
/// When the underlying clock steps backwards the last issued stamp is
/// repeated until the clock catches up again.
#[derive(Debug, Clone)]
pub struct MonotonicStamp<T: TimeSource> {
    source: T,
    last_issued: Option<Timestamp>,
}

impl<T: TimeSource> MonotonicStamp<T> {
    pub fn new(source: T) -> Self {
        Self {
            source,
            last_issued: None,
        }
    }

    /// Next stamp, never earlier than the previous one
    pub fn stamp(&mut self) -> Timestamp {
        let current = self.source.now();
        let stamp = match self.last_issued {
            Some(last) if current < last => {
                log::warn!("clock stepped backwards by {}ms, holding last stamp", (last - current).num_milliseconds());
                last
            }
            _ => current,
        };
        self.last_issued = Some(stamp);
        stamp
    }

    pub fn source(&self) -> &T {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut T {
        &mut self.source
    }
}
