//! Classification events
//!
//! ## Overview
//!
//! One [`ClassificationEvent`] is produced per successfully classified
//! trigger. It is immutable once built and has exactly two consumers:
//!
//! ```text
//!                      ┌──▶ ActuationMap ──▶ actuator serial line
//! classifier ──▶ Event ┤
//!                      └──▶ JSON ──▶ broker ──▶ relay ──▶ backend API
//! ```
//!
//! ## Wire Format
//!
//! The JSON form keeps the field names the deployed backend already stores:
//!
//! ```json
//! {"tomato_id":"tm_1735732800_007","device_id":"raspberrypi_01","class":1,
//!  "class_name":"ripe","confidence":0.87,"rasp_timestamp":"2025-01-01T12:00:00Z"}
//! ```
//!
//! Decoding also accepts `event_id`, `class_index` and `captured_at`.

use serde::{Deserialize, Serialize};

use crate::classes::ClassTable;
use crate::errors::DecodeError;
use crate::time::{MonotonicStamp, TimeSource, Timestamp};

/// Unit of record, one per classified trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEvent {
    /// Unique per device: `tm_<unix secs>_<counter>`
    #[serde(rename = "tomato_id", alias = "event_id")]
    pub event_id: String,
    /// Originating edge device
    pub device_id: String,
    #[serde(rename = "class", alias = "class_index")]
    pub class_index: i64,
    pub class_name: String,
    /// Always within `[0.0, 1.0]`
    pub confidence: f64,
    #[serde(rename = "rasp_timestamp", alias = "captured_at")]
    pub captured_at: Timestamp,
}

impl ClassificationEvent {
    /// Serialize to the broker wire form
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a broker payload and check event invariants
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    /// Check the invariants a decoded event must satisfy
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.event_id.is_empty() {
            return Err(DecodeError::Invalid("empty event id".into()));
        }
        if self.device_id.is_empty() {
            return Err(DecodeError::Invalid("empty device id".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(DecodeError::Invalid(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Builds events for one device
///
/// Owns the device identity, the class table and the capture clock, so an
/// event is a pure function of (counter, class, confidence) plus the clock.
pub struct EventFactory<T: TimeSource> {
    device_id: String,
    classes: ClassTable,
    clock: MonotonicStamp<T>,
}

impl<T: TimeSource> EventFactory<T> {
    pub fn new(device_id: impl Into<String>, classes: ClassTable, clock: T) -> Self {
        Self {
            device_id: device_id.into(),
            classes,
            clock: MonotonicStamp::new(clock),
        }
    }

    /// Build the event for the `counter`-th successful classification
    ///
    /// Confidence is clamped into `[0, 1]`; a NaN confidence becomes 0.
    pub fn create(&mut self, counter: u64, class_index: i64, confidence: f64) -> ClassificationEvent {
        let captured_at = self.clock.stamp();
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };

        ClassificationEvent {
            event_id: format!("tm_{}_{:03}", captured_at.timestamp(), counter),
            device_id: self.device_id.clone(),
            class_index,
            class_name: self.classes.name(class_index).to_owned(),
            confidence,
            captured_at,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn clock_mut(&mut self) -> &mut T {
        self.clock.source_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTime;

    fn factory() -> EventFactory<FixedTime> {
        EventFactory::new("raspberrypi_01", ClassTable::default(), FixedTime::at_unix(1_735_732_800))
    }

    #[test]
    fn event_fields() {
        let event = factory().create(7, 1, 0.87);
        assert_eq!(event.event_id, "tm_1735732800_007");
        assert_eq!(event.device_id, "raspberrypi_01");
        assert_eq!(event.class_name, "ripe");
        assert_eq!(event.confidence, 0.87);
    }

    #[test]
    fn out_of_range_class_is_unknown() {
        let event = factory().create(0, 9, 0.5);
        assert_eq!(event.class_index, 9);
        assert_eq!(event.class_name, "unknown");
    }

    #[test]
    fn confidence_is_clamped() {
        let mut factory = factory();
        assert_eq!(factory.create(0, 0, 1.7).confidence, 1.0);
        assert_eq!(factory.create(1, 0, -0.2).confidence, 0.0);
        assert_eq!(factory.create(2, 0, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn wire_field_names() {
        let event = factory().create(1, 1, 0.87);
        let value: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["class"], 1);
        assert_eq!(value["class_name"], "ripe");
        assert_eq!(value["confidence"], 0.87);
        assert_eq!(value["tomato_id"], "tm_1735732800_001");
        assert_eq!(value["rasp_timestamp"], "2025-01-01T12:00:00Z");
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut factory = factory();
        factory.clock_mut().advance_ms(123);
        let event = factory.create(42, 2, 0.123_456_789_012_345_6);

        let decoded = ClassificationEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.event_id.as_bytes(), event.event_id.as_bytes());
        assert_eq!(decoded.confidence, event.confidence);
    }

    #[test]
    fn model_field_names_accepted() {
        let payload = br#"{"event_id":"tm_1_000","device_id":"pi","class_index":0,
            "class_name":"unripe","confidence":0.5,"captured_at":"2025-01-01T12:00:00Z"}"#;
        let event = ClassificationEvent::from_json(payload).unwrap();
        assert_eq!(event.event_id, "tm_1_000");
        assert_eq!(event.class_index, 0);
    }

    #[test]
    fn malformed_payloads_rejected() {
        assert!(matches!(ClassificationEvent::from_json(b"{oops"), Err(DecodeError::Json(_))));
        assert!(matches!(
            ClassificationEvent::from_json(br#"{"tomato_id":"x"}"#),
            Err(DecodeError::Json(_))
        ));

        let bad_confidence = br#"{"tomato_id":"tm_1_000","device_id":"pi","class":0,
            "class_name":"unripe","confidence":3.0,"rasp_timestamp":"2025-01-01T12:00:00Z"}"#;
        assert!(matches!(
            ClassificationEvent::from_json(bad_confidence),
            Err(DecodeError::Invalid(_))
        ));
    }
}
