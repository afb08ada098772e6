//! Class labels and actuation lookup
//!
//! Both tables are keyed by the classifier's class index. Neither lookup can
//! fail: an index the table does not know resolves to the `"unknown"` label
//! and to the reject action respectively, so a model that grows a class the
//! edge configuration has not caught up with still sorts into the reject bin.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Label used for indices outside the configured class set
pub const UNKNOWN_CLASS: &str = "unknown";

/// Smallest servo angle accepted by the actuator firmware
pub const MIN_ANGLE: i32 = 0;

/// Largest servo angle accepted by the actuator firmware
pub const MAX_ANGLE: i32 = 180;

/// Fixed class index to label table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl ClassTable {
    /// Build a table where index `i` maps to `names[i]`
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Label for a class index, `"unknown"` when out of range
    pub fn name(&self, class_index: i64) -> &str {
        usize::try_from(class_index)
            .ok()
            .and_then(|idx| self.names.get(idx))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_CLASS)
    }

    /// Whether the index is in `0..len`
    pub fn contains(&self, class_index: i64) -> bool {
        usize::try_from(class_index).map_or(false, |idx| idx < self.names.len())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new(["unripe", "ripe", "old", "damaged"])
    }
}

/// Command sent to the actuator board, one per classification
///
/// Serialized as the board's line protocol: `{"servo": 1, "angle": 90}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    #[serde(rename = "servo")]
    pub actuator_id: i32,
    #[serde(rename = "angle")]
    pub target_angle: i32,
}

impl ActuatorCommand {
    pub const fn new(actuator_id: i32, target_angle: i32) -> Self {
        Self {
            actuator_id,
            target_angle,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_ANGLE..=MAX_ANGLE).contains(&self.target_angle) {
            return Err(ConfigError::Invalid(format!(
                "servo angle {} outside [{MIN_ANGLE}, {MAX_ANGLE}]",
                self.target_angle
            )));
        }
        Ok(())
    }
}

/// Class index to actuator command table with a reject default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuationMap {
    actions: BTreeMap<i64, ActuatorCommand>,
    reject: ActuatorCommand,
}

impl ActuationMap {
    /// Build a map, rejecting angles the actuator cannot reach
    pub fn new(
        actions: impl IntoIterator<Item = (i64, ActuatorCommand)>,
        reject: ActuatorCommand,
    ) -> Result<Self, ConfigError> {
        let actions: BTreeMap<_, _> = actions.into_iter().collect();
        reject.validate()?;
        for command in actions.values() {
            command.validate()?;
        }
        Ok(Self { actions, reject })
    }

    /// Command for a class, the reject action when unmapped
    pub fn get_servo_action(&self, class_index: i64) -> ActuatorCommand {
        self.actions
            .get(&class_index)
            .copied()
            .unwrap_or(self.reject)
    }

    pub fn reject(&self) -> ActuatorCommand {
        self.reject
    }
}

impl Default for ActuationMap {
    fn default() -> Self {
        Self {
            actions: BTreeMap::from([
                (0, ActuatorCommand::new(1, 45)),
                (1, ActuatorCommand::new(1, 90)),
                (2, ActuatorCommand::new(1, 135)),
                (3, ActuatorCommand::new(1, 180)),
            ]),
            reject: ActuatorCommand::new(1, 180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_table_names() {
        let table = ClassTable::default();
        assert_eq!(table.name(0), "unripe");
        assert_eq!(table.name(1), "ripe");
        assert_eq!(table.name(3), "damaged");
        assert_eq!(table.name(4), UNKNOWN_CLASS);
        assert_eq!(table.name(-1), UNKNOWN_CLASS);
        assert!(table.contains(2));
        assert!(!table.contains(7));
    }

    #[test]
    fn ripe_goes_to_ninety_degrees() {
        let map = ActuationMap::default();
        assert_eq!(map.get_servo_action(1), ActuatorCommand::new(1, 90));
    }

    #[test]
    fn command_wire_format() {
        let json = serde_json::to_string(&ActuatorCommand::new(1, 90)).unwrap();
        assert_eq!(json, r#"{"servo":1,"angle":90}"#);
    }

    #[test]
    fn unreachable_angle_rejected() {
        let result = ActuationMap::new([(0, ActuatorCommand::new(1, 270))], ActuatorCommand::new(1, 180));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = ActuationMap::new([], ActuatorCommand::new(1, -5));
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn unknown_indices_resolve_to_unknown(idx in prop_oneof![i64::MIN..0i64, 4i64..i64::MAX]) {
            let table = ClassTable::default();
            prop_assert_eq!(table.name(idx), UNKNOWN_CLASS);
        }

        #[test]
        fn unmapped_indices_get_reject_action(idx in prop_oneof![i64::MIN..0i64, 4i64..i64::MAX]) {
            let map = ActuationMap::default();
            prop_assert_eq!(map.get_servo_action(idx), map.reject());
        }
    }
}
