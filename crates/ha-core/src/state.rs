//! State type representing an entity's current state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// State attributes keyed by attribute name
pub type Attributes = HashMap<String, serde_json::Value>;

/// Represents the state of an entity at a point in time
///
/// A State is an immutable snapshot: the store hands out clones and never a
/// reference into its table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: Attributes,

    /// When the state value last differed from its predecessor
    pub last_changed: DateTime<Utc>,

    /// When the state was last written (value or attributes)
    pub last_updated: DateTime<Utc>,
}

impl State {
    /// Create a fresh state stamped at `now`
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// Create an updated state, preserving last_changed if the value is the same
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Self {
        let new_state = new_state.into();
        let value_changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed: if value_changed {
                now
            } else {
                self.last_changed
            },
            last_updated: now,
        }
    }

    /// Whether writing `state`/`attributes` over this snapshot would change nothing
    pub fn is_same(&self, state: &str, attributes: &Attributes) -> bool {
        self.state == state && &self.attributes == attributes
    }

    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn object_id(&self) -> &str {
        self.entity_id.object_id()
    }

    /// Check if the state value represents an unavailable entity
    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable"
    }

    /// Check if the state value represents an unknown state
    pub fn is_unknown(&self) -> bool {
        self.state == "unknown"
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_attribute_only_update_keeps_last_changed() {
        let id: EntityId = "light.bowl".parse().unwrap();
        let state = State::new(id, "off", Attributes::new(), t0());

        let later = t0() + Duration::seconds(30);
        let updated = state.with_update(
            "off",
            Attributes::from([("some_attr".to_string(), json!(1))]),
            later,
        );

        assert_eq!(updated.last_changed, t0());
        assert_eq!(updated.last_updated, later);
    }

    #[test]
    fn test_value_update_moves_last_changed() {
        let id: EntityId = "light.bowl".parse().unwrap();
        let state = State::new(id, "off", Attributes::new(), t0());

        let later = t0() + Duration::seconds(30);
        let updated = state.with_update("on", Attributes::new(), later);

        assert_eq!(updated.last_changed, later);
        assert_eq!(updated.last_updated, later);
    }

    #[test]
    fn test_is_same_compares_attributes_deeply() {
        let id: EntityId = "sensor.temp".parse().unwrap();
        let attrs = Attributes::from([("nested".to_string(), json!({"a": [1, 2]}))]);
        let state = State::new(id, "21", attrs.clone(), t0());

        assert!(state.is_same("21", &attrs));
        assert!(!state.is_same("21", &Attributes::new()));
        assert!(!state.is_same("22", &attrs));
    }

    #[test]
    fn test_serde_roundtrip_preserves_timestamps() {
        let id: EntityId = "switch.kitchen".parse().unwrap();
        let state = State::new(id, "on", Attributes::new(), t0());

        let value = serde_json::to_value(&state).unwrap();
        let back: State = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.last_updated, state.last_updated);
    }
}
