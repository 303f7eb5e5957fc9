//! Core types for the Home Assistant reactive core
//!
//! This crate provides the fundamental types shared by the event bus, the
//! state store, the scheduler and the trackers built on top of them:
//! EntityId, State, Event, the injectable Clock and the CancelHandle token
//! returned by every subscription.

mod cancel;
mod clock;
mod entity_id;
mod event;
mod state;

pub use cancel::CancelHandle;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::{Attributes, State};

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// Matches every event type / every entity
pub const MATCH_ALL: &str = "*";

/// Standard event types fired by the core
pub mod events {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for the scheduler's clock signal
    pub const TIME_CHANGED: &str = "time_changed";

    /// Event type for core config (location, time zone) updates
    pub const CORE_CONFIG_UPDATE: &str = "core_config_updated";

    /// Event type for entity registry changes
    pub const ENTITY_REGISTRY_UPDATED: &str = "entity_registry_updated";

    /// Data for STATE_CHANGED events
    ///
    /// `old_state` is `None` when the entity was created, `new_state` is
    /// `None` when it was removed. Both are never `None` at once.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for TIME_CHANGED events
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimeChangedData {
        pub now: DateTime<Utc>,
        /// Replay every time pattern match crossed by this tick
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pub fire_all: bool,
    }

    impl EventData for TimeChangedData {
        fn event_type() -> &'static str {
            TIME_CHANGED
        }
    }

    /// Data for CORE_CONFIG_UPDATE events
    ///
    /// Only the fields that changed are present.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct CoreConfigUpdateData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub latitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub longitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub elevation: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub time_zone: Option<String>,
    }

    impl EventData for CoreConfigUpdateData {
        fn event_type() -> &'static str {
            CORE_CONFIG_UPDATE
        }
    }

    /// Action carried by an entity registry update
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RegistryAction {
        Create,
        Update,
        Remove,
    }

    /// Data for ENTITY_REGISTRY_UPDATED events
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EntityRegistryUpdatedData {
        pub action: RegistryAction,
        pub entity_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub old_entity_id: Option<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub changes: Option<serde_json::Map<String, serde_json::Value>>,
    }

    impl EventData for EntityRegistryUpdatedData {
        fn event_type() -> &'static str {
            ENTITY_REGISTRY_UPDATED
        }
    }
}
