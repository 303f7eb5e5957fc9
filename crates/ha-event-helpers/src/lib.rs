//! Tracking helpers for the Home Assistant reactive core
//!
//! Everything here is built from event bus listeners and scheduler timers:
//!
//! - state change filters (`track_state_change`, domain added/removed)
//! - [`TemplateTracker`], which re-renders a template when the state it
//!   read changes and swaps its listeners to follow the new dependencies
//! - [`Debouncer`], which requires a condition to hold for a duration
//! - entity registry update filtering
//! - the [`HomeAssistant`] facade tying the components together

mod error;
mod hass;
mod registry;
mod same_state;
mod state_change;
mod template;

pub use error::{HassError, HassResult};
pub use hass::HomeAssistant;
pub use registry::track_entity_registry_updated_event;
pub use same_state::{Debouncer, SameStateCondition};
pub use state_change::{
    track_state_added_to_domain, track_state_change, track_state_change_event,
    track_state_removed_domain, EntityFilter, StateMatch,
};
pub use template::{
    result_as_boolean, track_template_condition, ListenerKey, TemplateOutcome,
    TemplateResultCallback, TemplateTracker,
};
