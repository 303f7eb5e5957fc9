//! Jinja2-compatible template rendering for Home Assistant
//!
//! This crate renders templates against the state store with minijinja and
//! reports which state each render read, so trackers can subscribe to
//! exactly the entities and domains a template depends on.
//!
//! # State Access
//!
//! - `states('entity_id')` - Get entity state as string
//! - `states.light.living_room` - Access state object
//! - `states.light` / `states` - Iterate a domain / every state
//! - `is_state('entity_id', 'on')` - Check if entity is in state
//! - `state_attr('entity_id', 'brightness')` - Get attribute value
//! - `has_value('entity_id')` - Check if entity has valid value
//! - `expand('group.downstairs')` - Resolve groups to member states
//!
//! # Example
//!
//! ```ignore
//! use ha_template::{TemplateEngine, Variables};
//!
//! let engine = TemplateEngine::new(state_store);
//! let info = engine.render("{{ states('sensor.temperature') }}", &Variables::new());
//! assert!(info.entities.contains("sensor.temperature"));
//! ```

mod engine;
mod error;
mod filters;
mod globals;
mod render;
mod states;

pub use engine::TemplateEngine;
pub use error::{TemplateError, TemplateResult};
pub use globals::DateTimeValue;
pub use render::{RenderInfo, TemplateRenderer, Variables};
pub use states::{StateAccess, StateWrapper, StatesObject, STATE_UNKNOWN};

// Re-export minijinja Value for convenience
pub use minijinja::Value;
