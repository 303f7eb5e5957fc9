//! States object for accessing entity states in templates
//!
//! Every render gets its own [`StatesObject`]. Besides exposing the state
//! store it records what the template read:
//! - `states('light.bowl')`, `states.light.bowl`, `is_state(...)` and the
//!   other lookups record the entity
//! - iterating `states.light` records the whole domain
//! - iterating `states` records every state

use chrono::{DateTime, Utc};
use ha_core::State;
use ha_state_store::StateStore;
use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

/// State reported for an entity that does not exist
pub const STATE_UNKNOWN: &str = "unknown";

/// Groups nested deeper than this are not expanded further
const MAX_EXPAND_DEPTH: usize = 16;

/// What one render read
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateAccess {
    pub entities: BTreeSet<String>,
    pub domains: BTreeSet<String>,
    pub all_states: bool,
}

/// The states object exposed to templates
///
/// Allows access to entity states via:
/// - `states('entity_id')` - Get state value as string
/// - `states.domain.object_id` - Get full state object
/// - `states.domain` - Iterate a domain's states
/// - `states` - Iterate every state
#[derive(Clone)]
pub struct StatesObject {
    store: Arc<StateStore>,
    access: Arc<Mutex<StateAccess>>,
}

impl fmt::Debug for StatesObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatesObject").finish_non_exhaustive()
    }
}

impl StatesObject {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            access: Arc::new(Mutex::new(StateAccess::default())),
        }
    }

    /// Everything read so far
    pub fn access(&self) -> StateAccess {
        self.access.lock().clone()
    }

    fn record_entity(&self, entity_id: &str) {
        self.access
            .lock()
            .entities
            .insert(entity_id.to_ascii_lowercase());
    }

    fn record_domain(&self, domain: &str) {
        self.access
            .lock()
            .domains
            .insert(domain.to_ascii_lowercase());
    }

    fn record_all(&self) {
        self.access.lock().all_states = true;
    }

    /// Get the full state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.record_entity(entity_id);
        self.store.get(entity_id)
    }

    /// Get the state value, `unknown` when the entity does not exist
    pub fn get_state(&self, entity_id: &str) -> String {
        self.get(entity_id)
            .map(|s| s.state)
            .unwrap_or_else(|| STATE_UNKNOWN.to_string())
    }

    /// Check if entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get(entity_id).is_some_and(|s| s.state == state)
    }

    /// Check if entity is in any of the specified states
    pub fn is_state_any(&self, entity_id: &str, states: &[&str]) -> bool {
        self.get(entity_id)
            .is_some_and(|s| states.iter().any(|candidate| *candidate == s.state))
    }

    /// Get an attribute value
    pub fn state_attr(&self, entity_id: &str, attribute: &str) -> Value {
        self.get(entity_id)
            .and_then(|s| s.attributes.get(attribute).map(Value::from_serialize))
            .unwrap_or(Value::from(()))
    }

    /// Check if entity has a meaningful value (not unknown/unavailable)
    pub fn has_value(&self, entity_id: &str) -> bool {
        self.get(entity_id)
            .is_some_and(|s| !s.is_unavailable() && !s.is_unknown())
    }

    /// All states of a domain, sorted by entity id
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.record_domain(domain);
        self.store.domain_states(domain)
    }

    /// Every state, sorted by entity id
    pub fn all_states(&self) -> Vec<State> {
        self.record_all();
        self.store.all()
    }

    /// Current time from the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.store.event_bus().clock().now()
    }

    /// Resolve entity ids, state objects and groups into member states
    ///
    /// A state whose `entity_id` attribute is a list is a group: the group
    /// itself is read (so membership changes re-trigger) and its members are
    /// expanded in its place.
    pub fn expand(&self, targets: &Value) -> Vec<State> {
        let mut found = BTreeMap::new();
        let mut seen = BTreeSet::new();
        self.expand_into(targets, &mut found, &mut seen, 0);
        found.into_values().collect()
    }

    fn expand_into(
        &self,
        target: &Value,
        found: &mut BTreeMap<String, State>,
        seen: &mut BTreeSet<String>,
        depth: usize,
    ) {
        if depth > MAX_EXPAND_DEPTH {
            return;
        }
        let entity_id = if let Some(id) = target.as_str() {
            id.to_ascii_lowercase()
        } else if let Some(wrapper) = target.downcast_object_ref::<StateWrapper>() {
            wrapper.0.entity_id.to_string()
        } else {
            if let Ok(items) = target.try_iter() {
                for item in items {
                    self.expand_into(&item, found, seen, depth + 1);
                }
            }
            return;
        };

        if !seen.insert(entity_id.clone()) {
            return;
        }
        let Some(state) = self.get(&entity_id) else {
            return;
        };
        match state.attributes.get("entity_id").and_then(|v| v.as_array()) {
            Some(members) => {
                for member in members.iter().filter_map(|m| m.as_str()) {
                    self.expand_into(&Value::from(member), found, seen, depth + 1);
                }
            }
            None => {
                found.insert(entity_id, state);
            }
        }
    }
}

impl Object for StatesObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;

        // Check if this is a full entity_id (domain.object_id)
        if key.contains('.') {
            return self.get(key).map(state_to_value);
        }

        // Otherwise, return a domain proxy
        Some(Value::from_object(DomainProxy {
            domain: key.to_ascii_lowercase(),
            states: (**self).clone(),
        }))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.all_states().into_iter().map(state_to_value).collect())
    }

    fn call(self: &Arc<Self>, _state: &minijinja::State, args: &[Value]) -> Result<Value, Error> {
        // states('entity_id') -> returns state string
        let entity_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "states() requires entity_id")
        })?;

        Ok(Value::from(self.get_state(entity_id)))
    }
}

/// Proxy for accessing entities by domain
///
/// Allows `states.light.living_room` and `for s in states.light` syntax
#[derive(Clone)]
struct DomainProxy {
    domain: String,
    states: StatesObject,
}

impl fmt::Debug for DomainProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainProxy")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl Object for DomainProxy {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let object_id = key.as_str()?;
        let entity_id = format!("{}.{}", self.domain, object_id);

        self.states.get(&entity_id).map(state_to_value)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(
            self.states
                .domain_states(&self.domain)
                .into_iter()
                .map(state_to_value)
                .collect(),
        )
    }
}

/// Convert a State to a template Value
pub(crate) fn state_to_value(state: State) -> Value {
    Value::from_object(StateWrapper(state))
}

/// Wrapper for State to expose to templates
#[derive(Debug, Clone)]
pub struct StateWrapper(pub State);

impl Object for StateWrapper {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        match key {
            "state" => Some(Value::from(self.0.state.as_str())),
            "entity_id" => Some(Value::from(self.0.entity_id.to_string())),
            "domain" => Some(Value::from(self.0.entity_id.domain())),
            "object_id" => Some(Value::from(self.0.entity_id.object_id())),
            "name" => {
                // Use friendly_name attribute or fall back to object_id
                self.0
                    .attributes
                    .get("friendly_name")
                    .and_then(|v| v.as_str().map(Value::from))
                    .or_else(|| Some(Value::from(self.0.entity_id.object_id())))
            }
            "last_changed" => Some(Value::from(self.0.last_changed.to_rfc3339())),
            "last_updated" => Some(Value::from(self.0.last_updated.to_rfc3339())),
            "attributes" => Some(Value::from_serialize(&self.0.attributes)),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<state {}={}>", self.0.entity_id, self.0.state)
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    f64::try_from(value.clone())
        .ok()
        .or_else(|| value.as_i64().map(|i| i as f64))
}

/// Compare an attribute with a template value
fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_none() && b.is_none() {
        return true;
    }
    if let (Some(a_str), Some(b_str)) = (a.as_str(), b.as_str()) {
        return a_str == b_str;
    }
    if let (Some(a_num), Some(b_num)) = (value_to_f64(a), value_to_f64(b)) {
        return (a_num - b_num).abs() < f64::EPSILON;
    }
    a == b
}

/// Look up the per-render states object from the template context
pub(crate) fn with_states<R>(
    state: &minijinja::State,
    f: impl FnOnce(&StatesObject) -> R,
) -> Result<R, Error> {
    let value = state
        .lookup("states")
        .ok_or_else(|| Error::new(ErrorKind::UndefinedError, "states is not available"))?;
    let states = value
        .downcast_object_ref::<StatesObject>()
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "states has been overridden"))?;
    Ok(f(states))
}

/// `is_state(entity_id, state_or_list)`
pub fn is_state_fn(state: &minijinja::State, entity_id: &str, value: Value) -> Result<bool, Error> {
    with_states(state, |states| {
        // Strings are iterable in minijinja, so check them first
        if let Some(s) = value.as_str() {
            states.is_state(entity_id, s)
        } else if let Ok(iter) = value.try_iter() {
            let wanted: Vec<String> = iter
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
            let refs: Vec<&str> = wanted.iter().map(|s| s.as_str()).collect();
            states.is_state_any(entity_id, &refs)
        } else {
            false
        }
    })
}

/// `state_attr(entity_id, attribute)`
pub fn state_attr_fn(state: &minijinja::State, entity_id: &str, attribute: &str) -> Result<Value, Error> {
    with_states(state, |states| states.state_attr(entity_id, attribute))
}

/// `is_state_attr(entity_id, attribute, value)`
pub fn is_state_attr_fn(
    state: &minijinja::State,
    entity_id: &str,
    attribute: &str,
    value: Value,
) -> Result<bool, Error> {
    with_states(state, |states| {
        values_equal(&states.state_attr(entity_id, attribute), &value)
    })
}

/// `has_value(entity_id)`
pub fn has_value_fn(state: &minijinja::State, entity_id: &str) -> Result<bool, Error> {
    with_states(state, |states| states.has_value(entity_id))
}

/// `expand(...)`, as a function or a filter
pub fn expand_fn(state: &minijinja::State, targets: Value) -> Result<Value, Error> {
    with_states(state, |states| {
        Value::from(
            states
                .expand(&targets)
                .into_iter()
                .map(state_to_value)
                .collect::<Vec<_>>(),
        )
    })
}
