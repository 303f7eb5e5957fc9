//! Convenience filters over `state_changed`

use std::collections::BTreeSet;

use ha_core::events::StateChangedData;
use ha_core::{CancelHandle, EntityId, Event, State, MATCH_ALL};
use ha_event_bus::EventBus;

/// The entities a tracker follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    All,
    /// Lower-cased entity ids
    Ids(BTreeSet<String>),
}

impl EntityFilter {
    /// Build a filter from entity ids; `*` anywhere selects every entity
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for id in ids {
            let id = id.as_ref();
            if id == MATCH_ALL {
                return Self::All;
            }
            set.insert(id.to_ascii_lowercase());
        }
        Self::Ids(set)
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(entity_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Ids(ids) if ids.is_empty())
    }
}

impl From<&str> for EntityFilter {
    fn from(id: &str) -> Self {
        Self::ids([id])
    }
}

impl From<&EntityId> for EntityFilter {
    fn from(id: &EntityId) -> Self {
        Self::ids([id.to_string()])
    }
}

impl From<Vec<&str>> for EntityFilter {
    fn from(ids: Vec<&str>) -> Self {
        Self::ids(ids)
    }
}

impl From<Vec<String>> for EntityFilter {
    fn from(ids: Vec<String>) -> Self {
        Self::ids(ids)
    }
}

impl<const N: usize> From<[&str; N]> for EntityFilter {
    fn from(ids: [&str; N]) -> Self {
        Self::ids(ids)
    }
}

/// A constraint on a state value in a transition
///
/// A missing state (creation or removal) only satisfies [`StateMatch::Any`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StateMatch {
    #[default]
    Any,
    OneOf(Vec<String>),
}

impl StateMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        Self::OneOf(vec![value.into()])
    }

    pub fn matches(&self, state: Option<&State>) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(values) => state.is_some_and(|s| values.iter().any(|v| *v == s.state)),
        }
    }
}

impl From<&str> for StateMatch {
    fn from(value: &str) -> Self {
        if value == MATCH_ALL {
            Self::Any
        } else {
            Self::exact(value)
        }
    }
}

impl From<Option<&str>> for StateMatch {
    fn from(value: Option<&str>) -> Self {
        value.map(Self::from).unwrap_or_default()
    }
}

impl<const N: usize> From<[&str; N]> for StateMatch {
    fn from(values: [&str; N]) -> Self {
        Self::OneOf(values.iter().map(|v| v.to_string()).collect())
    }
}

/// Deliver every `state_changed` event for the filtered entities
pub fn track_state_change_event<F>(
    bus: &EventBus,
    entity_ids: impl Into<EntityFilter>,
    callback: F,
) -> CancelHandle
where
    F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let filter = entity_ids.into();
    if filter.is_empty() {
        return CancelHandle::noop();
    }
    bus.listen_typed(move |event: &Event<StateChangedData>| {
        if !filter.matches(&event.data.entity_id.to_string()) {
            return Ok(());
        }
        callback(event)
    })
}

/// Call `callback(entity_id, old_state, new_state)` on matching transitions
///
/// `from` is checked against the old state and `to` against the new one.
/// With both left at [`StateMatch::Any`] every change fires, creation and
/// removal included.
pub fn track_state_change<F>(
    bus: &EventBus,
    entity_ids: impl Into<EntityFilter>,
    from: impl Into<StateMatch>,
    to: impl Into<StateMatch>,
    callback: F,
) -> CancelHandle
where
    F: Fn(&EntityId, Option<&State>, Option<&State>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let from = from.into();
    let to = to.into();
    track_state_change_event(bus, entity_ids, move |event| {
        let data = &event.data;
        if !from.matches(data.old_state.as_ref()) || !to.matches(data.new_state.as_ref()) {
            return Ok(());
        }
        callback(&data.entity_id, data.old_state.as_ref(), data.new_state.as_ref())
    })
}

fn domain_set<I, S>(domains: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    domains
        .into_iter()
        .map(|d| d.as_ref().to_ascii_lowercase())
        .collect()
}

/// Fire when an entity first appears in one of `domains`
///
/// Updates to an existing entity and removals never fire.
pub fn track_state_added_to_domain<I, S, F>(bus: &EventBus, domains: I, callback: F) -> CancelHandle
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let domains = domain_set(domains);
    bus.listen_typed(move |event: &Event<StateChangedData>| {
        let data = &event.data;
        if data.old_state.is_some()
            || data.new_state.is_none()
            || !domains.contains(data.entity_id.domain())
        {
            return Ok(());
        }
        callback(event)
    })
}

/// Fire when an entity in one of `domains` is removed
pub fn track_state_removed_domain<I, S, F>(bus: &EventBus, domains: I, callback: F) -> CancelHandle
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let domains = domain_set(domains);
    bus.listen_typed(move |event: &Event<StateChangedData>| {
        let data = &event.data;
        if data.new_state.is_some() || !domains.contains(data.entity_id.domain()) {
            return Ok(());
        }
        callback(event)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state(value: &str) -> State {
        State::new("light.bowl".parse().unwrap(), value, Default::default(), Utc::now())
    }

    #[test]
    fn test_entity_filter() {
        let filter = EntityFilter::from(["light.Bowl", "switch.fan"]);
        assert!(filter.matches("light.bowl"));
        assert!(!filter.matches("light.top"));
        assert_eq!(EntityFilter::from(["light.bowl", "*"]), EntityFilter::All);
        assert!(EntityFilter::from(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_state_match() {
        assert!(StateMatch::Any.matches(None));
        assert!(StateMatch::from("*").matches(Some(&state("on"))));
        assert!(StateMatch::from("on").matches(Some(&state("on"))));
        assert!(!StateMatch::from("on").matches(Some(&state("off"))));
        assert!(!StateMatch::from("on").matches(None));
        assert!(StateMatch::from(["on", "off"]).matches(Some(&state("off"))));
    }
}
