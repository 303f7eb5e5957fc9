//! Entity state storage with domain indexing for Home Assistant
//!
//! This crate provides the StateStore, which tracks the current state of
//! all entities. It maintains an index by domain for efficient queries and
//! fires STATE_CHANGED events on the event bus.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ha_core::events::StateChangedData;
use ha_core::{Attributes, EntityId, State, MAX_STATE_LENGTH};
use ha_event_bus::EventBus;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Errors raised when writing a state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateStoreError {
    #[error("state for {entity_id} is longer than {MAX_STATE_LENGTH} characters")]
    StateTooLong { entity_id: String },
}

/// The state store tracks all entity states
///
/// The StateStore is responsible for:
/// - Storing the current state of all entities
/// - Maintaining a domain index for efficient domain-based queries
/// - Firing STATE_CHANGED events when states change
/// - Handing out snapshots, never references into the table
pub struct StateStore {
    /// All entity states keyed by canonical entity_id string
    states: DashMap<String, State>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, BTreeSet<String>>,
    /// Event bus for firing state change events
    event_bus: Arc<EventBus>,
}

impl StateStore {
    /// Create a new state store with the given event bus
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    /// Set the state of an entity
    ///
    /// Writing the same value and attributes again is a no-op: no event
    /// fires and the timestamps stay untouched. Otherwise `last_updated`
    /// moves, `last_changed` moves only when the value differs, and a
    /// STATE_CHANGED event carries the old and new state.
    ///
    /// Returns the state now stored.
    #[instrument(skip(self, state, attributes), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
    ) -> Result<State, StateStoreError> {
        let state = state.into();
        if state.chars().count() > MAX_STATE_LENGTH {
            return Err(StateStoreError::StateTooLong {
                entity_id: entity_id.to_string(),
            });
        }

        let key = entity_id.to_string();
        let now = self.event_bus.clock().now();

        let (old_state, new_state) = match self.states.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_same(&state, &attributes) {
                    trace!("State unchanged, skipping write");
                    return Ok(occupied.get().clone());
                }
                let new_state = occupied.get().with_update(state, attributes, now);
                let old_state = occupied.insert(new_state.clone());
                (Some(old_state), new_state)
            }
            Entry::Vacant(vacant) => {
                let new_state = State::new(entity_id.clone(), state, attributes, now);
                vacant.insert(new_state.clone());
                (None, new_state)
            }
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .insert(key);
        }

        self.event_bus.fire_typed(StateChangedData {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        Ok(new_state)
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states
            .get(&entity_id.to_ascii_lowercase())
            .map(|s| s.clone())
    }

    /// Get the state value as a string, or None if entity doesn't exist
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.get(entity_id).map(|s| s.state)
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).as_deref() == Some(state)
    }

    /// Get all entity IDs for a domain, sorted
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(&domain.to_ascii_lowercase())
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get all states for a domain, sorted by entity_id
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Get all entity IDs, sorted
    pub fn all_entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Get all states, sorted by entity_id
    pub fn all(&self) -> Vec<State> {
        let mut states: Vec<State> = self.states.iter().map(|r| r.value().clone()).collect();
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        states
    }

    /// Get all domains that currently have at least one entity, sorted
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .domain_index
            .iter()
            .filter(|r| !r.value().is_empty())
            .map(|r| r.key().clone())
            .collect();
        domains.sort();
        domains
    }

    /// Remove an entity's state
    ///
    /// Fires a STATE_CHANGED event with the old state and None for new_state.
    /// Removing an unknown entity does nothing.
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s)?;

        trace!("Removing entity state");
        if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
            ids.remove(&key);
        }
        self.domain_index
            .remove_if(entity_id.domain(), |_, ids| ids.is_empty());

        self.event_bus.fire_typed(StateChangedData {
            entity_id: entity_id.clone(),
            old_state: Some(old_state.clone()),
            new_state: None,
        });

        Some(old_state)
    }

    /// Get the total number of entities
    pub fn entity_count(&self) -> usize {
        self.states.len()
    }

    /// The event bus this store fires on
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;
