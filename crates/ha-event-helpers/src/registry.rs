//! Entity registry change tracking

use ha_core::events::EntityRegistryUpdatedData;
use ha_core::{CancelHandle, Event};
use ha_event_bus::EventBus;

use crate::state_change::EntityFilter;

/// Deliver `entity_registry_updated` events concerning the filtered entities
///
/// Events are keyed by the id the entity had before the change: a rename
/// reaches the trackers of `old_entity_id`, anything else those of
/// `entity_id`.
pub fn track_entity_registry_updated_event<F>(
    bus: &EventBus,
    entity_ids: impl Into<EntityFilter>,
    callback: F,
) -> CancelHandle
where
    F: Fn(&Event<EntityRegistryUpdatedData>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let filter = entity_ids.into();
    if filter.is_empty() {
        return CancelHandle::noop();
    }
    bus.listen_typed(move |event: &Event<EntityRegistryUpdatedData>| {
        let data = &event.data;
        let key = data.old_entity_id.as_ref().unwrap_or(&data.entity_id);
        if !filter.matches(&key.to_string()) {
            return Ok(());
        }
        callback(event)
    })
}
