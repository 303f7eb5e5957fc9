//! Same-state debouncing
//!
//! A [`Debouncer`] fires its callback once a condition has held for an
//! entity, without interruption, for a whole duration. Every `state_changed`
//! delivery re-evaluates the condition: a pass restarts that entity's timer,
//! a failure cancels it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use futures::future::BoxFuture;
use ha_core::events::StateChangedData;
use ha_core::{CancelHandle, EntityId, Event, State};
use ha_event_bus::EventBus;
use ha_scheduler::Scheduler;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::state_change::{track_state_change_event, EntityFilter};

type PredicateFn = Arc<dyn Fn(&EntityId, Option<&State>, Option<&State>) -> bool + Send + Sync>;
type AsyncCheckFn =
    Arc<dyn Fn(EntityId, Option<State>, Option<State>) -> BoxFuture<'static, bool> + Send + Sync>;

/// The check run on every state change of a debounced entity
#[derive(Clone)]
pub enum SameStateCondition {
    /// Evaluated inline during dispatch
    Predicate(PredicateFn),
    /// Run as a tracked job; only the result for the latest change counts
    Async(AsyncCheckFn),
}

impl SameStateCondition {
    pub fn predicate<F>(check: F) -> Self
    where
        F: Fn(&EntityId, Option<&State>, Option<&State>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(check))
    }

    pub fn async_check<F, Fut>(check: F) -> Self
    where
        F: Fn(EntityId, Option<State>, Option<State>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Async(Arc::new(move |entity_id, old_state, new_state| {
            Box::pin(check(entity_id, old_state, new_state))
        }))
    }

    /// Holds while the new state's value equals `value`
    pub fn state_is(value: impl Into<String>) -> Self {
        let value = value.into();
        Self::predicate(move |_, _, new_state| new_state.is_some_and(|s| s.state == value))
    }
}

impl fmt::Debug for SameStateCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(_) => f.write_str("SameStateCondition::Predicate"),
            Self::Async(_) => f.write_str("SameStateCondition::Async"),
        }
    }
}

struct PendingTimer {
    generation: u64,
    handle: CancelHandle,
}

#[derive(Default)]
struct DebounceState {
    next_generation: u64,
    /// Generation of the latest delivery per entity
    latest: HashMap<String, u64>,
    pending: HashMap<String, PendingTimer>,
    listener: Option<CancelHandle>,
    removed: bool,
}

struct DebounceInner {
    bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    duration: Duration,
    condition: SameStateCondition,
    callback: Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
    state: Mutex<DebounceState>,
}

/// A live same-state tracker
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebounceInner>,
}

impl Debouncer {
    /// Call `callback` once `condition` has held for `duration`
    ///
    /// Each entity in `entity_ids` keeps at most one pending timer.
    pub fn new<F>(
        bus: Arc<EventBus>,
        scheduler: Arc<Scheduler>,
        duration: Duration,
        condition: SameStateCondition,
        entity_ids: impl Into<EntityFilter>,
        callback: F,
    ) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let inner = Arc::new(DebounceInner {
            bus,
            scheduler,
            duration,
            condition,
            callback: Box::new(callback),
            state: Mutex::new(DebounceState::default()),
        });

        let tracked = Arc::clone(&inner);
        let listener = track_state_change_event(&inner.bus, entity_ids, move |event| {
            tracked.on_state_changed(event);
            Ok(())
        });
        inner.state.lock().listener = Some(listener);

        Self { inner }
    }

    /// Cancel the state listener and every pending timer
    pub fn remove(&self) {
        let (listener, pending) = {
            let mut state = self.inner.state.lock();
            state.removed = true;
            state.latest.clear();
            (state.listener.take(), std::mem::take(&mut state.pending))
        };
        if let Some(listener) = listener {
            listener.cancel();
        }
        for timer in pending.values() {
            timer.handle.cancel();
        }
    }

    /// A cancel handle that removes this debouncer
    pub fn cancel_handle(&self) -> CancelHandle {
        let debouncer = self.clone();
        CancelHandle::new(move || debouncer.remove())
    }

    /// Number of entities with a running timer
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl DebounceInner {
    fn on_state_changed(self: &Arc<Self>, event: &Event<StateChangedData>) {
        let data = &event.data;
        let entity_id = data.entity_id.to_string();
        let generation = {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.latest.insert(entity_id.clone(), generation);
            generation
        };

        match &self.condition {
            SameStateCondition::Predicate(check) => {
                let holds = check(
                    &data.entity_id,
                    data.old_state.as_ref(),
                    data.new_state.as_ref(),
                );
                self.apply(&entity_id, generation, holds);
            }
            SameStateCondition::Async(check) => {
                let job = check(
                    data.entity_id.clone(),
                    data.old_state.clone(),
                    data.new_state.clone(),
                );
                let debouncer = Arc::clone(self);
                let spawned = self.bus.spawn_job(async move {
                    let holds = job.await;
                    debouncer.apply(&entity_id, generation, holds);
                });
                if let Err(err) = spawned {
                    error!(entity_id = %data.entity_id, "Cannot run same-state check: {}", err);
                    self.apply(&data.entity_id.to_string(), generation, false);
                }
            }
        }
    }

    /// Start or cancel the entity's timer according to a check result
    fn apply(self: &Arc<Self>, entity_id: &str, generation: u64, holds: bool) {
        let mut state = self.state.lock();
        if state.removed || state.latest.get(entity_id) != Some(&generation) {
            trace!(entity_id, generation, "Discarding stale same-state check");
            return;
        }

        if let Some(previous) = state.pending.remove(entity_id) {
            previous.handle.cancel();
        }
        if !holds {
            trace!(entity_id, "Same-state condition failed, timer cleared");
            return;
        }

        let debouncer = Arc::clone(self);
        let owner = entity_id.to_string();
        let handle = self.scheduler.call_later(self.duration, move |_| {
            debouncer.expire(&owner, generation)
        });
        trace!(entity_id, duration = %self.duration, "Same-state timer started");
        state
            .pending
            .insert(entity_id.to_string(), PendingTimer { generation, handle });
    }

    fn expire(&self, entity_id: &str, generation: u64) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            match state.pending.get(entity_id) {
                Some(timer) if timer.generation == generation => {
                    state.pending.remove(entity_id);
                }
                _ => return Ok(()),
            }
        }
        debug!(entity_id, "Same state held for the full duration");
        (self.callback)()
    }
}
