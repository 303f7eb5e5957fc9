//! The hub facade
//!
//! [`HomeAssistant`] wires the event bus, the state store, the scheduler and
//! a template renderer together and exposes the tracking helpers on top of
//! them as one API.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ha_core::events::{
    CoreConfigUpdateData, EntityRegistryUpdatedData, StateChangedData, TimeChangedData,
};
use ha_core::{Attributes, CancelHandle, EntityId, Event, SharedClock, State, SystemClock};
use ha_event_bus::{EventBus, EventBusError};
use ha_scheduler::{Scheduler, SchedulerConfig, TimePattern};
use ha_state_store::StateStore;
use ha_template::{TemplateEngine, TemplateRenderer, Variables};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::HassResult;
use crate::registry::track_entity_registry_updated_event;
use crate::same_state::{Debouncer, SameStateCondition};
use crate::state_change::{
    track_state_added_to_domain, track_state_change, track_state_change_event,
    track_state_removed_domain, EntityFilter, StateMatch,
};
use crate::template::{track_template_condition, TemplateOutcome, TemplateTracker};

/// The central Home Assistant instance
pub struct HomeAssistant {
    /// Event bus for pub/sub communication
    bus: Arc<EventBus>,
    /// Entity states
    states: Arc<StateStore>,
    /// Timers, time patterns and sun events
    scheduler: Arc<Scheduler>,
    /// Renders tracked templates
    renderer: Arc<dyn TemplateRenderer>,
    /// Shutdown signal of the running clock driver
    clock_driver: Mutex<Option<broadcast::Sender<()>>>,
}

impl HomeAssistant {
    /// Create a hub running on wall-clock time
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(Arc::new(SystemClock), config)
    }

    /// Create a hub reading time from `clock`
    pub fn with_clock(clock: SharedClock, config: SchedulerConfig) -> Self {
        let bus = Arc::new(EventBus::with_clock(clock));
        let states = Arc::new(StateStore::new(bus.clone()));
        let scheduler = Scheduler::new(&bus, config);
        let renderer: Arc<dyn TemplateRenderer> = Arc::new(TemplateEngine::new(states.clone()));

        Self {
            bus,
            states,
            scheduler,
            renderer,
            clock_driver: Mutex::new(None),
        }
    }

    /// Replace the template renderer used by trackers created afterwards
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn renderer(&self) -> &Arc<dyn TemplateRenderer> {
        &self.renderer
    }

    pub fn clock(&self) -> &SharedClock {
        self.bus.clock()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.bus.clock().now()
    }

    // ==================== Events ====================

    pub fn fire_event(&self, event_type: &str, data: serde_json::Value) {
        self.bus.fire(event_type, data);
    }

    pub fn listen_event<F>(&self, event_type: &str, callback: F) -> CancelHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.listen(event_type, callback)
    }

    // ==================== States ====================

    pub fn set_state(
        &self,
        entity_id: &str,
        value: impl Into<String>,
        attributes: Attributes,
    ) -> HassResult<State> {
        let entity_id: EntityId = entity_id.parse()?;
        Ok(self.states.set(entity_id, value, attributes)?)
    }

    pub fn remove_state(&self, entity_id: &str) -> HassResult<Option<State>> {
        let entity_id: EntityId = entity_id.parse()?;
        Ok(self.states.remove(&entity_id))
    }

    pub fn get_state(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id)
    }

    // ==================== Time ====================

    pub fn track_point_in_time<F>(&self, at: DateTime<Utc>, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.track_point_in_time(at, callback)
    }

    pub fn call_later<F>(&self, delay: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.call_later(delay, callback)
    }

    pub fn track_interval<F>(&self, period: Duration, callback: F) -> HassResult<CancelHandle>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Ok(self.scheduler.track_interval(period, callback)?)
    }

    pub fn track_time_pattern<F>(&self, pattern: TimePattern, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.track_time_pattern(pattern, callback)
    }

    /// Local-time pattern from string fields such as `"/5"` or `"0,30"`
    ///
    /// Omitted fields match anything. Malformed fields fail here, before
    /// anything is registered.
    pub fn track_time_change<F>(
        &self,
        hour: Option<&str>,
        minute: Option<&str>,
        second: Option<&str>,
        callback: F,
    ) -> HassResult<CancelHandle>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern = TimePattern::parse(hour, minute, second)?;
        Ok(self.scheduler.track_time_pattern(pattern, callback))
    }

    /// Like [`HomeAssistant::track_time_change`], matched against UTC
    pub fn track_utc_time_change<F>(
        &self,
        hour: Option<&str>,
        minute: Option<&str>,
        second: Option<&str>,
        callback: F,
    ) -> HassResult<CancelHandle>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern = TimePattern::parse(hour, minute, second)?;
        Ok(self.scheduler.track_utc_time_pattern(pattern, callback))
    }

    pub fn track_sunrise<F>(&self, offset: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.track_sunrise(offset, callback)
    }

    pub fn track_sunset<F>(&self, offset: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.scheduler.track_sunset(offset, callback)
    }

    // ==================== State tracking ====================

    pub fn track_state_change<F>(
        &self,
        entity_ids: impl Into<EntityFilter>,
        from: impl Into<StateMatch>,
        to: impl Into<StateMatch>,
        callback: F,
    ) -> CancelHandle
    where
        F: Fn(&EntityId, Option<&State>, Option<&State>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        track_state_change(&self.bus, entity_ids, from, to, callback)
    }

    pub fn track_state_change_event<F>(
        &self,
        entity_ids: impl Into<EntityFilter>,
        callback: F,
    ) -> CancelHandle
    where
        F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        track_state_change_event(&self.bus, entity_ids, callback)
    }

    pub fn track_state_added_to_domain<I, S, F>(&self, domains: I, callback: F) -> CancelHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        track_state_added_to_domain(&self.bus, domains, callback)
    }

    pub fn track_state_removed_domain<I, S, F>(&self, domains: I, callback: F) -> CancelHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Event<StateChangedData>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        track_state_removed_domain(&self.bus, domains, callback)
    }

    pub fn track_entity_registry_updated_event<F>(
        &self,
        entity_ids: impl Into<EntityFilter>,
        callback: F,
    ) -> CancelHandle
    where
        F: Fn(&Event<EntityRegistryUpdatedData>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        track_entity_registry_updated_event(&self.bus, entity_ids, callback)
    }

    /// Track a template's rendered result
    pub fn track_template<F>(
        &self,
        template: &str,
        variables: Option<Variables>,
        callback: F,
    ) -> TemplateTracker
    where
        F: Fn(Option<&Event<StateChangedData>>, &str, &TemplateOutcome, &TemplateOutcome) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        TemplateTracker::new(
            self.bus.clone(),
            self.renderer.clone(),
            template,
            variables,
            callback,
        )
    }

    /// Fire when a template turns true
    pub fn track_template_condition<F>(
        &self,
        template: &str,
        variables: Option<Variables>,
        callback: F,
    ) -> TemplateTracker
    where
        F: Fn(Option<&EntityId>, Option<&State>, Option<&State>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        track_template_condition(
            self.bus.clone(),
            self.renderer.clone(),
            template,
            variables,
            callback,
        )
    }

    /// Fire once `condition` has held for `duration`
    pub fn track_same_state<F>(
        &self,
        duration: Duration,
        condition: SameStateCondition,
        entity_ids: impl Into<EntityFilter>,
        callback: F,
    ) -> Debouncer
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Debouncer::new(
            self.bus.clone(),
            self.scheduler.clone(),
            duration,
            condition,
            entity_ids,
            callback,
        )
    }

    // ==================== Config and clock ====================

    /// Change location and/or time zone at runtime
    ///
    /// The update is validated first; on success `core_config_updated` is
    /// fired and the scheduler recomputes the affected timers.
    pub fn update_core_config(&self, update: CoreConfigUpdateData) -> HassResult<()> {
        self.scheduler.resolve_core_config(&update)?;
        info!(?update, "Updating core config");
        self.bus.fire_typed(update);
        Ok(())
    }

    /// Deliver a clock tick
    pub fn fire_time_changed(&self, now: DateTime<Utc>) {
        self.bus.fire_typed(TimeChangedData { now, fire_all: false });
    }

    /// Deliver a forcing tick: every time pattern fires once at `now`
    pub fn fire_time_changed_all(&self, now: DateTime<Utc>) {
        self.bus.fire_typed(TimeChangedData { now, fire_all: true });
    }

    /// Fire `time_changed` once per second from the hub clock
    ///
    /// Calling it again while the driver runs does nothing.
    pub fn start_clock(&self) -> HassResult<()> {
        let mut driver = self.clock_driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EventBusError::NoRuntime)?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let bus = self.bus.clone();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Clock driver stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = bus.clock().now();
                        bus.fire_typed(TimeChangedData { now, fire_all: false });
                    }
                }
            }
        });

        *driver = Some(shutdown_tx);
        info!("Clock driver started");
        Ok(())
    }

    /// Stop the clock driver
    pub fn stop(&self) {
        if let Some(shutdown) = self.clock_driver.lock().take() {
            // No receiver means the driver already exited
            let _ = shutdown.send(());
        }
    }

    /// Wait until every queued event and tracked job has settled
    pub async fn drain(&self) {
        self.bus.drain().await;
    }
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for HomeAssistant {
    fn drop(&mut self) {
        self.stop();
    }
}
