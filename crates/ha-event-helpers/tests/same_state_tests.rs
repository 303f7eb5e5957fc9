//! Same-state debouncing driven by time_changed ticks

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ha_core::{Attributes, EntityId, ManualClock, State};
use ha_event_helpers::{HomeAssistant, SameStateCondition};
use ha_scheduler::SchedulerConfig;
use parking_lot::Mutex;
use serde_json::json;

struct Harness {
    clock: ManualClock,
    hass: HomeAssistant,
    start: DateTime<Utc>,
}

impl Harness {
    fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::at(start);
        let hass = HomeAssistant::with_clock(Arc::new(clock.clone()), SchedulerConfig::default());
        Self { clock, hass, start }
    }

    fn set(&self, entity_id: &str, value: &str) {
        self.hass
            .set_state(entity_id, value, Attributes::new())
            .unwrap();
    }

    /// Move the clock and deliver the tick
    fn tick(&self, after: Duration) {
        let now = self.start + after;
        self.clock.set(now);
        self.hass.fire_time_changed(now);
    }
}

fn counter() -> (Arc<Mutex<usize>>, impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) {
    let runs = Arc::new(Mutex::new(0));
    let sink = runs.clone();
    (runs, move || {
        *sink.lock() += 1;
        Ok(())
    })
}

#[tokio::test]
async fn test_interrupted_condition_never_fires() {
    let h = Harness::new();
    let (runs, callback) = counter();
    h.hass.track_same_state(
        Duration::minutes(1),
        SameStateCondition::predicate(|_, _, new| new.is_some_and(|s| s.state == "on")),
        "light.Bowl",
        callback,
    );

    h.set("light.Bowl", "on");
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);

    h.set("light.Bowl", "off");
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);

    h.tick(Duration::minutes(1));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);
}

#[tokio::test]
async fn test_condition_held_fires_exactly_once() {
    let h = Harness::new();
    let (runs, callback) = counter();
    let debouncer = h.hass.track_same_state(
        Duration::seconds(60),
        SameStateCondition::state_is("on"),
        "light.bowl",
        callback,
    );

    h.set("light.Bowl", "on");
    h.hass.drain().await;
    assert_eq!(debouncer.pending_count(), 1);

    h.tick(Duration::seconds(59));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);

    h.tick(Duration::seconds(60));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 1);
    assert_eq!(debouncer.pending_count(), 0);

    h.tick(Duration::seconds(180));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 1);
}

#[tokio::test]
async fn test_passing_change_restarts_the_timer() {
    let h = Harness::new();
    let (runs, callback) = counter();
    h.hass.track_same_state(
        Duration::seconds(60),
        SameStateCondition::state_is("on"),
        "light.bowl",
        callback,
    );

    h.set("light.bowl", "on");
    h.clock.set(h.start + Duration::seconds(30));
    h.hass
        .set_state(
            "light.bowl",
            "on",
            Attributes::from([("brightness".to_string(), json!(120))]),
        )
        .unwrap();
    h.hass.drain().await;

    h.tick(Duration::seconds(60));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);

    h.tick(Duration::seconds(90));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 1);
}

#[tokio::test]
async fn test_async_check_sees_the_transition() {
    let h = Harness::new();
    let (runs, callback) = counter();
    let checks: Arc<Mutex<Vec<(EntityId, Option<State>, Option<State>)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let sink = checks.clone();
    h.hass.track_same_state(
        Duration::minutes(1),
        SameStateCondition::async_check(move |entity_id, old_state, new_state| {
            sink.lock().push((entity_id, old_state, new_state));
            async { true }
        }),
        "light.Bowl",
        callback,
    );

    h.set("light.Bowl", "on");
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);
    {
        let checks = checks.lock();
        let (entity_id, old_state, new_state) = checks.last().unwrap();
        assert_eq!(entity_id.to_string(), "light.bowl");
        assert!(old_state.is_none());
        assert_eq!(new_state.as_ref().unwrap().state, "on");
    }

    h.tick(Duration::minutes(1));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 1);
}

#[tokio::test]
async fn test_superseded_async_result_is_discarded() {
    let h = Harness::new();
    let (runs, callback) = counter();
    let debouncer = h.hass.track_same_state(
        Duration::minutes(1),
        SameStateCondition::async_check(|_, _, new_state| {
            let holds = new_state.is_some_and(|s| s.state == "on");
            async move {
                tokio::task::yield_now().await;
                holds
            }
        }),
        "light.bowl",
        callback,
    );

    // Both deliveries happen before either check completes
    h.set("light.bowl", "on");
    h.set("light.bowl", "off");
    h.hass.drain().await;
    assert_eq!(debouncer.pending_count(), 0);

    h.tick(Duration::minutes(2));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);
}

#[tokio::test]
async fn test_one_timer_per_entity() {
    let h = Harness::new();
    let (runs, callback) = counter();
    let debouncer = h.hass.track_same_state(
        Duration::seconds(30),
        SameStateCondition::state_is("on"),
        ["light.a", "light.b"],
        callback,
    );

    h.set("light.a", "on");
    h.set("light.b", "on");
    h.set("light.c", "on");
    h.hass.drain().await;
    assert_eq!(debouncer.pending_count(), 2);

    h.tick(Duration::seconds(30));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 2);
}

#[tokio::test]
async fn test_remove_cancels_pending_timer() {
    let h = Harness::new();
    let (runs, callback) = counter();
    let debouncer = h.hass.track_same_state(
        Duration::seconds(30),
        SameStateCondition::state_is("on"),
        "light.bowl",
        callback,
    );
    let timers = h.hass.scheduler().timer_count();

    h.set("light.bowl", "on");
    h.hass.drain().await;
    assert_eq!(h.hass.scheduler().timer_count(), timers + 1);

    let handle = debouncer.cancel_handle();
    handle.cancel();
    assert_eq!(h.hass.scheduler().timer_count(), timers);

    h.set("light.bowl", "off");
    h.set("light.bowl", "on");
    h.tick(Duration::seconds(60));
    h.hass.drain().await;
    assert_eq!(*runs.lock(), 0);
    assert_eq!(debouncer.pending_count(), 0);
}
