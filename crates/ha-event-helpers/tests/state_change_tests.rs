//! State change filters driven through the hub facade

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ha_core::{Attributes, ManualClock};
use ha_event_helpers::{EntityFilter, HomeAssistant, StateMatch};
use ha_scheduler::SchedulerConfig;
use parking_lot::Mutex;
use serde_json::json;

type Transitions = Arc<Mutex<Vec<(String, Option<String>, Option<String>)>>>;

fn hass() -> HomeAssistant {
    let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    HomeAssistant::with_clock(Arc::new(clock), SchedulerConfig::default())
}

fn attrs(key: &str, value: serde_json::Value) -> Attributes {
    Attributes::from([(key.to_string(), value)])
}

fn transitions() -> Transitions {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_track_state_change() {
    let hass = hass();
    let specific = transitions();
    let wildcard = transitions();
    let wildercard = transitions();

    let sink = specific.clone();
    hass.track_state_change("light.Bowl", "on", "off", move |id, old, new| {
        sink.lock().push((
            id.to_string(),
            old.map(|s| s.state.clone()),
            new.map(|s| s.state.clone()),
        ));
        Ok(())
    });

    let sink = wildcard.clone();
    hass.track_state_change(
        "light.bowl",
        StateMatch::Any,
        StateMatch::Any,
        move |id, old, new| {
            sink.lock().push((
                id.to_string(),
                old.map(|s| s.state.clone()),
                new.map(|s| s.state.clone()),
            ));
            Ok(())
        },
    );

    let sink = wildercard.clone();
    let unsub = hass.track_state_change(
        EntityFilter::All,
        StateMatch::Any,
        StateMatch::Any,
        move |id, old, new| {
            sink.lock().push((
                id.to_string(),
                old.map(|s| s.state.clone()),
                new.map(|s| s.state.clone()),
            ));
            Ok(())
        },
    );

    // Creation
    hass.set_state("light.Bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(specific.lock().len(), 0);
    assert_eq!(
        wildcard.lock().last().cloned(),
        Some(("light.bowl".to_string(), None, Some("on".to_string())))
    );
    assert_eq!(wildercard.lock().len(), 1);

    // on -> off
    hass.set_state("light.Bowl", "off", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(
        specific.lock().clone(),
        vec![(
            "light.bowl".to_string(),
            Some("on".to_string()),
            Some("off".to_string())
        )]
    );
    assert_eq!(wildcard.lock().len(), 2);
    assert_eq!(wildercard.lock().len(), 2);

    // Attribute-only change
    hass.set_state("light.Bowl", "off", attrs("brightness", json!(10)))
        .unwrap();
    hass.drain().await;
    assert_eq!(specific.lock().len(), 1);
    assert_eq!(wildcard.lock().len(), 3);
    assert_eq!(wildercard.lock().len(), 3);

    // Identical write is a no-op
    hass.set_state("light.Bowl", "off", attrs("brightness", json!(10)))
        .unwrap();
    hass.drain().await;
    assert_eq!(wildcard.lock().len(), 3);
    assert_eq!(wildercard.lock().len(), 3);

    // Removal
    hass.remove_state("light.bowl").unwrap();
    hass.drain().await;
    assert_eq!(
        wildcard.lock().last().cloned(),
        Some(("light.bowl".to_string(), Some("off".to_string()), None))
    );
    assert_eq!(wildercard.lock().len(), 4);

    // Re-creation
    hass.set_state("light.bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(wildcard.lock().len(), 5);
    assert_eq!(wildercard.lock().len(), 5);

    // Other entity only reaches the wildcard tracker
    hass.set_state("switch.kitchen", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(wildcard.lock().len(), 5);
    assert_eq!(wildercard.lock().len(), 6);

    unsub.cancel();
    unsub.cancel();
    hass.set_state("switch.kitchen", "off", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(wildercard.lock().len(), 6);
}

#[tokio::test]
async fn test_track_state_change_from_and_to_lists() {
    let hass = hass();
    let runs = transitions();

    let sink = runs.clone();
    hass.track_state_change(
        ["light.a", "light.b"],
        ["on", "dim"],
        "off",
        move |id, old, new| {
            sink.lock().push((
                id.to_string(),
                old.map(|s| s.state.clone()),
                new.map(|s| s.state.clone()),
            ));
            Ok(())
        },
    );

    for (id, value) in [
        ("light.a", "on"),
        ("light.a", "off"),
        ("light.b", "dim"),
        ("light.b", "off"),
        ("light.c", "on"),
        ("light.c", "off"),
        ("light.a", "unavailable"),
        ("light.a", "off"),
    ] {
        hass.set_state(id, value, Attributes::new()).unwrap();
    }
    hass.drain().await;

    let ids: Vec<String> = runs.lock().iter().map(|(id, _, _)| id.clone()).collect();
    assert_eq!(ids, vec!["light.a", "light.b"]);
}

#[tokio::test]
async fn test_track_state_change_event_with_a_callback_that_throws() {
    let hass = hass();
    let runs = transitions();

    hass.track_state_change_event("light.bowl", |_| Err(anyhow::anyhow!("boom")));
    let sink = runs.clone();
    hass.track_state_change_event("light.bowl", move |event| {
        sink.lock().push((
            event.data.entity_id.to_string(),
            event.data.old_state.as_ref().map(|s| s.state.clone()),
            event.data.new_state.as_ref().map(|s| s.state.clone()),
        ));
        Ok(())
    });
    hass.track_state_change_event("light.bowl", |_| panic!("listener bug"));

    hass.set_state("light.Bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;

    assert_eq!(runs.lock().len(), 1);
}

#[tokio::test]
async fn test_track_state_change_event_ignores_empty_filter() {
    let hass = hass();
    let runs = transitions();

    let sink = runs.clone();
    let handle = hass.track_state_change_event(Vec::<String>::new(), move |event| {
        sink.lock().push((event.data.entity_id.to_string(), None, None));
        Ok(())
    });

    hass.set_state("light.bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert!(runs.lock().is_empty());
    handle.cancel();
}

#[tokio::test]
async fn test_chained_listener_does_not_see_current_event_multiple_entities() {
    let hass = Arc::new(hass());
    let tracker_called = Arc::new(Mutex::new(0));
    let chained_called = Arc::new(Mutex::new(0));
    let chained_unsubs = Arc::new(Mutex::new(Vec::new()));

    let inner = hass.clone();
    let (called, chained, unsubs) = (
        tracker_called.clone(),
        chained_called.clone(),
        chained_unsubs.clone(),
    );
    hass.track_state_change_event(["light.bowl", "light.top"], move |_| {
        *called.lock() += 1;
        let chained = chained.clone();
        unsubs.lock().push(inner.track_state_change_event(
            ["light.bowl", "light.top"],
            move |_| {
                *chained.lock() += 1;
                Ok(())
            },
        ));
        Ok(())
    });

    hass.set_state("light.bowl", "on", Attributes::new()).unwrap();
    hass.set_state("light.top", "on", Attributes::new()).unwrap();
    hass.drain().await;

    assert_eq!(*tracker_called.lock(), 2);
    assert_eq!(*chained_called.lock(), 1);
    assert_eq!(chained_unsubs.lock().len(), 2);

    hass.set_state("light.bowl", "off", Attributes::new()).unwrap();
    hass.drain().await;

    assert_eq!(*tracker_called.lock(), 3);
    assert_eq!(*chained_called.lock(), 3);
    assert_eq!(chained_unsubs.lock().len(), 3);

    for handle in chained_unsubs.lock().iter() {
        handle.cancel();
    }
}

#[tokio::test]
async fn test_chained_listener_does_not_see_current_event_single_entity() {
    let hass = Arc::new(hass());
    let tracker_called = Arc::new(Mutex::new(0));
    let chained_called = Arc::new(Mutex::new(0));
    let chained_unsubs = Arc::new(Mutex::new(Vec::new()));

    let inner = hass.clone();
    let (called, chained, unsubs) = (
        tracker_called.clone(),
        chained_called.clone(),
        chained_unsubs.clone(),
    );
    hass.track_state_change_event("light.bowl", move |_| {
        *called.lock() += 1;
        let chained = chained.clone();
        unsubs
            .lock()
            .push(inner.track_state_change_event("light.bowl", move |_| {
                *chained.lock() += 1;
                Ok(())
            }));
        Ok(())
    });

    hass.set_state("light.bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(*tracker_called.lock(), 1);
    assert_eq!(*chained_called.lock(), 0);
    assert_eq!(chained_unsubs.lock().len(), 1);

    hass.set_state("light.bowl", "off", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(*tracker_called.lock(), 2);
    assert_eq!(*chained_called.lock(), 1);
    assert_eq!(chained_unsubs.lock().len(), 2);

    for handle in chained_unsubs.lock().iter() {
        handle.cancel();
    }
}

#[tokio::test]
async fn test_track_state_added_to_domain() {
    let hass = hass();
    let added = Arc::new(Mutex::new(Vec::new()));

    let sink = added.clone();
    let unsub = hass.track_state_added_to_domain(["light"], move |event| {
        sink.lock().push(event.data.entity_id.to_string());
        Ok(())
    });

    hass.set_state("light.Bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(added.lock().len(), 1);

    hass.set_state("light.Bowl", "off", Attributes::new()).unwrap();
    hass.set_state("switch.kitchen", "on", Attributes::new()).unwrap();
    hass.remove_state("light.bowl").unwrap();
    hass.drain().await;
    assert_eq!(added.lock().len(), 1);

    hass.set_state("light.Bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(added.lock().clone(), vec!["light.bowl", "light.bowl"]);

    unsub.cancel();
    hass.remove_state("light.bowl").unwrap();
    hass.set_state("light.Bowl", "on", Attributes::new()).unwrap();
    hass.drain().await;
    assert_eq!(added.lock().len(), 2);
}

#[tokio::test]
async fn test_track_state_removed_domain() {
    let hass = hass();
    let removed = Arc::new(Mutex::new(Vec::new()));

    let sink = removed.clone();
    hass.track_state_removed_domain(["light", "switch"], move |event| {
        sink.lock().push(event.data.entity_id.to_string());
        Ok(())
    });

    hass.set_state("light.bowl", "on", Attributes::new()).unwrap();
    hass.set_state("sensor.power", "3", Attributes::new()).unwrap();
    hass.set_state("light.bowl", "off", Attributes::new()).unwrap();
    hass.remove_state("sensor.power").unwrap();
    hass.remove_state("light.bowl").unwrap();
    hass.remove_state("light.bowl").unwrap();
    hass.drain().await;

    assert_eq!(removed.lock().clone(), vec!["light.bowl"]);
}
