//! Template result tracking
//!
//! A tracker renders its template once, subscribes to exactly the state that
//! render read, and renders again whenever that state changes. Every render
//! recomputes the dependency set and the installed listeners are swapped to
//! match it: new listeners are added first, stale ones cancelled after.
//!
//! Listener granularity follows the render: all-states iteration gets one
//! listener for every change, an iterated domain gets one listener for the
//! domain, and each remaining entity gets its own. An entity inside a tracked
//! domain is served by the domain listener, so a tracker never receives the
//! same event twice.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use ha_core::events::StateChangedData;
use ha_core::{CancelHandle, EntityId, Event, State};
use ha_event_bus::EventBus;
use ha_template::{RenderInfo, TemplateError, TemplateRenderer, Variables};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

/// The value a render produced: the output text or the error it raised
pub type TemplateOutcome = Result<String, TemplateError>;

/// Called with `(event, template, old_result, new_result)` when the result changes
///
/// `event` is the triggering `state_changed` event, or `None` when the
/// change came from [`TemplateTracker::refresh`].
pub type TemplateResultCallback = Box<
    dyn Fn(Option<&Event<StateChangedData>>, &str, &TemplateOutcome, &TemplateOutcome) -> anyhow::Result<()>
        + Send
        + Sync,
>;

/// What an installed listener is subscribed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKey {
    AllStates,
    Domain(String),
    Entity(String),
}

impl ListenerKey {
    fn matches(&self, entity_id: &EntityId) -> bool {
        match self {
            ListenerKey::AllStates => true,
            ListenerKey::Domain(domain) => entity_id.domain() == domain,
            ListenerKey::Entity(id) => entity_id.to_string() == *id,
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKey::AllStates => write!(f, "all states"),
            ListenerKey::Domain(domain) => write!(f, "domain {}", domain),
            ListenerKey::Entity(id) => write!(f, "entity {}", id),
        }
    }
}

/// The listeners needed to cover a render's dependencies
fn listener_keys(info: &RenderInfo) -> BTreeSet<ListenerKey> {
    if info.all_states {
        return BTreeSet::from([ListenerKey::AllStates]);
    }
    let mut keys: BTreeSet<ListenerKey> = info
        .domains
        .iter()
        .map(|domain| ListenerKey::Domain(domain.clone()))
        .collect();
    for entity_id in &info.entities {
        let covered = entity_id
            .split_once('.')
            .is_some_and(|(domain, _)| info.domains.contains(domain));
        if !covered {
            keys.insert(ListenerKey::Entity(entity_id.clone()));
        }
    }
    keys
}

struct TrackerState {
    variables: Variables,
    last_result: Option<TemplateOutcome>,
    info: Option<RenderInfo>,
    listeners: BTreeMap<ListenerKey, CancelHandle>,
    /// Error messages already logged since the last successful render
    logged_errors: HashSet<String>,
    removed: bool,
}

struct TrackerInner {
    bus: Arc<EventBus>,
    renderer: Arc<dyn TemplateRenderer>,
    template: String,
    callback: TemplateResultCallback,
    state: Mutex<TrackerState>,
}

/// A live subscription to a template's rendered result
///
/// Clones share the same tracker. Dropping every clone does not stop it;
/// call [`TemplateTracker::remove`].
#[derive(Clone)]
pub struct TemplateTracker {
    inner: Arc<TrackerInner>,
}

impl TemplateTracker {
    /// Render `template` and start tracking what it reads
    ///
    /// The first render only establishes the baseline result; `callback`
    /// fires on later changes. A template that fails to parse is logged and
    /// the tracker stays inert (no listeners) until a refresh renders it.
    pub fn new<F>(
        bus: Arc<EventBus>,
        renderer: Arc<dyn TemplateRenderer>,
        template: impl Into<String>,
        variables: Option<Variables>,
        callback: F,
    ) -> Self
    where
        F: Fn(Option<&Event<StateChangedData>>, &str, &TemplateOutcome, &TemplateOutcome) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let inner = Arc::new(TrackerInner {
            bus,
            renderer,
            template: template.into(),
            callback: Box::new(callback),
            state: Mutex::new(TrackerState {
                variables: variables.unwrap_or_default(),
                last_result: None,
                info: None,
                listeners: BTreeMap::new(),
                logged_errors: HashSet::new(),
                removed: false,
            }),
        });
        if let Err(err) = inner.update(None, None) {
            error!(template = %inner.template, "Error in template callback: {:#}", err);
        }
        Self { inner }
    }

    /// Render again now, merging `variables` into the stored ones
    ///
    /// Listeners are refreshed and the callback fires if the result changed.
    pub fn refresh(&self, variables: Option<Variables>) {
        if let Err(err) = self.inner.update(None, variables) {
            error!(template = %self.inner.template, "Error in template callback: {:#}", err);
        }
    }

    /// Cancel every listener; the tracker never renders again
    pub fn remove(&self) {
        let listeners = {
            let mut state = self.inner.state.lock();
            state.removed = true;
            std::mem::take(&mut state.listeners)
        };
        debug!(template = %self.inner.template, listeners = listeners.len(), "Removing template tracker");
        for handle in listeners.values() {
            handle.cancel();
        }
    }

    /// A cancel handle that removes this tracker
    pub fn cancel_handle(&self) -> CancelHandle {
        let tracker = self.clone();
        CancelHandle::new(move || tracker.remove())
    }

    pub fn template(&self) -> &str {
        &self.inner.template
    }

    /// The result of the latest render
    pub fn last_result(&self) -> Option<TemplateOutcome> {
        self.inner.state.lock().last_result.clone()
    }

    /// Dependencies recorded by the latest render
    pub fn render_info(&self) -> Option<RenderInfo> {
        self.inner.state.lock().info.clone()
    }

    /// The listeners currently installed
    pub fn listeners(&self) -> Vec<ListenerKey> {
        self.inner.state.lock().listeners.keys().cloned().collect()
    }

    /// True when nothing can trigger a re-render
    pub fn is_inert(&self) -> bool {
        let state = self.inner.state.lock();
        state.removed || state.listeners.is_empty()
    }
}

impl fmt::Debug for TemplateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateTracker")
            .field("template", &self.inner.template)
            .finish_non_exhaustive()
    }
}

impl TrackerInner {
    fn update(
        self: &Arc<Self>,
        event: Option<&Event<StateChangedData>>,
        variables: Option<Variables>,
    ) -> anyhow::Result<()> {
        let (old, new) = {
            let mut state = self.state.lock();
            if state.removed {
                return Ok(());
            }
            if let Some(variables) = variables {
                state.variables.extend(variables);
            }

            let mut info = self.renderer.render(&self.template, &state.variables);
            let failure = info.result.as_ref().err().cloned();
            let keys = match failure {
                None => {
                    state.logged_errors.clear();
                    listener_keys(&info)
                }
                Some(err) => {
                    if state.logged_errors.insert(err.to_string()) {
                        error!(template = %self.template, "Error while processing template: {}", err);
                    }
                    if err.is_syntax() {
                        BTreeSet::new()
                    } else {
                        if let Some(previous) = &state.info {
                            info.merge_dependencies(previous);
                        }
                        listener_keys(&info)
                    }
                }
            };
            self.swap_listeners(&mut state, keys);

            let new = info.result.clone();
            let old = state.last_result.replace(new.clone());
            state.info = Some(info);
            match old {
                Some(old) if old != new => (old, new),
                _ => return Ok(()),
            }
        };

        trace!(template = %self.template, "Template result changed");
        (self.callback)(event, &self.template, &old, &new)
    }

    fn swap_listeners(self: &Arc<Self>, state: &mut TrackerState, keys: BTreeSet<ListenerKey>) {
        for key in &keys {
            if !state.listeners.contains_key(key) {
                trace!(template = %self.template, listener = %key, "Adding template listener");
                let handle = self.listen(key.clone());
                state.listeners.insert(key.clone(), handle);
            }
        }

        let stale: Vec<ListenerKey> = state
            .listeners
            .keys()
            .filter(|key| !keys.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = state.listeners.remove(&key) {
                trace!(template = %self.template, listener = %key, "Removing template listener");
                handle.cancel();
            }
        }
    }

    fn listen(self: &Arc<Self>, key: ListenerKey) -> CancelHandle {
        let tracker = Arc::clone(self);
        self.bus.listen_typed(move |event: &Event<StateChangedData>| {
            if !key.matches(&event.data.entity_id) {
                return Ok(());
            }
            tracker.update(Some(event), None)
        })
    }
}

/// Interpret a rendered template as a boolean
///
/// `true`, `yes`, `on`, `enable` and non-zero numbers are true; anything else
/// is false.
pub fn result_as_boolean(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "yes" | "on" | "enable" => true,
        other => other.parse::<f64>().is_ok_and(|n| n != 0.0),
    }
}

/// Track a template as a condition
///
/// `callback(entity_id, old_state, new_state)` fires only when the result
/// turns true after not being true. Render errors are logged by the tracker
/// and never delivered.
pub fn track_template_condition<F>(
    bus: Arc<EventBus>,
    renderer: Arc<dyn TemplateRenderer>,
    template: impl Into<String>,
    variables: Option<Variables>,
    callback: F,
) -> TemplateTracker
where
    F: Fn(Option<&EntityId>, Option<&State>, Option<&State>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    TemplateTracker::new(bus, renderer, template, variables, move |event, _, old, new| {
        let Ok(new) = new else {
            return Ok(());
        };
        if !result_as_boolean(new) {
            return Ok(());
        }
        if matches!(old, Ok(old) if result_as_boolean(old)) {
            return Ok(());
        }
        let data = event.map(|event| &event.data);
        callback(
            data.map(|d| &d.entity_id),
            data.and_then(|d| d.old_state.as_ref()),
            data.and_then(|d| d.new_state.as_ref()),
        )
    })
}
