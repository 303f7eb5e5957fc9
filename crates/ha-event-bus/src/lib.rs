//! Event bus with synchronous pub/sub for Home Assistant
//!
//! This crate provides the EventBus, the central message broker of the
//! reactive core. Components register callbacks for an event type (or for
//! every event via MATCH_ALL) and fire events to communicate.
//!
//! Dispatch is synchronous and FIFO: an event fired from inside a listener is
//! queued and delivered after the current event has reached every listener.
//! A listener only sees events fired after it was registered.

use dashmap::DashMap;
use ha_core::{CancelHandle, Clock, Event, EventData, EventOrigin, EventType, SharedClock, SystemClock};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Errors raised by the event bus
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("no tokio runtime available to run the job")]
    NoRuntime,
}

/// A unique identifier for an event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Callback = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
type ListenerTable = DashMap<EventType, Vec<Arc<ListenerEntry>>>;

struct ListenerEntry {
    id: ListenerId,
    /// Key the listener is registered under (possibly MATCH_ALL)
    event_type: EventType,
    once: bool,
    active: AtomicBool,
    callback: Callback,
}

struct QueuedEvent {
    event: Event,
    /// Only listeners with an id below this value receive the event
    horizon: u64,
}

/// The event bus for publishing and subscribing to events
///
/// The EventBus supports:
/// - Listening to specific event types
/// - Listening to all events (MATCH_ALL)
/// - Firing events to all listeners, in registration order
/// - Typed listeners for type-safe event handling
/// - Tracking async jobs so `drain()` can wait for everything to settle
pub struct EventBus {
    /// Map of event types (including MATCH_ALL) to their listeners
    listeners: Arc<ListenerTable>,
    /// Counter for generating unique listener IDs
    next_listener_id: AtomicU64,
    /// Events waiting to be dispatched
    queue: Mutex<VecDeque<QueuedEvent>>,
    /// Set while some caller is draining the queue
    dispatching: AtomicBool,
    /// Async jobs spawned on behalf of listeners
    jobs: Mutex<Vec<JoinHandle<()>>>,
    clock: SharedClock,
}

impl EventBus {
    /// Create a new event bus stamping events with wall-clock time
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new event bus stamping events from the given clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_listener_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            jobs: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// The clock used to stamp events
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Listen to events of a specific type (or MATCH_ALL)
    ///
    /// The returned handle removes the listener; cancelling is idempotent and
    /// takes effect before the next listener invocation.
    pub fn listen<F>(&self, event_type: impl Into<EventType>, callback: F) -> CancelHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event_type.into(), false, Box::new(callback))
    }

    /// Listen to the next event of a type, then unsubscribe automatically
    pub fn listen_once<F>(&self, event_type: impl Into<EventType>, callback: F) -> CancelHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event_type.into(), true, Box::new(callback))
    }

    /// Listen to every event
    pub fn listen_all<F>(&self, callback: F) -> CancelHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(EventType::match_all(), callback)
    }

    /// Listen to a typed event
    ///
    /// Events whose payload does not deserialize into `T` are skipped.
    pub fn listen_typed<T, F>(&self, callback: F) -> CancelHandle
    where
        T: EventData + serde::de::DeserializeOwned,
        F: Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listen(T::event_type(), move |event: &Event| {
            let data: T = match event.parse_data() {
                Ok(data) => data,
                Err(err) => {
                    debug!(event_type = %event.event_type, error = %err, "Skipping malformed typed event");
                    return Ok(());
                }
            };
            callback(&Event {
                event_type: event.event_type.clone(),
                data,
                origin: event.origin,
                time_fired: event.time_fired,
            })
        })
    }

    fn register(&self, event_type: EventType, once: bool, callback: Callback) -> CancelHandle {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        trace!(event_type = %event_type, listener = id.0, "Adding listener");

        let entry = Arc::new(ListenerEntry {
            id,
            event_type: event_type.clone(),
            once,
            active: AtomicBool::new(true),
            callback,
        });
        self.listeners
            .entry(event_type.clone())
            .or_default()
            .push(entry.clone());

        let table = Arc::downgrade(&self.listeners);
        CancelHandle::new(move || {
            entry.active.store(false, Ordering::Release);
            if let Some(table) = table.upgrade() {
                detach(&table, &event_type, id);
            }
        })
    }

    /// Fire an event to all listeners
    ///
    /// The event will be delivered to:
    /// 1. All listeners of the specific event type
    /// 2. All MATCH_ALL listeners
    ///
    /// in the order they were registered.
    pub fn fire(&self, event_type: impl Into<EventType>, data: serde_json::Value) {
        self.fire_event(Event::new(event_type, data, self.clock.now()));
    }

    /// Fire an event that originated elsewhere
    pub fn fire_with_origin(
        &self,
        event_type: impl Into<EventType>,
        data: serde_json::Value,
        origin: EventOrigin,
    ) {
        self.fire_event(Event::new(event_type, data, self.clock.now()).with_origin(origin));
    }

    /// Fire a typed event
    ///
    /// A payload that fails to serialize is logged and not fired.
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T) {
        match serde_json::to_value(&data) {
            Ok(json_data) => self.fire(T::event_type(), json_data),
            Err(err) => {
                error!(event_type = T::event_type(), "Failed to serialize event data: {}", err);
            }
        }
    }

    /// Queue a pre-built event and dispatch the queue
    pub fn fire_event(&self, event: Event) {
        debug!(event_type = %event.event_type, "Firing event");
        let horizon = self.next_listener_id.load(Ordering::SeqCst);
        self.queue.lock().push_back(QueuedEvent { event, horizon });
        self.process_queue();
    }

    /// Dispatch queued events until the queue is empty
    ///
    /// Returns immediately when another caller is already dispatching; that
    /// caller picks the queued events up.
    fn process_queue(&self) {
        loop {
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(queued) => self.dispatch(&queued),
                    None => break,
                }
            }
            self.dispatching.store(false, Ordering::Release);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, queued: &QueuedEvent) {
        let event = &queued.event;
        let mut targets: Vec<Arc<ListenerEntry>> = Vec::new();
        if let Some(list) = self.listeners.get(&event.event_type) {
            targets.extend(list.iter().cloned());
        }
        if !event.event_type.is_match_all() {
            if let Some(list) = self.listeners.get(&EventType::match_all()) {
                targets.extend(list.iter().cloned());
            }
        }
        targets.retain(|listener| listener.id.0 < queued.horizon);
        targets.sort_by_key(|listener| listener.id);

        trace!(event_type = %event.event_type, listeners = targets.len(), "Dispatching event");

        for listener in targets {
            if listener.once {
                if !listener.active.swap(false, Ordering::AcqRel) {
                    continue;
                }
                detach(&self.listeners, &listener.event_type, listener.id);
            } else if !listener.active.load(Ordering::Acquire) {
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        event_type = %event.event_type,
                        listener = listener.id.0,
                        "Error in event listener: {:#}",
                        err
                    );
                }
                Err(payload) => {
                    error!(
                        event_type = %event.event_type,
                        listener = listener.id.0,
                        "Event listener panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }

    /// Run an async job on the current tokio runtime and track it for `drain()`
    pub fn spawn_job<F>(&self, job: F) -> Result<(), EventBusError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EventBusError::NoRuntime)?;
        let handle = runtime.spawn(job);
        let mut jobs = self.jobs.lock();
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle);
        Ok(())
    }

    /// Wait until the dispatch queue and every tracked job have settled
    ///
    /// Jobs spawned while draining (including by listeners reacting to events
    /// fired by other jobs) are awaited too.
    pub async fn drain(&self) {
        loop {
            self.process_queue();
            let jobs = std::mem::take(&mut *self.jobs.lock());
            if jobs.is_empty() {
                if self.queue.lock().is_empty() {
                    return;
                }
                tokio::task::yield_now().await;
                continue;
            }
            for job in jobs {
                if let Err(err) = job.await {
                    if err.is_panic() {
                        error!("Background job panicked: {}", err);
                    }
                }
            }
        }
    }

    /// Number of listeners registered for an event type
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .get(&EventType::new(event_type))
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Listener counts by event type
    pub fn listener_counts(&self) -> HashMap<String, usize> {
        self.listeners
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn detach(table: &ListenerTable, event_type: &EventType, id: ListenerId) {
    if let Some(mut list) = table.get_mut(event_type) {
        list.retain(|listener| listener.id != id);
    }
    table.remove_if(event_type, |_, list| list.is_empty());
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
