//! The scheduler engine
//!
//! Timers live in a table keyed by id plus an ordered queue of
//! `(fire_at, id)`. Time only advances through `time_changed` events (or a
//! direct `tick()`), so the whole engine can be driven deterministically.
//!
//! A tick collects the due timers under the lock, releases it, invokes the
//! callbacks, then re-arms recurring timers. A timer whose cancel flag is set
//! is never invoked, even when it was already collected.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use ha_core::events::{CoreConfigUpdateData, TimeChangedData};
use ha_core::{CancelHandle, Event, SharedClock};
use ha_event_bus::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::sun::{next_sun_event, Location, SunEvent};
use crate::time_pattern::{floor_to_second, TimePattern};

/// Maximum number of pattern matches replayed by a single tick
const MAX_REPLAY: usize = 1_000;

/// Callback invoked when a timer fires, with the tick (or replayed match) instant
pub type TimerCallback = Box<dyn Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync>;

/// Identifier of a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a time pattern does when the clock signal moves backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockRollbackPolicy {
    /// Recompute the next match from the new instant without firing
    #[default]
    Reevaluate,
    /// Also fire once for every match between the new and the previous
    /// instant, and for every match skipped by a forward jump
    Replay,
}

/// Which clock a time pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternZone {
    /// The configured local time zone
    Local,
    Utc,
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub time_zone: Tz,
    pub location: Option<Location>,
    pub rollback: ClockRollbackPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            location: None,
            rollback: ClockRollbackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum TimerKind {
    PointInTime,
    Interval(Duration),
    Pattern {
        pattern: TimePattern,
        zone: PatternZone,
    },
    Sun {
        event: SunEvent,
        offset: Duration,
    },
}

impl TimerKind {
    fn name(&self) -> &'static str {
        match self {
            TimerKind::PointInTime => "point_in_time",
            TimerKind::Interval(_) => "interval",
            TimerKind::Pattern { .. } => "time_pattern",
            TimerKind::Sun { .. } => "sun",
        }
    }
}

struct Timer {
    id: TimerId,
    kind: TimerKind,
    cancelled: AtomicBool,
    callback: TimerCallback,
}

impl Timer {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn invoke(&self, instant: DateTime<Utc>) {
        trace!(timer = self.id.0, kind = self.kind.name(), %instant, "Firing scheduled callback");
        match panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(instant))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(timer = self.id.0, kind = self.kind.name(), "Error in scheduled callback: {:#}", err);
            }
            Err(_) => {
                error!(timer = self.id.0, kind = self.kind.name(), "Scheduled callback panicked");
            }
        }
    }
}

struct Slot {
    timer: Arc<Timer>,
    /// None while the timer is running or dormant
    fire_at: Option<DateTime<Utc>>,
    /// Last pattern match that fired
    last_match: Option<DateTime<Utc>>,
}

/// A collected firing: the timer, the instants to pass, and the candidate it
/// was due at (None for forced or replayed runs)
struct Run {
    timer: Arc<Timer>,
    instants: Vec<DateTime<Utc>>,
    due_at: Option<DateTime<Utc>>,
}

struct SchedulerState {
    timers: HashMap<TimerId, Slot>,
    queue: BTreeSet<(DateTime<Utc>, TimerId)>,
    last_tick: Option<DateTime<Utc>>,
    time_zone: Tz,
    location: Option<Location>,
    rollback: ClockRollbackPolicy,
}

impl SchedulerState {
    fn arm(&mut self, id: TimerId, fire_at: Option<DateTime<Utc>>) {
        let Some(slot) = self.timers.get_mut(&id) else {
            return;
        };
        if let Some(previous) = slot.fire_at.take() {
            self.queue.remove(&(previous, id));
        }
        slot.fire_at = fire_at;
        if let Some(at) = fire_at {
            self.queue.insert((at, id));
        }
    }

    fn disarm(&mut self, id: TimerId) {
        self.arm(id, None);
    }

    fn pattern_next(
        &self,
        pattern: &TimePattern,
        zone: PatternZone,
        start: DateTime<Utc>,
        last_match: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match zone {
            PatternZone::Local => pattern.next_fire(&self.time_zone, start, last_match),
            PatternZone::Utc => pattern.next_fire(&Utc, start, last_match),
        }
    }

    fn sun_next(&self, event: SunEvent, offset: Duration, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(location) = self.location else {
            debug!(%event, "No location configured, sun timer stays dormant");
            return None;
        };
        let next = next_sun_event(&location, event, offset, after);
        if next.is_none() {
            warn!(%event, latitude = location.latitude, "No upcoming {} at this location", event);
        }
        next
    }

    /// Every match of a pattern in `[from, to]`, capped
    fn matches_between(
        &self,
        pattern: &TimePattern,
        zone: PatternZone,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        mut last_match: Option<DateTime<Utc>>,
    ) -> Vec<DateTime<Utc>> {
        let mut matches = Vec::new();
        let mut start = from;
        while let Some(instant) = self.pattern_next(pattern, zone, start, last_match) {
            if instant > to {
                break;
            }
            if matches.len() == MAX_REPLAY {
                warn!(from = %from, to = %to, "Time pattern replay capped at {} matches", MAX_REPLAY);
                break;
            }
            matches.push(instant);
            last_match = Some(instant);
            start = instant + Duration::seconds(1);
        }
        matches
    }
}

/// Time-ordered callback engine
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    clock: SharedClock,
    next_id: AtomicU64,
    weak_self: Weak<Scheduler>,
    listeners: Mutex<Vec<CancelHandle>>,
}

impl Scheduler {
    /// Create a scheduler driven by `time_changed` events on `bus`
    ///
    /// It also follows `core_config_updated` events for location and time
    /// zone changes.
    pub fn new(bus: &Arc<EventBus>, config: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new_cyclic(|weak_self| Scheduler {
            state: Mutex::new(SchedulerState {
                timers: HashMap::new(),
                queue: BTreeSet::new(),
                last_tick: None,
                time_zone: config.time_zone,
                location: config.location,
                rollback: config.rollback,
            }),
            clock: bus.clock().clone(),
            next_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&scheduler);
        let time_listener = bus.listen_typed(move |event: &Event<TimeChangedData>| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.tick(event.data.now, event.data.fire_all);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&scheduler);
        let config_listener = bus.listen_typed(move |event: &Event<CoreConfigUpdateData>| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.apply_core_config(&event.data)?;
            }
            Ok(())
        });

        scheduler
            .listeners
            .lock()
            .extend([time_listener, config_listener]);
        scheduler
    }

    /// Fire `callback` once when the clock signal reaches or passes `at`
    pub fn track_point_in_time<F>(&self, at: DateTime<Utc>, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(TimerKind::PointInTime, Box::new(callback), |_, _| Some(at))
    }

    /// Fire `callback` once after `delay`
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.track_point_in_time(self.clock.now() + delay, callback)
    }

    /// Fire `callback` every `period`, starting one period from now
    ///
    /// Candidates advance from the previous candidate, so delivery does not
    /// drift; periods missed entirely are skipped, not replayed.
    pub fn track_interval<F>(&self, period: Duration, callback: F) -> SchedulerResult<CancelHandle>
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if period < Duration::milliseconds(1) {
            return Err(SchedulerError::InvalidInterval);
        }
        Ok(self.register(TimerKind::Interval(period), Box::new(callback), move |_, now| {
            Some(now + period)
        }))
    }

    /// Fire `callback` whenever the local wall-clock time matches `pattern`
    pub fn track_time_pattern<F>(&self, pattern: TimePattern, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.track_pattern(pattern, PatternZone::Local, Box::new(callback))
    }

    /// Fire `callback` whenever the UTC time matches `pattern`
    pub fn track_utc_time_pattern<F>(&self, pattern: TimePattern, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.track_pattern(pattern, PatternZone::Utc, Box::new(callback))
    }

    fn track_pattern(
        &self,
        pattern: TimePattern,
        zone: PatternZone,
        callback: TimerCallback,
    ) -> CancelHandle {
        let kind = TimerKind::Pattern {
            pattern: pattern.clone(),
            zone,
        };
        self.register(kind, callback, move |state, now| {
            state.pattern_next(&pattern, zone, now, None)
        })
    }

    /// Fire `callback` at every sunrise, shifted by `offset`
    pub fn track_sunrise<F>(&self, offset: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.track_sun(SunEvent::Sunrise, offset, Box::new(callback))
    }

    /// Fire `callback` at every sunset, shifted by `offset`
    pub fn track_sunset<F>(&self, offset: Duration, callback: F) -> CancelHandle
    where
        F: Fn(DateTime<Utc>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.track_sun(SunEvent::Sunset, offset, Box::new(callback))
    }

    fn track_sun(&self, event: SunEvent, offset: Duration, callback: TimerCallback) -> CancelHandle {
        self.register(TimerKind::Sun { event, offset }, callback, move |state, now| {
            state.sun_next(event, offset, now)
        })
    }

    fn register(
        &self,
        kind: TimerKind,
        callback: TimerCallback,
        first_fire: impl FnOnce(&SchedulerState, DateTime<Utc>) -> Option<DateTime<Utc>>,
    ) -> CancelHandle {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let timer = Arc::new(Timer {
            id,
            kind,
            cancelled: AtomicBool::new(false),
            callback,
        });
        let now = self.clock.now();

        {
            let mut state = self.state.lock();
            let fire_at = first_fire(&state, now);
            debug!(timer = id.0, kind = timer.kind.name(), fire_at = ?fire_at, "Scheduling callback");
            state.timers.insert(
                id,
                Slot {
                    timer: timer.clone(),
                    fire_at: None,
                    last_match: None,
                },
            );
            state.arm(id, fire_at);
        }

        let weak_timer = Arc::downgrade(&timer);
        let weak_self = self.weak_self.clone();
        CancelHandle::new(move || {
            if let Some(timer) = weak_timer.upgrade() {
                timer.cancelled.store(true, Ordering::Release);
            }
            if let Some(scheduler) = weak_self.upgrade() {
                scheduler.remove(id);
            }
        })
    }

    fn remove(&self, id: TimerId) {
        let mut state = self.state.lock();
        state.disarm(id);
        if state.timers.remove(&id).is_some() {
            trace!(timer = id.0, "Cancelled scheduled callback");
        }
    }

    /// Advance the scheduler to `now`
    ///
    /// `fire_all` forces every pending time pattern to fire once at this tick.
    pub fn tick(&self, now: DateTime<Utc>, fire_all: bool) {
        let runs = self.collect(now, fire_all);
        if runs.is_empty() {
            return;
        }

        for run in &runs {
            for instant in &run.instants {
                if run.timer.is_cancelled() {
                    break;
                }
                run.timer.invoke(*instant);
            }
        }

        self.rearm(now, runs);
    }

    fn collect(&self, now: DateTime<Utc>, fire_all: bool) -> Vec<Run> {
        let mut state = self.state.lock();
        let mut runs = Vec::new();
        let previous = state.last_tick.replace(now);

        if fire_all {
            let ids: Vec<TimerId> = state
                .timers
                .iter()
                .filter(|(_, slot)| matches!(slot.timer.kind, TimerKind::Pattern { .. }))
                .filter(|(_, slot)| slot.fire_at.is_some())
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                state.disarm(id);
                if let Some(slot) = state.timers.get(&id) {
                    runs.push(Run {
                        timer: slot.timer.clone(),
                        instants: vec![now],
                        due_at: None,
                    });
                }
            }
        } else if let Some(previous) = previous.filter(|previous| now < *previous) {
            debug!(%previous, %now, "Clock signal moved backwards");
            self.rollback(&mut state, previous, now, &mut runs);
        }

        let replay = state.rollback == ClockRollbackPolicy::Replay;
        while let Some(&(at, id)) = state.queue.first() {
            if at > now {
                break;
            }
            state.disarm(id);
            let Some(slot) = state.timers.get(&id) else {
                continue;
            };
            let timer = slot.timer.clone();
            let instants = match &timer.kind {
                TimerKind::Pattern { pattern, zone } if replay => {
                    let mut matches = state.matches_between(pattern, *zone, at, now, slot.last_match);
                    if matches.is_empty() {
                        matches.push(at);
                    }
                    matches
                }
                _ => vec![now],
            };
            if matches!(timer.kind, TimerKind::PointInTime) {
                state.timers.remove(&id);
            }
            runs.push(Run {
                timer,
                instants,
                due_at: Some(at),
            });
        }

        runs
    }

    fn rollback(
        &self,
        state: &mut SchedulerState,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
        runs: &mut Vec<Run>,
    ) {
        let replay = state.rollback == ClockRollbackPolicy::Replay;
        let patterns: Vec<(TimerId, Arc<Timer>)> = state
            .timers
            .iter()
            .filter(|(_, slot)| matches!(slot.timer.kind, TimerKind::Pattern { .. }))
            .map(|(id, slot)| (*id, slot.timer.clone()))
            .collect();

        for (id, timer) in patterns {
            let TimerKind::Pattern { pattern, zone } = &timer.kind else {
                continue;
            };

            if replay {
                // Strictly between the new and the previous instant
                let after_now = now + Duration::nanoseconds(1);
                let matches: Vec<DateTime<Utc>> = state
                    .matches_between(pattern, *zone, after_now, previous, None)
                    .into_iter()
                    .filter(|instant| *instant < previous)
                    .collect();
                if !matches.is_empty() {
                    debug!(timer = id.0, replayed = matches.len(), "Replaying time pattern matches");
                    state.disarm(id);
                    runs.push(Run {
                        timer: timer.clone(),
                        instants: matches,
                        due_at: None,
                    });
                    continue;
                }
            }

            let fire_at = state.pattern_next(pattern, *zone, now, None);
            if let Some(slot) = state.timers.get_mut(&id) {
                slot.last_match = None;
            }
            state.arm(id, fire_at);
        }
    }

    fn rearm(&self, now: DateTime<Utc>, runs: Vec<Run>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let replay = state.rollback == ClockRollbackPolicy::Replay;

        for run in runs {
            let id = run.timer.id;
            if run.timer.is_cancelled() {
                continue;
            }
            let Some(slot) = state.timers.get_mut(&id) else {
                continue;
            };
            if slot.fire_at.is_some() {
                // Already re-armed while the callback ran
                continue;
            }
            if let Some(due_at) = run.due_at {
                slot.last_match = if replay {
                    run.instants.last().copied().or(Some(due_at))
                } else {
                    Some(due_at)
                };
            }
            let last_match = slot.last_match;

            let next = match &run.timer.kind {
                TimerKind::PointInTime => None,
                TimerKind::Interval(period) => {
                    Some(next_interval(run.due_at.unwrap_or(now), *period, now))
                }
                TimerKind::Pattern { pattern, zone } => {
                    // Matches are whole seconds; every one up to `now` was consumed
                    let start = floor_to_second(now) + Duration::seconds(1);
                    state.pattern_next(pattern, *zone, start, last_match)
                }
                TimerKind::Sun { event, offset } => state.sun_next(*event, *offset, now),
            };
            state.arm(id, next);
        }
    }

    /// Apply a location and/or time zone change
    fn apply_core_config(&self, update: &CoreConfigUpdateData) -> SchedulerResult<()> {
        let (location, time_zone) = self.resolve_core_config(update)?;
        if let Some(location) = location {
            self.set_location(Some(location));
        }
        if let Some(time_zone) = time_zone {
            self.set_time_zone(time_zone);
        }
        Ok(())
    }

    /// Validate a config update against the current settings
    ///
    /// Returns the location and time zone the update would switch to; fields
    /// absent from the update keep their current value.
    pub fn resolve_core_config(
        &self,
        update: &CoreConfigUpdateData,
    ) -> SchedulerResult<(Option<Location>, Option<Tz>)> {
        let mut location = None;
        if update.latitude.is_some() || update.longitude.is_some() || update.elevation.is_some() {
            location = Some(match (self.location(), update.latitude, update.longitude) {
                (Some(current), latitude, longitude) => Location::new(
                    latitude.unwrap_or(current.latitude),
                    longitude.unwrap_or(current.longitude),
                    update.elevation.unwrap_or(current.elevation),
                )?,
                (None, Some(latitude), Some(longitude)) => {
                    Location::new(latitude, longitude, update.elevation.unwrap_or(0.0))?
                }
                (None, _, _) => {
                    return Err(SchedulerError::InvalidLocation(
                        "latitude and longitude are both required".to_string(),
                    ))
                }
            });
        }

        let time_zone = match &update.time_zone {
            Some(name) => Some(
                name.parse::<Tz>()
                    .map_err(|_| SchedulerError::UnknownTimeZone(name.clone()))?,
            ),
            None => None,
        };
        Ok((location, time_zone))
    }

    /// Change the observer location and recompute every sun timer from now
    pub fn set_location(&self, location: Option<Location>) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.location = location;
        info!(location = ?location, "Location updated, recomputing sun timers");

        let sun_timers: Vec<(TimerId, SunEvent, Duration)> = state
            .timers
            .iter()
            .filter_map(|(id, slot)| match slot.timer.kind {
                TimerKind::Sun { event, offset } => Some((*id, event, offset)),
                _ => None,
            })
            .collect();
        for (id, event, offset) in sun_timers {
            let next = state.sun_next(event, offset, now);
            state.arm(id, next);
        }
    }

    /// Change the local time zone and recompute every local time pattern
    pub fn set_time_zone(&self, time_zone: Tz) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.time_zone = time_zone;
        info!(time_zone = %time_zone, "Time zone updated, recomputing local time patterns");

        let local_patterns: Vec<(TimerId, TimePattern)> = state
            .timers
            .iter()
            .filter_map(|(id, slot)| match &slot.timer.kind {
                TimerKind::Pattern {
                    pattern,
                    zone: PatternZone::Local,
                } => Some((*id, pattern.clone())),
                _ => None,
            })
            .collect();
        for (id, pattern) in local_patterns {
            let next = state.pattern_next(&pattern, PatternZone::Local, now, None);
            state.arm(id, next);
        }
    }

    pub fn set_rollback_policy(&self, policy: ClockRollbackPolicy) {
        self.state.lock().rollback = policy;
    }

    pub fn location(&self) -> Option<Location> {
        self.state.lock().location
    }

    pub fn time_zone(&self) -> Tz {
        self.state.lock().time_zone
    }

    /// Number of registered timers (armed or dormant)
    pub fn timer_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// The earliest armed fire time
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().queue.first().map(|(at, _)| *at)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for listener in self.listeners.lock().drain(..) {
            listener.cancel();
        }
    }
}

/// The first `base + k * period` strictly after `now`
fn next_interval(base: DateTime<Utc>, period: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let period_ms = period.num_milliseconds().max(1);
    let elapsed_ms = (now - base).num_milliseconds().max(0);
    let periods = elapsed_ms / period_ms + 1;
    base + Duration::milliseconds(period_ms.saturating_mul(periods))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 24, h, m, s).unwrap()
    }

    #[test]
    fn test_next_interval_skips_missed_periods() {
        let base = at(12, 0, 10);
        let period = Duration::seconds(10);

        assert_eq!(next_interval(base, period, at(12, 0, 13)), at(12, 0, 20));
        assert_eq!(next_interval(base, period, at(12, 0, 20)), at(12, 0, 30));
        assert_eq!(next_interval(base, period, at(12, 20, 0)), at(12, 20, 10));
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        let policy: ClockRollbackPolicy = serde_json::from_str("\"replay\"").unwrap();
        assert_eq!(policy, ClockRollbackPolicy::Replay);
        assert_eq!(ClockRollbackPolicy::default(), ClockRollbackPolicy::Reevaluate);
    }
}
