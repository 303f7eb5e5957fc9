//! Time scheduling for Home Assistant
//!
//! This crate provides the Scheduler: one-shot timers, fixed intervals,
//! cron-like time patterns (local or UTC) and sunrise/sunset tracking. The
//! scheduler never sleeps; it is driven by `time_changed` events fired on
//! the event bus.

mod error;
mod scheduler;
pub mod sun;
pub mod time_pattern;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{
    ClockRollbackPolicy, PatternZone, Scheduler, SchedulerConfig, TimerCallback, TimerId,
};
pub use sun::{Location, SunEvent};
pub use time_pattern::{FieldMatch, TimeField, TimePattern};

/// Re-export of the IANA time zone type used for local time patterns
pub use chrono_tz::Tz;
