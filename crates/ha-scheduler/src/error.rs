//! Error types for the scheduler

use thiserror::Error;

/// Errors that can occur when registering scheduled callbacks
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("Invalid {field} pattern '{value}': {reason}")]
    InvalidTimePattern {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Unknown time zone: {0}")]
    UnknownTimeZone(String),

    #[error("Interval period must be positive")]
    InvalidInterval,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
