//! Error type for the hub facade

use ha_core::EntityIdError;
use ha_event_bus::EventBusError;
use ha_scheduler::SchedulerError;
use ha_state_store::StateStoreError;
use ha_template::TemplateError;
use thiserror::Error;

/// Errors surfaced by [`crate::HomeAssistant`] operations
#[derive(Debug, Error)]
pub enum HassError {
    #[error(transparent)]
    EntityId(#[from] EntityIdError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

/// Result type for hub operations
pub type HassResult<T> = Result<T, HassError>;
