//! Core configuration for the hub
//!
//! Reads the `homeassistant:` section of a YAML document: the location used
//! for sunrise/sunset, the local time zone used for time patterns and the
//! clock rollback policy. Missing keys fall back to defaults; values are
//! validated when the configuration is loaded.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::CoreConfig;
//!
//! let config = CoreConfig::load("/config/configuration.yaml")?;
//! let scheduler_config = config.scheduler_config()?;
//! ```

mod core_config;
mod error;

pub use core_config::CoreConfig;
pub use error::{ConfigError, ConfigResult};

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
