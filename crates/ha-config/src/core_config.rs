//! Core hub configuration
//!
//! Parses the `homeassistant:` section from configuration.yaml

use std::fs;
use std::path::Path;

use chrono_tz::Tz;
use ha_scheduler::{ClockRollbackPolicy, Location, SchedulerConfig};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Core configuration from the `homeassistant:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Name of the location (e.g., "Home")
    #[serde(default = "default_name")]
    pub name: String,

    /// Latitude of the location; sunrise/sunset tracking needs both
    /// coordinates
    #[serde(default)]
    pub latitude: Option<f64>,

    #[serde(default)]
    pub longitude: Option<f64>,

    /// Elevation in meters
    #[serde(default)]
    pub elevation: f64,

    /// IANA time zone (e.g., "Europe/Amsterdam")
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// What time patterns do when the clock moves backwards
    #[serde(default)]
    pub clock_rollback: ClockRollbackPolicy,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            latitude: None,
            longitude: None,
            elevation: 0.0,
            time_zone: default_time_zone(),
            clock_rollback: ClockRollbackPolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Load and validate the core configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration file: {:?}", path);

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let yaml: Value = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_yaml(&yaml)
    }

    /// Parse and validate the core configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let yaml: Value = serde_yaml::from_str(content)?;
        Self::from_yaml(&yaml)
    }

    /// Parse and validate the core configuration from a YAML value
    ///
    /// An empty document or a missing `homeassistant:` section yields the
    /// defaults.
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let section = match yaml {
            Value::Null => Value::Null,
            Value::Mapping(mapping) => mapping
                .get("homeassistant")
                .cloned()
                .unwrap_or(Value::Null),
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        let config = match section {
            Value::Null => CoreConfig::default(),
            section => serde_yaml::from_value(section).map_err(|e| ConfigError::InvalidValue {
                key: "homeassistant".to_string(),
                reason: e.to_string(),
            })?,
        };

        config.scheduler_config()?;
        Ok(config)
    }

    /// The configured location, if both coordinates are set
    pub fn location(&self) -> ConfigResult<Option<Location>> {
        match (self.latitude, self.longitude) {
            (None, None) => Ok(None),
            (Some(latitude), Some(longitude)) => Location::new(latitude, longitude, self.elevation)
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: "latitude/longitude".to_string(),
                    reason: e.to_string(),
                }),
            (Some(_), None) => Err(ConfigError::InvalidValue {
                key: "longitude".to_string(),
                reason: "latitude is set without a longitude".to_string(),
            }),
            (None, Some(_)) => Err(ConfigError::InvalidValue {
                key: "latitude".to_string(),
                reason: "longitude is set without a latitude".to_string(),
            }),
        }
    }

    pub fn time_zone(&self) -> ConfigResult<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidValue {
                key: "time_zone".to_string(),
                reason: format!("unknown time zone '{}'", self.time_zone),
            })
    }

    /// Scheduler settings derived from this configuration
    pub fn scheduler_config(&self) -> ConfigResult<SchedulerConfig> {
        Ok(SchedulerConfig {
            time_zone: self.time_zone()?,
            location: self.location()?,
            rollback: self.clock_rollback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.name, "Home");
        assert_eq!(config.latitude, None);
        assert_eq!(config.time_zone, "UTC");

        let scheduler = config.scheduler_config().unwrap();
        assert_eq!(scheduler.time_zone, Tz::UTC);
        assert!(scheduler.location.is_none());
        assert_eq!(scheduler.rollback, ClockRollbackPolicy::Reevaluate);
    }

    #[test]
    fn test_parse_from_yaml() {
        let config = CoreConfig::from_yaml_str(
            r#"
homeassistant:
  name: Test Home
  latitude: 51.5074
  longitude: -0.1278
  elevation: 11
  time_zone: Europe/London
  clock_rollback: replay
"#,
        )
        .unwrap();

        assert_eq!(config.name, "Test Home");
        assert_eq!(config.time_zone().unwrap(), Tz::Europe__London);
        assert_eq!(config.clock_rollback, ClockRollbackPolicy::Replay);

        let location = config.location().unwrap().unwrap();
        assert_eq!(location.latitude, 51.5074);
        assert_eq!(location.longitude, -0.1278);
        assert_eq!(location.elevation, 11.0);
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        assert_eq!(CoreConfig::from_yaml_str("").unwrap(), CoreConfig::default());
        assert_eq!(
            CoreConfig::from_yaml_str("automation: []\n").unwrap(),
            CoreConfig::default()
        );
        assert_eq!(
            CoreConfig::from_yaml_str("homeassistant:\n").unwrap(),
            CoreConfig::default()
        );
    }

    #[test]
    fn test_invalid_values_fail_at_load() {
        let err = CoreConfig::from_yaml_str("homeassistant:\n  time_zone: Mars/Olympus_Mons\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "time_zone"));

        let err = CoreConfig::from_yaml_str("homeassistant:\n  latitude: 52.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "longitude"));

        let err = CoreConfig::from_yaml_str(
            "homeassistant:\n  latitude: 123.0\n  longitude: 4.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = CoreConfig::from_yaml_str("homeassistant:\n  clock_rollback: rewind\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "homeassistant"));
    }

    #[test]
    fn test_root_must_be_a_mapping() {
        assert!(matches!(
            CoreConfig::from_yaml_str("- homeassistant\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            CoreConfig::from_yaml_str("homeassistant: [unclosed\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "homeassistant:\n  latitude: 52.37\n  longitude: 4.89\n  time_zone: Europe/Amsterdam"
        )
        .unwrap();

        let config = CoreConfig::load(file.path()).unwrap();
        assert_eq!(config.time_zone().unwrap(), Tz::Europe__Amsterdam);
        assert!(config.location().unwrap().is_some());
    }

    #[test]
    fn test_load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("configuration.yaml");
        assert!(matches!(
            CoreConfig::load(&missing),
            Err(ConfigError::ReadFile { ref path, .. }) if path == &missing
        ));

        let broken = dir.path().join("broken.yaml");
        fs::write(&broken, "homeassistant: [unclosed\n").unwrap();
        assert!(matches!(
            CoreConfig::load(&broken),
            Err(ConfigError::ParseYaml { ref path, .. }) if path == &broken
        ));
    }
}
