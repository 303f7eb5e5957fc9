//! Home automation hub server
//!
//! Loads the core configuration, builds the hub and drives its clock until
//! ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ha_config::CoreConfig;
use ha_event_helpers::HomeAssistant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration file, overridable with `HA_CONFIG`
const DEFAULT_CONFIG_PATH: &str = "configuration.yaml";

fn load_config() -> Result<CoreConfig> {
    let path = std::env::var_os("HA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if !path.exists() {
        info!("No configuration at {:?}, using defaults", path);
        return Ok(CoreConfig::default());
    }
    CoreConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("Starting Home Assistant (Rust)");

    let config = load_config()?;
    let hass = HomeAssistant::new(config.scheduler_config()?);
    info!(
        location = %config.name,
        time_zone = %config.time_zone,
        "Home Assistant initialized"
    );

    hass.start_clock()?;
    info!("Home Assistant is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    hass.stop();
    hass.drain().await;

    Ok(())
}
