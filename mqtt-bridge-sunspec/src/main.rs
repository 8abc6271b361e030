//! MQTT bridge for SunSpec devices.
//!
//! This bridge discovers the SunSpec models of Modbus devices (TCP or
//! RTU/serial), polls them and publishes decoded values to MQTT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_bridge_sunspec::config::SunSpecBridgeConfig;
use mqtt_bridge_sunspec::poller::DevicePoller;
use mqtt_bridge_sunspec::publisher::Publisher;
use mqtt_bridge_sunspec::status::{self, BridgeStatus};
use sunspec_common::TopicBuilder;
use sunspec_modbus::ModelDictionary;
use tracing::{error, info, warn};

/// MQTT bridge for SunSpec devices over Modbus (TCP/RTU).
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-sunspec")]
#[command(about = "Polls SunSpec devices and publishes to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "sunspec.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration (file, then environment overrides)
    let config = SunSpecBridgeConfig::load(&args.config, |key| std::env::var(key).ok())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    sunspec_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-sunspec");

    // Model dictionary: built-in models plus configured extras
    let mut dictionary = ModelDictionary::with_builtin();
    for path in &config.model_paths {
        dictionary
            .load_file(path)
            .with_context(|| format!("Failed to load model definitions from {:?}", path))?;
    }
    let dictionary = Arc::new(dictionary);
    info!(models = dictionary.len(), "Model dictionary loaded");

    // Connect to MQTT
    let mqtt = if config.mqtt.enabled {
        let qos = sunspec_common::mqtt::qos_from_level(config.mqtt.qos)?;
        let will = status::last_will(&TopicBuilder::new(&config.mqtt.topic_prefix), qos);
        let (client, handle) = sunspec_common::mqtt::connect(&config.mqtt, Some(will))?;
        Some((client, handle))
    } else {
        warn!("MQTT disabled, data will only be logged");
        None
    };

    let publisher = Publisher::new(
        mqtt.as_ref().map(|(client, _)| client.clone()),
        &config.mqtt,
        config.serialization,
    )?;

    // Publish bridge status
    let devices: Vec<&str> = config.devices.iter().map(|d| d.name.as_str()).collect();
    let running = BridgeStatus::running().with("devices", serde_json::json!(devices));
    if let Err(e) = publisher.publish_status(&running).await {
        error!(error = %e, "Failed to publish bridge status");
    }

    // Start pollers for each device
    let mut tasks = Vec::new();

    for device in &config.devices {
        let poller = DevicePoller::new(device.clone(), dictionary.clone(), publisher.clone());
        let name = device.name.clone();

        tasks.push(tokio::spawn(async move {
            if let Err(e) = poller.run().await {
                error!(device = %name, error = %e, "Poller stopped");
            }
        }));
    }

    info!(devices = config.devices.len(), "SunSpec bridge running");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Cancel all poller tasks
    for task in tasks {
        task.abort();
    }

    // Publish offline status
    if let Err(e) = publisher.publish_status(&BridgeStatus::offline()).await {
        warn!(error = %e, "Failed to publish offline status");
    }

    if let Some((client, handle)) = mqtt {
        client
            .disconnect()
            .await
            .context("Failed to disconnect from MQTT broker")?;
        let _ = handle.await;
    }

    info!("SunSpec bridge stopped");

    Ok(())
}
