//! Configuration for the SunSpec bridge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sunspec_common::{Format, LoggingConfig, MqttConfig};
use sunspec_modbus::device::DEFAULT_BASE_ADDRESSES;
use sunspec_modbus::port::MAX_READ_COUNT;
use sunspec_modbus::{Connection, ModbusSettings, RegisterKind, ScanOptions};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Invalid value '{value}' for {var}")]
    Env { var: String, value: String },
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunSpecBridgeConfig {
    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Payload format of the data topic
    #[serde(default)]
    pub serialization: Format,

    /// Extra model definition files, loaded on top of the built-in models
    #[serde(default)]
    pub model_paths: Vec<PathBuf>,

    /// Devices to poll
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for SunSpecBridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            logging: LoggingConfig::default(),
            serialization: Format::default(),
            model_paths: Vec::new(),
            devices: vec![DeviceConfig::default()],
        }
    }
}

/// Configuration for a single SunSpec device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in topics)
    pub name: String,

    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Candidate addresses of the SunSpec identifier
    #[serde(default = "default_base_addresses")]
    pub base_addresses: Vec<u16>,

    /// Largest number of registers per read request
    #[serde(default = "default_max_read_count")]
    pub max_read_count: u16,

    /// Register table holding the SunSpec map
    #[serde(default)]
    pub register_kind: RegisterKind,
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_base_addresses() -> Vec<u16> {
    DEFAULT_BASE_ADDRESSES.to_vec()
}

fn default_max_read_count() -> u16 {
    MAX_READ_COUNT
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "sunspec".to_string(),
            connection: ConnectionConfig::tcp_default(),
            unit_id: default_unit_id(),
            poll_interval_secs: default_poll_interval(),
            timeout_ms: default_timeout_ms(),
            base_addresses: default_base_addresses(),
            max_read_count: default_max_read_count(),
            register_kind: RegisterKind::default(),
        }
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            base_addresses: self.base_addresses.clone(),
            max_read_count: self.max_read_count,
        }
    }

    /// Modbus port settings, `None` for register dumps.
    pub fn modbus_settings(&self) -> Option<ModbusSettings> {
        let connection = match &self.connection {
            ConnectionConfig::Tcp { host, port } => Connection::tcp(host.clone(), *port),
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => Connection::Rtu {
                port: port.clone(),
                baud_rate: *baud_rate,
                data_bits: *data_bits,
                parity: parity.clone(),
                stop_bits: *stop_bits,
            },
            ConnectionConfig::Dump { .. } => return None,
        };

        Some(
            ModbusSettings::new(connection, self.unit_id)
                .with_timeout(Duration::from_millis(self.timeout_ms))
                .with_register_kind(self.register_kind),
        )
    }
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        #[serde(default = "default_modbus_host")]
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        #[serde(default = "default_serial_port")]
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// Register dump file replayed in memory
    Dump { path: PathBuf },
}

fn default_modbus_host() -> String {
    "192.168.1.100".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl ConnectionConfig {
    fn rtu_default() -> Self {
        ConnectionConfig::Rtu {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
        }
    }

    fn tcp_default() -> Self {
        ConnectionConfig::Tcp {
            host: default_modbus_host(),
            port: default_modbus_port(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

impl SunSpecBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SunSpecBridgeConfig = json5::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults, then apply
    /// environment overrides and validate.
    pub fn load<F>(path: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides to the MQTT settings and the first device.
    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("MQTT_ENABLED") {
            self.mqtt.enabled = parse_bool("MQTT_ENABLED", &v)?;
        }
        if let Some(v) = env("MQTT_BROKER") {
            self.mqtt.host = v;
        }
        if let Some(v) = env("MQTT_PORT") {
            self.mqtt.port = parse_env("MQTT_PORT", &v)?;
        }
        if let Some(v) = env("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = env("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = env("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = v;
        }

        const DEVICE_VARS: [&str; 7] = [
            "MODBUS_TYPE",
            "MODBUS_HOST",
            "MODBUS_PORT",
            "MODBUS_SLAVE_ID",
            "SERIAL_PORT",
            "SERIAL_BAUDRATE",
            "POLLING_INTERVAL",
        ];
        if !DEVICE_VARS.iter().any(|&var| env(var).is_some()) {
            return Ok(());
        }
        if self.devices.is_empty() {
            self.devices.push(DeviceConfig::default());
        }
        let device = &mut self.devices[0];

        if let Some(v) = env("MODBUS_TYPE") {
            let switch_to = match v.trim().to_lowercase().as_str() {
                "tcp" if !matches!(device.connection, ConnectionConfig::Tcp { .. }) => {
                    Some(ConnectionConfig::tcp_default())
                }
                "rtu" if !matches!(device.connection, ConnectionConfig::Rtu { .. }) => {
                    Some(ConnectionConfig::rtu_default())
                }
                "tcp" | "rtu" => None,
                _ => {
                    return Err(ConfigError::Env {
                        var: "MODBUS_TYPE".to_string(),
                        value: v,
                    });
                }
            };
            if let Some(connection) = switch_to {
                device.connection = connection;
            }
        }

        match &mut device.connection {
            ConnectionConfig::Tcp { host, port } => {
                if let Some(v) = env("MODBUS_HOST") {
                    *host = v;
                }
                if let Some(v) = env("MODBUS_PORT") {
                    *port = parse_env("MODBUS_PORT", &v)?;
                }
            }
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => {
                if let Some(v) = env("SERIAL_PORT") {
                    *port = v;
                }
                if let Some(v) = env("SERIAL_BAUDRATE") {
                    *baud_rate = parse_env("SERIAL_BAUDRATE", &v)?;
                }
            }
            ConnectionConfig::Dump { .. } => {}
        }

        if let Some(v) = env("MODBUS_SLAVE_ID") {
            device.unit_id = parse_env("MODBUS_SLAVE_ID", &v)?;
        }
        if let Some(v) = env("POLLING_INTERVAL") {
            device.poll_interval_secs = parse_env("POLLING_INTERVAL", &v)?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        sunspec_common::validate_prefix(&self.mqtt.topic_prefix)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        sunspec_common::mqtt::qos_from_level(self.mqtt.qos)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Device name cannot be empty".to_string(),
                ));
            }

            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }

            let is_modbus = !matches!(device.connection, ConnectionConfig::Dump { .. });
            if is_modbus && !(1..=247).contains(&device.unit_id) {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': unit_id must be 1-247",
                    device.name
                )));
            }

            if device.poll_interval_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': poll_interval_secs must be greater than 0",
                    device.name
                )));
            }

            if device.max_read_count == 0 || device.max_read_count > MAX_READ_COUNT {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': max_read_count must be 1-{}",
                    device.name, MAX_READ_COUNT
                )));
            }

            if device.base_addresses.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': base_addresses cannot be empty",
                    device.name
                )));
            }

            if let ConnectionConfig::Rtu { parity, .. } = &device.connection {
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(ConfigError::Validation(format!(
                            "Device '{}': invalid parity '{}' (use none, even, or odd)",
                            device.name, parity
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
