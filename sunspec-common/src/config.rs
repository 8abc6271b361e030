use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Publish to the broker. When disabled, data is only logged.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Broker host name or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional username. An empty string means anonymous.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password (only used together with `username`).
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic prefix for everything the bridge publishes.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Publish QoS level (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Publish with the retain flag set.
    #[serde(default = "default_enabled")]
    pub retain: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "core-mosquitto".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sunspec-bridge".to_string()
}

fn default_topic_prefix() -> String {
    "sunspec".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            keep_alive_secs: default_keep_alive(),
            qos: default_qos(),
            retain: default_enabled(),
        }
    }
}

impl MqttConfig {
    /// Credentials to use, if a non-empty username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => {
                Some((user, self.password.as_deref().unwrap_or_default()))
            }
            _ => None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_mqtt_config() {
        let json5 = r#"
        {
            mqtt: {
                host: "broker.local",
                port: 8883,
                username: "bridge",
                password: "secret",
                topic_prefix: "solar",
                qos: 0,
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.topic_prefix, "solar");
        assert_eq!(config.mqtt.qos, 0);
        assert_eq!(config.mqtt.credentials(), Some(("bridge", "secret")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_config() {
        let config: TestConfig = parse_config("{}").unwrap();

        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.host, "core-mosquitto");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "sunspec");
        assert!(config.mqtt.retain);
        assert!(config.mqtt.credentials().is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_empty_username_is_anonymous() {
        let config: TestConfig = parse_config(r#"{ mqtt: { username: "" } }"#).unwrap();
        assert!(config.mqtt.credentials().is_none());
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"
        {
            logging: {
                level: "debug",
                format: "json",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ mqtt: {{ host: 'file-broker' }} }}").unwrap();

        let config: TestConfig = load_config(file.path()).unwrap();
        assert_eq!(config.mqtt.host, "file-broker");
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<TestConfig> = load_config("/nonexistent/sunspec.json5");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
