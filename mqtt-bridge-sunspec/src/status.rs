//! Bridge status reporting.

use chrono::{DateTime, Utc};
use rumqttc::{LastWill, QoS};
use serde::{Deserialize, Serialize};
use sunspec_common::TopicBuilder;

/// Bridge name reported in status messages.
pub const BRIDGE_NAME: &str = "sunspec";

/// Bridge status information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub bridge: String,
    pub version: String,
    /// Current status ("running", "offline")
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Additional metadata (device names, ...)
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl BridgeStatus {
    fn new(status: &str) -> Self {
        Self {
            bridge: BRIDGE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn running() -> Self {
        Self::new("running")
    }

    pub fn offline() -> Self {
        Self::new("offline")
    }

    /// Add a metadata field to the status.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Last will published by the broker if the bridge drops off without
/// saying goodbye.
pub fn last_will(topics: &TopicBuilder, qos: QoS) -> LastWill {
    LastWill::new(topics.status(), BridgeStatus::offline().to_payload(), qos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_status() {
        let status = BridgeStatus::running().with("devices", serde_json::json!(["inverter"]));

        let json: serde_json::Value = serde_json::from_slice(&status.to_payload()).unwrap();
        assert_eq!(json["bridge"], "sunspec");
        assert_eq!(json["status"], "running");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["devices"][0], "inverter");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_status_roundtrip() {
        let status = BridgeStatus::offline();
        let parsed: BridgeStatus = serde_json::from_slice(&status.to_payload()).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_last_will() {
        let will = last_will(&TopicBuilder::new("solar"), QoS::AtLeastOnce);
        assert_eq!(will.topic, "solar/status");
        assert!(will.retain);

        let json: serde_json::Value = serde_json::from_slice(&will.message).unwrap();
        assert_eq!(json["status"], "offline");
    }
}
