//! MQTT publisher for SunSpec data.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use sunspec_common::{Error, Format, MqttConfig, Result, TopicBuilder, encode};
use sunspec_modbus::{DeviceInfo, ModelSnapshot};
use tracing::{debug, info, warn};

use crate::status::BridgeStatus;

/// How long a publish may wait for room in the client's request queue.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Publisher for device data.
///
/// Without a client (MQTT disabled) every message is logged instead of sent.
/// Publishes never wait on the broker for longer than the publish timeout.
#[derive(Clone, Debug)]
pub struct Publisher {
    client: Option<AsyncClient>,
    topics: TopicBuilder,
    format: Format,
    qos: QoS,
    retain: bool,
    timeout: Duration,
}

impl Publisher {
    pub fn new(
        client: Option<AsyncClient>,
        config: &MqttConfig,
        format: Format,
    ) -> Result<Self> {
        Ok(Self {
            client,
            topics: TopicBuilder::new(&config.topic_prefix),
            format,
            qos: sunspec_common::mqtt::qos_from_level(config.qos)?,
            retain: config.retain,
            timeout: PUBLISH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// A publisher that only logs.
    pub fn log_only(topic_prefix: &str, format: Format) -> Self {
        Self {
            client: None,
            topics: TopicBuilder::new(topic_prefix),
            format,
            qos: QoS::AtMostOnce,
            retain: false,
            timeout: PUBLISH_TIMEOUT,
        }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Publish raw bytes to a topic.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.send(topic, self.retain, payload).await
    }

    async fn send(&self, topic: &str, retain: bool, payload: Vec<u8>) -> Result<()> {
        let Some(client) = &self.client else {
            debug!(topic, bytes = payload.len(), "MQTT disabled, not publishing");
            return Ok(());
        };
        tokio::time::timeout(self.timeout, client.publish(topic, self.qos, retain, payload))
            .await
            .map_err(|_| Error::PublishTimeout(topic.to_string()))??;
        Ok(())
    }

    /// Publish a JSON value to a topic.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic, payload).await
    }

    /// Publish the full data tree of a device.
    pub async fn publish_data(&self, device: &str, tree: &serde_json::Value) -> Result<()> {
        if self.client.is_none() {
            info!(device, data = %tree, "SunSpec data");
            return Ok(());
        }
        let payload = encode(tree, self.format)?;
        self.publish_raw(&self.topics.data(device), payload).await
    }

    /// Publish every value of the snapshots to its own topic, as text.
    ///
    /// Values are queued without waiting; those that do not fit in the
    /// client's request queue are counted as failed.
    pub fn publish_values(&self, device: &str, snapshots: &[ModelSnapshot]) -> PublishStats {
        let mut stats = PublishStats::default();
        let Some(client) = &self.client else {
            return stats;
        };

        for (topic, payload) in value_messages(&self.topics, device, snapshots) {
            match client.try_publish(topic.as_str(), self.qos, self.retain, payload) {
                Ok(()) => stats.success += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(topic = %topic, error = %e, "Failed to publish value");
                }
            }
        }

        stats
    }

    /// Publish device identification.
    pub async fn publish_info(&self, device: &str, info: &DeviceInfo) -> Result<()> {
        if self.client.is_none() {
            info!(device, info = ?info, "SunSpec device info");
            return Ok(());
        }
        self.publish_json(&self.topics.info(device), info).await
    }

    /// Publish the bridge status (always retained).
    pub async fn publish_status(&self, status: &BridgeStatus) -> Result<()> {
        self.send(&self.topics.status(), true, status.to_payload())
            .await
    }
}

/// Topic and text payload of every value in the snapshots.
pub fn value_messages(
    topics: &TopicBuilder,
    device: &str,
    snapshots: &[ModelSnapshot],
) -> Vec<(String, String)> {
    let mut messages = Vec::new();
    for snapshot in snapshots {
        let key = snapshot.key();
        for (path, value) in snapshot.leaves() {
            let mut segments = vec![key.as_str()];
            segments.extend(path.iter().map(String::as_str));
            messages.push((topics.device(device, &segments), value.to_string()));
        }
    }
    messages
}

/// Statistics from a batch publish operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub success: usize,
    pub failed: usize,
}

impl PublishStats {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use sunspec_modbus::Value;
    use sunspec_modbus::model::GroupSnapshot;

    fn mppt_snapshot() -> ModelSnapshot {
        let mut module = BTreeMap::new();
        module.insert("DCA".to_string(), Value::Float(1.5));

        let mut points = BTreeMap::new();
        points.insert("N".to_string(), Value::Uint(1));
        let mut groups = BTreeMap::new();
        groups.insert(
            "module".to_string(),
            vec![GroupSnapshot {
                index: 0,
                points: module,
                groups: BTreeMap::new(),
            }],
        );

        ModelSnapshot {
            id: 160,
            name: "mppt".to_string(),
            index: 0,
            points,
            groups,
        }
    }

    #[test]
    fn test_value_messages() {
        let topics = TopicBuilder::new("sunspec");
        let messages = value_messages(&topics, "roof inverter", &[mppt_snapshot()]);

        assert_eq!(
            messages,
            vec![
                ("sunspec/roof_inverter/mppt_0/N".to_string(), "1".to_string()),
                (
                    "sunspec/roof_inverter/mppt_0/module_0/DCA".to_string(),
                    "1.5".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_value_messages_empty() {
        let topics = TopicBuilder::default();
        assert!(value_messages(&topics, "inverter", &[]).is_empty());
    }

    #[tokio::test]
    async fn test_log_only_publisher() {
        let publisher = Publisher::log_only("sunspec", Format::Json);
        assert!(!publisher.is_enabled());

        let tree = serde_json::json!({ "common_0": { "Mn": "SunSpecTest" } });
        publisher.publish_data("inverter", &tree).await.unwrap();
        publisher
            .publish_info("inverter", &DeviceInfo::default())
            .await
            .unwrap();
        publisher
            .publish_status(&BridgeStatus::running())
            .await
            .unwrap();

        let stats = publisher.publish_values("inverter", &[mppt_snapshot()]);
        assert_eq!(stats.total(), 0);
    }

    fn stalled_publisher() -> (Publisher, rumqttc::EventLoop) {
        // The event loop is never polled, so the request queue only drains
        // into its single slot.
        let options = rumqttc::MqttOptions::new("test", "localhost", 1883);
        let (client, eventloop) = AsyncClient::new(options, 1);
        let publisher = Publisher::new(Some(client), &MqttConfig::default(), Format::Json)
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        (publisher, eventloop)
    }

    #[tokio::test]
    async fn test_values_do_not_wait_for_broker() {
        let (publisher, _eventloop) = stalled_publisher();

        let stats = publisher.publish_values("inverter", &[mppt_snapshot()]);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_data_publish_times_out() {
        let (publisher, _eventloop) = stalled_publisher();
        publisher.publish_raw("sunspec/fill", b"x".to_vec()).await.unwrap();

        let tree = serde_json::json!({ "common_0": { "Mn": "SunSpecTest" } });
        let err = publisher.publish_data("inverter", &tree).await.unwrap_err();
        assert!(matches!(err, Error::PublishTimeout(ref topic) if topic == "sunspec/inverter/data"));
    }

    #[test]
    fn test_new_rejects_bad_qos() {
        let config = MqttConfig {
            qos: 5,
            ..MqttConfig::default()
        };
        assert!(Publisher::new(None, &config, Format::Json).is_err());
    }
}
