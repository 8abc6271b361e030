//! MQTT client construction and event loop handling.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{Error, Result};

/// Capacity of the request channel between the client and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// Convert a numeric QoS level into the client type.
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Config(format!(
            "Invalid MQTT QoS level: {}. Expected 0, 1 or 2",
            other
        ))),
    }
}

/// Build client options from the configuration.
pub fn mqtt_options(config: &MqttConfig, last_will: Option<LastWill>) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    if let Some((user, pass)) = config.credentials() {
        options.set_credentials(user, pass);
    }

    if let Some(will) = last_will {
        options.set_last_will(will);
    }

    options
}

/// Create an MQTT client and spawn the task driving its event loop.
///
/// The event loop reconnects on its own; connection errors are logged and
/// retried after a short pause.
pub fn connect(
    config: &MqttConfig,
    last_will: Option<LastWill>,
) -> Result<(AsyncClient, JoinHandle<()>)> {
    let options = mqtt_options(config, last_will);

    tracing::info!(
        host = %config.host,
        port = config.port,
        client_id = %config.client_id,
        "Connecting to MQTT broker"
    );

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let handle = tokio::spawn(drive_event_loop(eventloop));

    Ok((client, handle))
}

async fn drive_event_loop(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::info!(code = ?ack.code, "Connected to MQTT broker");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("Broker closed the MQTT connection");
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                tracing::info!("MQTT client disconnecting");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[test]
    fn test_mqtt_options() {
        let config = MqttConfig {
            host: "broker.local".to_string(),
            port: 1884,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            keep_alive_secs: 30,
            ..MqttConfig::default()
        };

        let options = mqtt_options(&config, None);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.client_id(), "sunspec-bridge");
    }

    #[test]
    fn test_mqtt_options_with_last_will() {
        let will = LastWill::new("sunspec/status", "offline", QoS::AtLeastOnce, true);
        let options = mqtt_options(&MqttConfig::default(), Some(will));

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "sunspec/status");
        assert!(will.retain);
    }
}
