//! Integration tests for mqtt-bridge-sunspec, polling a replayed register
//! dump configured through a JSON5 file.

use std::path::Path;

use mqtt_bridge_sunspec::config::SunSpecBridgeConfig;
use mqtt_bridge_sunspec::poller::DevicePoller;
use mqtt_bridge_sunspec::port::DevicePort;
use mqtt_bridge_sunspec::publisher::{Publisher, value_messages};
use sunspec_common::Format;
use sunspec_modbus::{DeviceSession, MemoryPort, ModelDictionary};
use tokio_test::{assert_err, assert_ok};

fn write_dump(dir: &Path) -> std::path::PathBuf {
    let mut meter = vec![0u16; 105];
    meter[0] = 1234; // A
    meter[4] = (-1i16) as u16; // A_SF

    let image = MemoryPort::builder(40000)
        .marker()
        .model(1, &[0; 66])
        .model(203, &meter)
        .end()
        .build();

    let path = dir.join("meter.json");
    std::fs::write(&path, serde_json::to_string(&image.dump()).unwrap()).unwrap();
    path
}

fn write_config(dir: &Path, dump: &Path) -> std::path::PathBuf {
    let path = dir.join("sunspec.json5");
    let content = format!(
        r#"{{
            mqtt: {{ enabled: false, topic_prefix: "solar" }},
            devices: [
                {{ name: "grid meter", connection: {{ type: "dump", path: {:?} }} }},
            ],
        }}"#,
        dump
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_poll_register_dump() {
    let dir = tempfile::tempdir().unwrap();
    let dump = write_dump(dir.path());
    let config_path = write_config(dir.path(), &dump);

    let config = assert_ok!(SunSpecBridgeConfig::load(&config_path, |_| None));
    assert!(!config.mqtt.enabled);

    let device = config.devices[0].clone();
    let publisher = Publisher::log_only(&config.mqtt.topic_prefix, Format::Json);
    let poller = DevicePoller::new(device.clone(), ModelDictionary::builtin(), publisher.clone());

    let port = assert_ok!(DevicePort::open(&device));
    let mut session = DeviceSession::new(port, ModelDictionary::builtin(), device.scan_options());

    assert_ok!(poller.scan(&mut session).await);
    assert_eq!(session.base_address(), Some(40000));

    let report = assert_ok!(poller.poll_once(&mut session).await);
    assert_eq!(report.read.models_read, 2);

    let tree = session.data_tree();
    let meter_key = session.models_by_id(203).next().unwrap().key();
    assert_eq!(tree[&meter_key]["A"], 123.4);

    let messages = value_messages(publisher.topics(), &device.name, &session.snapshot());
    let topic = format!("solar/grid_meter/{}/A", meter_key);
    assert!(
        messages
            .iter()
            .any(|(t, payload)| *t == topic && payload == "123.4"),
        "missing {} in {:?}",
        topic,
        messages
    );
}

#[tokio::test]
async fn test_dump_without_marker_stops_poller() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("blank.json");
    std::fs::write(&dump, r#"{"base": 40000, "registers": [0, 0, 0, 0]}"#).unwrap();
    let config_path = write_config(dir.path(), &dump);

    let config = assert_ok!(SunSpecBridgeConfig::load(&config_path, |_| None));
    let device = config.devices[0].clone();
    let poller = DevicePoller::new(
        device,
        ModelDictionary::builtin(),
        Publisher::log_only("solar", Format::Json),
    );

    let err = assert_err!(poller.run().await);
    assert!(!err.is_recoverable());
}
