//! MQTT bridge for SunSpec devices.
//!
//! This bridge discovers the SunSpec models of Modbus devices (TCP, RTU or a
//! replayed register dump), polls them and publishes decoded values to MQTT.
//!
//! # Topics
//!
//! ```text
//! <prefix>/<device>/data                      full data tree
//! <prefix>/<device>/info                      device identification
//! <prefix>/<device>/<model>_<i>/<point>       single value (text)
//! <prefix>/<device>/<model>_<i>/<group>_<j>/<point>
//! <prefix>/status                             bridge status
//! ```

pub mod config;
pub mod poller;
pub mod port;
pub mod publisher;
pub mod status;
