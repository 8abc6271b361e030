//! SunSpec engine over Modbus.
//!
//! Discovers the SunSpec models a device exposes and decodes their registers
//! into typed, scaled values:
//!
//! - [`port`] - register access trait and an in-memory register image
//! - [`modbus`] - Modbus TCP/RTU register port
//! - [`dictionary`] - model definitions (built-in and loaded from JSON)
//! - [`decoder`] - point type codec and scale factors
//! - [`model`] - model instances bound to device registers
//! - [`device`] - device session: scan, read cycles, writes
//! - [`error`] - error types
//!
//! # Example
//!
//! ```ignore
//! use sunspec_modbus::{Connection, DeviceSession, ModbusPort, ModbusSettings};
//!
//! let port = ModbusPort::new(ModbusSettings::new(Connection::tcp("192.168.1.100", 502), 1));
//! let mut session = DeviceSession::with_defaults(port);
//! session.scan().await?;
//! session.read_all().await?;
//! println!("{}", session.data_tree());
//! ```

pub mod decoder;
pub mod device;
pub mod dictionary;
pub mod error;
pub mod model;
pub mod modbus;
pub mod port;

pub use decoder::Value;
pub use device::{CycleStats, DeviceInfo, DeviceSession, ScanOptions};
pub use dictionary::{ModelDef, ModelDictionary, PointDef, PointType};
pub use error::{DecodeError, Error, Result, TransportError};
pub use model::{ModelInstance, ModelSnapshot, PointValue};
pub use modbus::{Connection, ModbusPort, ModbusSettings, RegisterKind};
pub use port::{MemoryPort, RegisterPort};
