//! Register port selected from a device's connection settings.

use sunspec_modbus::{MemoryPort, ModbusPort, RegisterPort, TransportError};

use crate::config::{ConnectionConfig, DeviceConfig};

/// A live Modbus link or a replayed register dump.
pub enum DevicePort {
    Modbus(ModbusPort),
    Memory(MemoryPort),
}

impl DevicePort {
    /// Build the port for a device. Dump files are read here; Modbus links
    /// connect lazily on the first request.
    pub fn open(device: &DeviceConfig) -> sunspec_modbus::Result<Self> {
        match (&device.connection, device.modbus_settings()) {
            (ConnectionConfig::Dump { path }, _) => {
                Ok(DevicePort::Memory(MemoryPort::load_file(path)?))
            }
            (_, Some(settings)) => Ok(DevicePort::Modbus(ModbusPort::new(settings))),
            (_, None) => Err(sunspec_modbus::Error::Transport(TransportError::Connect(
                format!("No connection settings for device '{}'", device.name),
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DevicePort::Modbus(_) => "modbus",
            DevicePort::Memory(_) => "dump",
        }
    }
}

impl RegisterPort for DevicePort {
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        match self {
            DevicePort::Modbus(port) => port.read(address, count).await,
            DevicePort::Memory(port) => port.read(address, count).await,
        }
    }

    async fn write(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        match self {
            DevicePort::Modbus(port) => port.write(address, values).await,
            DevicePort::Memory(port) => port.write(address, values).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registers.json");
        let image = MemoryPort::builder(40000).marker().end().build();
        std::fs::write(&path, serde_json::to_string(&image.dump()).unwrap()).unwrap();

        let device = DeviceConfig {
            connection: ConnectionConfig::Dump { path },
            ..DeviceConfig::default()
        };

        let mut port = DevicePort::open(&device).unwrap();
        assert_eq!(port.kind(), "dump");
        assert_eq!(port.read(40000, 2).await.unwrap(), vec![0x5375, 0x6e53]);
    }

    #[test]
    fn test_open_missing_dump() {
        let device = DeviceConfig {
            connection: ConnectionConfig::Dump {
                path: "/nonexistent/registers.json".into(),
            },
            ..DeviceConfig::default()
        };
        assert!(DevicePort::open(&device).is_err());
    }

    #[test]
    fn test_open_tcp_is_lazy() {
        let port = DevicePort::open(&DeviceConfig::default()).unwrap();
        assert_eq!(port.kind(), "modbus");
        match port {
            DevicePort::Modbus(port) => assert!(!port.is_connected()),
            DevicePort::Memory(_) => panic!("Expected Modbus port"),
        }
    }
}
