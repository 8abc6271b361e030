//! Modbus TCP/RTU register port.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::port::RegisterPort;

/// Physical link to a Modbus device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Modbus TCP.
    Tcp { host: String, port: u16 },
    /// Modbus RTU over a serial line.
    Rtu {
        port: String,
        baud_rate: u32,
        data_bits: u8,
        /// "none", "even" or "odd"
        parity: String,
        stop_bits: u8,
    },
}

impl Connection {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Connection::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Human-readable endpoint, for logs.
    pub fn endpoint(&self) -> String {
        match self {
            Connection::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            Connection::Rtu {
                port, baud_rate, ..
            } => format!("rtu://{}@{}", port, baud_rate),
        }
    }
}

/// Which register table SunSpec data is read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (function code 3).
    #[default]
    Holding,
    /// Input registers (function code 4).
    Input,
}

/// Settings of a [`ModbusPort`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusSettings {
    pub connection: Connection,
    pub unit_id: u8,
    /// Per-request timeout, also applied to connecting.
    pub timeout: Duration,
    pub register_kind: RegisterKind,
}

impl ModbusSettings {
    pub fn new(connection: Connection, unit_id: u8) -> Self {
        Self {
            connection,
            unit_id,
            timeout: Duration::from_secs(3),
            register_kind: RegisterKind::Holding,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_register_kind(mut self, kind: RegisterKind) -> Self {
        self.register_kind = kind;
        self
    }
}

fn serial_parity(parity: &str) -> tokio_serial::Parity {
    match parity.to_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

fn serial_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
    match stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn serial_data_bits(data_bits: u8) -> tokio_serial::DataBits {
    match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

/// A register port backed by a Modbus client context.
///
/// The connection is opened lazily on the first request. After an I/O error
/// or a timeout the context is dropped and the next request reconnects.
/// Modbus exception responses keep the connection.
pub struct ModbusPort {
    settings: ModbusSettings,
    ctx: Option<Context>,
}

impl ModbusPort {
    pub fn new(settings: ModbusSettings) -> Self {
        Self {
            settings,
            ctx: None,
        }
    }

    pub fn settings(&self) -> &ModbusSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::Timeout {
            timeout_ms: self.settings.timeout.as_millis() as u64,
        }
    }

    /// Open the connection if it is not already open.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_some() {
            return Ok(());
        }

        let slave = Slave(self.settings.unit_id);
        let timeout = self.settings.timeout;

        let ctx = match &self.settings.connection {
            Connection::Tcp { host, port } => {
                let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Connect(format!("Invalid address: {}", e)))?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connect(format!("No address found for {}", host))
                    })?;

                tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Connect("Connection timeout".to_string()))?
                    .map_err(|e| TransportError::Connect(e.to_string()))?
            }
            Connection::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(serial_parity(parity))
                    .stop_bits(serial_stop_bits(*stop_bits))
                    .data_bits(serial_data_bits(*data_bits));

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connect(format!("Serial open failed: {}", e))
                })?;

                rtu::attach_slave(serial, slave)
            }
        };

        info!(
            endpoint = %self.settings.connection.endpoint(),
            unit_id = self.settings.unit_id,
            "Connected to Modbus device"
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Drop the connection. The next request reconnects.
    pub fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!(endpoint = %self.settings.connection.endpoint(), "Closed Modbus connection");
        }
    }

    async fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.connect().await?;
        self.ctx.as_mut().ok_or(TransportError::Disconnected)
    }

    /// Map a request outcome, dropping the context when the link failed.
    fn finish<T>(
        &mut self,
        outcome: Result<tokio_modbus::Result<T>, tokio::time::error::Elapsed>,
        address: u16,
        count: u16,
    ) -> Result<T, TransportError> {
        match outcome {
            Err(_) => {
                warn!(address, count, "Modbus request timed out, dropping connection");
                self.ctx = None;
                Err(self.timeout_error())
            }
            Ok(Err(e)) => {
                warn!(address, count, error = %e, "Modbus request failed, dropping connection");
                self.ctx = None;
                Err(TransportError::Io(e.to_string()))
            }
            Ok(Ok(Err(code))) => Err(TransportError::Exception {
                address,
                count,
                code: format!("{:?}", code),
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

impl RegisterPort for ModbusPort {
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let timeout = self.settings.timeout;
        let kind = self.settings.register_kind;
        let ctx = self.context().await?;

        let outcome = tokio::time::timeout(timeout, async {
            match kind {
                RegisterKind::Holding => ctx.read_holding_registers(address, count).await,
                RegisterKind::Input => ctx.read_input_registers(address, count).await,
            }
        })
        .await;

        self.finish(outcome, address, count)
    }

    async fn write(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        let timeout = self.settings.timeout;
        let ctx = self.context().await?;

        let outcome = tokio::time::timeout(timeout, async {
            match values {
                [value] => ctx.write_single_register(address, *value).await,
                _ => ctx.write_multiple_registers(address, values).await,
            }
        })
        .await;

        self.finish(outcome, address, values.len() as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_endpoint() {
        assert_eq!(
            Connection::tcp("192.168.1.50", 502).endpoint(),
            "tcp://192.168.1.50:502"
        );

        let rtu = Connection::Rtu {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            data_bits: 8,
            parity: "even".to_string(),
            stop_bits: 1,
        };
        assert_eq!(rtu.endpoint(), "rtu:///dev/ttyUSB0@19200");
    }

    #[test]
    fn test_serial_settings() {
        assert_eq!(serial_parity("EVEN"), tokio_serial::Parity::Even);
        assert_eq!(serial_parity("odd"), tokio_serial::Parity::Odd);
        assert_eq!(serial_parity("none"), tokio_serial::Parity::None);
        assert_eq!(serial_stop_bits(2), tokio_serial::StopBits::Two);
        assert_eq!(serial_data_bits(7), tokio_serial::DataBits::Seven);
    }

    #[test]
    fn test_register_kind_default() {
        assert_eq!(RegisterKind::default(), RegisterKind::Holding);
        let kind: RegisterKind = serde_json::from_str(r#""input""#).unwrap();
        assert_eq!(kind, RegisterKind::Input);
    }

    #[test]
    fn test_settings_builder() {
        let settings = ModbusSettings::new(Connection::tcp("localhost", 1502), 3)
            .with_timeout(Duration::from_millis(250))
            .with_register_kind(RegisterKind::Input);

        assert_eq!(settings.unit_id, 3);
        assert_eq!(settings.timeout, Duration::from_millis(250));
        let port = ModbusPort::new(settings);
        assert!(!port.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop a listener to get a local port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = ModbusSettings::new(Connection::tcp("127.0.0.1", port), 1)
            .with_timeout(Duration::from_millis(500));
        let mut modbus = ModbusPort::new(settings);

        let err = modbus.read(40000, 2).await.unwrap_err();
        assert!(!err.is_exception());
        assert!(!modbus.is_connected());
    }
}
