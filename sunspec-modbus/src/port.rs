//! Register access abstraction.
//!
//! The engine only needs to read and write blocks of 16-bit registers. The
//! [`RegisterPort`] trait captures that, so the same discovery and decoding
//! code runs against a live Modbus device ([`crate::ModbusPort`]) or an
//! in-memory register image ([`MemoryPort`]).

use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Largest register count allowed in a single Modbus read request.
pub const MAX_READ_COUNT: u16 = 125;

/// Block register access.
///
/// Implementations must not retry; a failed request is reported to the
/// caller as-is.
pub trait RegisterPort: Send {
    /// Read `count` consecutive registers starting at `address`.
    fn read(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = std::result::Result<Vec<u16>, TransportError>> + Send;

    /// Write consecutive registers starting at `address`.
    fn write(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = std::result::Result<(), TransportError>> + Send;
}

/// Read a block of any length, split into requests of at most `max_count`.
pub async fn read_chunked<P: RegisterPort>(
    port: &mut P,
    address: u16,
    count: u16,
    max_count: u16,
) -> std::result::Result<Vec<u16>, TransportError> {
    if address as u32 + count as u32 > u16::MAX as u32 + 1 {
        return Err(TransportError::Exception {
            address,
            count,
            code: "Illegal data address".to_string(),
        });
    }

    let max_count = max_count.clamp(1, MAX_READ_COUNT);
    let mut words = Vec::with_capacity(count as usize);
    let mut offset: u16 = 0;

    while offset < count {
        let chunk = (count - offset).min(max_count);
        let block = port.read(address + offset, chunk).await?;
        if block.len() != chunk as usize {
            return Err(TransportError::Io(format!(
                "short read at {}: expected {} registers, got {}",
                address + offset,
                chunk,
                block.len()
            )));
        }
        words.extend_from_slice(&block);
        offset += chunk;
    }

    Ok(words)
}

/// A request seen by a [`MemoryPort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { address: u16, count: u16 },
    Write { address: u16, values: Vec<u16> },
}

/// On-disk register dump format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDump {
    /// Address of the first register.
    pub base: u16,
    pub registers: Vec<u16>,
}

/// An in-memory register image.
///
/// Addresses outside the image answer with an "Illegal data address"
/// exception, the way a real device does. Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryPort {
    base: u16,
    registers: Vec<u16>,
    requests: Vec<Request>,
    fail_link: bool,
}

impl MemoryPort {
    pub fn new(base: u16, registers: Vec<u16>) -> Self {
        Self {
            base,
            registers,
            requests: Vec::new(),
            fail_link: false,
        }
    }

    /// Start building a SunSpec register image at `base`.
    pub fn builder(base: u16) -> ImageBuilder {
        ImageBuilder::new(base)
    }

    /// Load a register dump from JSON (`{"base": 40000, "registers": [...]}`).
    pub fn from_json(json: &str) -> Result<Self> {
        let dump: RegisterDump = serde_json::from_str(json)?;
        Ok(Self::new(dump.base, dump.registers))
    }

    /// Load a register dump file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Current contents as a dump.
    pub fn dump(&self) -> RegisterDump {
        RegisterDump {
            base: self.base,
            registers: self.registers.clone(),
        }
    }

    pub fn registers(&self) -> &[u16] {
        &self.registers
    }

    /// Register at an absolute address.
    pub fn register(&self, address: u16) -> Option<u16> {
        let index = (address as usize).checked_sub(self.base as usize)?;
        self.registers.get(index).copied()
    }

    /// Overwrite registers at an absolute address, growing the image if needed.
    pub fn set(&mut self, address: u16, values: &[u16]) {
        let start = (address as usize).saturating_sub(self.base as usize);
        let end = start + values.len();
        if end > self.registers.len() {
            self.registers.resize(end, 0);
        }
        self.registers[start..end].copy_from_slice(values);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Make every following request fail as if the link were down.
    pub fn set_link_down(&mut self, down: bool) {
        self.fail_link = down;
    }

    fn range(&self, address: u16, count: u16) -> std::result::Result<(usize, usize), TransportError> {
        let start = address as usize;
        let end = start + count as usize;
        let base = self.base as usize;
        if count == 0 || start < base || end > base + self.registers.len() {
            return Err(TransportError::Exception {
                address,
                count,
                code: "Illegal data address".to_string(),
            });
        }
        Ok((start - base, end - base))
    }
}

impl RegisterPort for MemoryPort {
    async fn read(
        &mut self,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, TransportError> {
        self.requests.push(Request::Read { address, count });
        if self.fail_link {
            return Err(TransportError::Io("link down".to_string()));
        }
        let (start, end) = self.range(address, count)?;
        Ok(self.registers[start..end].to_vec())
    }

    async fn write(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> std::result::Result<(), TransportError> {
        self.requests.push(Request::Write {
            address,
            values: values.to_vec(),
        });
        if self.fail_link {
            return Err(TransportError::Io("link down".to_string()));
        }
        let (start, end) = self.range(address, values.len() as u16)?;
        self.registers[start..end].copy_from_slice(values);
        Ok(())
    }
}

/// Builder for SunSpec register images.
///
/// ```
/// use sunspec_modbus::MemoryPort;
///
/// let port = MemoryPort::builder(40000)
///     .marker()
///     .model(1, &[0; 66])
///     .end()
///     .build();
/// assert_eq!(port.register(40000), Some(0x5375));
/// assert_eq!(port.register(40070), Some(0xFFFF));
/// ```
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    base: u16,
    registers: Vec<u16>,
}

impl ImageBuilder {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            registers: Vec::new(),
        }
    }

    /// Append the `SunS` identifier.
    pub fn marker(mut self) -> Self {
        self.registers.extend_from_slice(&crate::device::SUNS_MARKER);
        self
    }

    /// Append a model header and body; `L` is the body length.
    pub fn model(mut self, id: u16, body: &[u16]) -> Self {
        self.registers.push(id);
        self.registers.push(body.len() as u16);
        self.registers.extend_from_slice(body);
        self
    }

    /// Append a model header with an explicit length and no body.
    pub fn header(mut self, id: u16, len: u16) -> Self {
        self.registers.push(id);
        self.registers.push(len);
        self
    }

    /// Append raw registers.
    pub fn raw(mut self, words: &[u16]) -> Self {
        self.registers.extend_from_slice(words);
        self
    }

    /// Append the end-of-models marker.
    pub fn end(mut self) -> Self {
        self.registers.push(crate::device::END_MODEL_ID);
        self.registers.push(0);
        self
    }

    pub fn build(self) -> MemoryPort {
        MemoryPort::new(self.base, self.registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_in_range() {
        let mut port = MemoryPort::new(100, vec![1, 2, 3, 4]);
        assert_eq!(port.read(101, 2).await.unwrap(), vec![2, 3]);
        assert_eq!(port.requests(), &[Request::Read { address: 101, count: 2 }]);
    }

    #[tokio::test]
    async fn test_read_out_of_range_is_exception() {
        let mut port = MemoryPort::new(100, vec![1, 2, 3, 4]);

        let err = port.read(103, 2).await.unwrap_err();
        assert!(err.is_exception());

        let err = port.read(99, 1).await.unwrap_err();
        assert!(err.is_exception());
    }

    #[tokio::test]
    async fn test_link_down() {
        let mut port = MemoryPort::new(0, vec![0; 4]);
        port.set_link_down(true);
        let err = port.read(0, 1).await.unwrap_err();
        assert!(!err.is_exception());
    }

    #[tokio::test]
    async fn test_write_updates_image() {
        let mut port = MemoryPort::new(10, vec![0; 4]);
        port.write(11, &[7, 8]).await.unwrap();
        assert_eq!(port.registers(), &[0, 7, 8, 0]);
        assert!(port.write(13, &[1, 2]).await.unwrap_err().is_exception());
    }

    #[tokio::test]
    async fn test_read_chunked_splits_requests() {
        let registers: Vec<u16> = (0..300).collect();
        let mut port = MemoryPort::new(1000, registers.clone());

        let words = read_chunked(&mut port, 1000, 300, 125).await.unwrap();
        assert_eq!(words, registers);
        assert_eq!(
            port.requests(),
            &[
                Request::Read { address: 1000, count: 125 },
                Request::Read { address: 1125, count: 125 },
                Request::Read { address: 1250, count: 50 },
            ]
        );
    }

    #[tokio::test]
    async fn test_read_chunked_clamps_max_count() {
        let mut port = MemoryPort::new(0, vec![0; 200]);
        read_chunked(&mut port, 0, 200, 500).await.unwrap();
        assert_eq!(port.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_read_chunked_rejects_address_overflow() {
        let mut port = MemoryPort::new(0, Vec::new());
        let err = read_chunked(&mut port, 65530, 10, 125).await.unwrap_err();
        assert!(err.is_exception());
        assert!(port.requests().is_empty());
    }

    #[test]
    fn test_dump_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        std::fs::write(&path, r#"{ "base": 40000, "registers": [21365, 28243, 65535, 0] }"#)
            .unwrap();

        let port = MemoryPort::load_file(&path).unwrap();
        assert_eq!(port.register(40000), Some(0x5375));
        assert_eq!(port.register(40004), None);
        assert_eq!(port.dump().registers.len(), 4);
    }

    #[test]
    fn test_builder_layout() {
        let port = MemoryPort::builder(0)
            .marker()
            .model(101, &[1, 2, 3])
            .header(64001, 0)
            .end()
            .build();

        assert_eq!(
            port.registers(),
            &[0x5375, 0x6e53, 101, 3, 1, 2, 3, 64001, 0, 0xFFFF, 0]
        );
    }

    #[test]
    fn test_set_grows_image() {
        let mut port = MemoryPort::new(5, vec![1]);
        port.set(7, &[9]);
        assert_eq!(port.registers(), &[1, 0, 9]);
    }
}
