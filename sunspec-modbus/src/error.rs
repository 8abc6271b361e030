//! Error types for the SunSpec engine.

use thiserror::Error;

use crate::dictionary::PointType;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the register transport.
///
/// None of these are retried by the port itself; the caller decides whether
/// to skip the cycle or reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// I/O failure on an established connection.
    #[error("I/O error: {0}")]
    Io(String),

    /// The request did not complete within the configured timeout.
    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The device answered with a Modbus exception response.
    #[error("Modbus exception at {address} (+{count}): {code}")]
    Exception {
        address: u16,
        count: u16,
        code: String,
    },

    /// The port has been closed.
    #[error("Port is disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether the device itself refused the request.
    ///
    /// Exceptions mean the link is healthy; any other error means the link
    /// is unusable for the rest of the cycle.
    pub fn is_exception(&self) -> bool {
        matches!(self, TransportError::Exception { .. })
    }
}

/// Point-level decoding and encoding failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The number of words does not match the point type.
    #[error("{point_type} expects {expected} register(s), got {actual}")]
    Length {
        point_type: PointType,
        expected: usize,
        actual: usize,
    },

    /// The point lies outside the registers read for its model.
    #[error("Point at offset {offset} (+{size}) exceeds the model span of {span} registers")]
    OutOfSpan { offset: u16, size: u16, span: u16 },

    /// A value does not fit the point type.
    #[error("Value {value} out of range for {point_type}")]
    OutOfRange { point_type: PointType, value: String },

    /// A value of the wrong kind was supplied for the point type.
    #[error("Cannot encode {value} as {point_type}")]
    TypeMismatch { point_type: PointType, value: String },
}

/// Errors raised by the SunSpec engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Register transport failure. Recoverable: skip this cycle.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No SunSpec identifier was found at any candidate base address.
    #[error("Not a SunSpec device: no 'SunS' marker at {tried:?}")]
    NotSunSpecDevice { tried: Vec<u16> },

    /// The model header chain ended without the 0xFFFF terminator.
    #[error("Model list is not terminated (stopped at register {address})")]
    Unterminated { address: u32 },

    /// The model ID is not in the dictionary.
    #[error("Unknown model ID {0}")]
    UnknownModel(u16),

    /// A point could not be decoded or encoded.
    #[error("Decode error for '{point}': {source}")]
    Decode {
        point: String,
        #[source]
        source: DecodeError,
    },

    /// A write was attempted on a read-only point.
    #[error("Point '{point}' of model '{model}' is read-only")]
    ReadOnlyPoint { model: String, point: String },

    /// The point path does not exist in the model.
    #[error("Unknown point '{point}' in model '{model}'")]
    UnknownPoint { model: String, point: String },

    /// No model with that name and index has been discovered.
    #[error("No model instance '{0}'")]
    UnknownModelInstance(String),

    /// The session has not been scanned yet.
    #[error("Device has not been scanned")]
    NotScanned,

    /// A model definition is invalid.
    #[error("Invalid model definition: {0}")]
    Dictionary(String),

    /// A definition or register dump file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A definition or register dump file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a point-level failure with the point name.
    pub fn decode(point: impl Into<String>, source: DecodeError) -> Self {
        Self::Decode {
            point: point.into(),
            source,
        }
    }

    /// Create a dictionary validation error.
    pub fn dictionary(msg: impl Into<String>) -> Self {
        Self::Dictionary(msg.into())
    }

    /// Whether the error leaves the session usable for the next cycle.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::NotSunSpecDevice { .. })
    }
}
