//! Register codec for SunSpec point types.
//!
//! Multi-register values are big-endian (high word first). Each type has an
//! "unimplemented" bit pattern; decoding it yields `None` rather than a value.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::dictionary::PointType;
use crate::error::DecodeError;

/// A decoded point value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    /// Integer view of the value. Floats only convert when integral.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v as i128),
            Value::Uint(v) => Some(*v as i128),
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a scale factor exponent.
    pub fn as_scale_factor(&self) -> Option<i16> {
        self.as_i128().and_then(|v| i16::try_from(v).ok())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

fn check_len(point_type: PointType, words: &[u16]) -> Result<(), DecodeError> {
    match point_type.fixed_size() {
        Some(size) if words.len() != size as usize => Err(DecodeError::Length {
            point_type,
            expected: size as usize,
            actual: words.len(),
        }),
        None if words.is_empty() => Err(DecodeError::Length {
            point_type,
            expected: 1,
            actual: 0,
        }),
        _ => Ok(()),
    }
}

fn join(words: &[u16]) -> u64 {
    words.iter().fold(0u64, |acc, w| (acc << 16) | *w as u64)
}

fn split(value: u64, size: usize) -> Vec<u16> {
    (0..size)
        .rev()
        .map(|i| (value >> (16 * i)) as u16)
        .collect()
}

/// Decode the registers of a point.
///
/// Returns `Ok(None)` when the registers hold the type's "not implemented"
/// pattern. Pad points never carry a value.
pub fn decode(point_type: PointType, words: &[u16]) -> Result<Option<Value>, DecodeError> {
    check_len(point_type, words)?;

    let raw = join(words);
    let value = match point_type {
        PointType::Pad => None,
        PointType::Int16 | PointType::Sunssf => {
            let v = raw as u16 as i16;
            (v != i16::MIN).then_some(Value::Int(v as i64))
        }
        PointType::Uint16 | PointType::Count | PointType::Enum16 | PointType::Bitfield16 => {
            (raw != 0xFFFF).then_some(Value::Uint(raw))
        }
        PointType::Int32 => {
            let v = raw as u32 as i32;
            (v != i32::MIN).then_some(Value::Int(v as i64))
        }
        PointType::Uint32 | PointType::Enum32 | PointType::Bitfield32 => {
            (raw != 0xFFFF_FFFF).then_some(Value::Uint(raw))
        }
        PointType::Int64 => {
            let v = raw as i64;
            (v != i64::MIN).then_some(Value::Int(v))
        }
        PointType::Uint64 => (raw != u64::MAX).then_some(Value::Uint(raw)),
        PointType::Acc16 | PointType::Acc32 | PointType::Acc64 => {
            (raw != 0).then_some(Value::Uint(raw))
        }
        PointType::Ipaddr => {
            (raw != 0).then(|| Value::Text(Ipv4Addr::from(raw as u32).to_string()))
        }
        PointType::Float32 => {
            let v = f32::from_bits(raw as u32);
            (!v.is_nan()).then_some(Value::Float(v as f64))
        }
        PointType::Float64 => {
            let v = f64::from_bits(raw);
            (!v.is_nan()).then_some(Value::Float(v))
        }
        PointType::String => decode_string(words),
    };

    Ok(value)
}

fn decode_string(words: &[u16]) -> Option<Value> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    if end == 0 {
        return None;
    }
    Some(Value::Text(String::from_utf8_lossy(&bytes[..end]).into_owned()))
}

/// The "not implemented" register pattern of a point.
pub fn unimplemented(point_type: PointType, size: u16) -> Vec<u16> {
    let size = point_type.fixed_size().unwrap_or(size) as usize;
    match point_type {
        PointType::Int16 | PointType::Sunssf | PointType::Pad => vec![0x8000],
        PointType::Int32 => split(0x8000_0000, 2),
        PointType::Int64 => split(1 << 63, 4),
        PointType::Float32 => split(0x7FC0_0000, 2),
        PointType::Float64 => split(0x7FF8_0000_0000_0000, 4),
        PointType::Acc16
        | PointType::Acc32
        | PointType::Acc64
        | PointType::Ipaddr
        | PointType::String => vec![0; size],
        PointType::Uint16
        | PointType::Count
        | PointType::Enum16
        | PointType::Bitfield16
        | PointType::Uint32
        | PointType::Enum32
        | PointType::Bitfield32
        | PointType::Uint64 => vec![0xFFFF; size],
    }
}

fn out_of_range(point_type: PointType, value: &Value) -> DecodeError {
    DecodeError::OutOfRange {
        point_type,
        value: value.to_string(),
    }
}

fn mismatch(point_type: PointType, value: &Value) -> DecodeError {
    DecodeError::TypeMismatch {
        point_type,
        value: value.to_string(),
    }
}

fn encode_integer(
    point_type: PointType,
    value: &Value,
    min: i128,
    max: i128,
    size: usize,
) -> Result<Vec<u16>, DecodeError> {
    let v = value
        .as_i128()
        .ok_or_else(|| mismatch(point_type, value))?;
    if v < min || v > max {
        return Err(out_of_range(point_type, value));
    }
    Ok(split(v as u64, size))
}

/// Encode a value into the registers of a point of `size` registers.
pub fn encode(point_type: PointType, size: u16, value: &Value) -> Result<Vec<u16>, DecodeError> {
    match point_type {
        PointType::Int16 | PointType::Sunssf => {
            encode_integer(point_type, value, i16::MIN as i128, i16::MAX as i128, 1)
        }
        PointType::Uint16
        | PointType::Count
        | PointType::Acc16
        | PointType::Enum16
        | PointType::Bitfield16 => encode_integer(point_type, value, 0, u16::MAX as i128, 1),
        PointType::Int32 => {
            encode_integer(point_type, value, i32::MIN as i128, i32::MAX as i128, 2)
        }
        PointType::Uint32 | PointType::Acc32 | PointType::Enum32 | PointType::Bitfield32 => {
            encode_integer(point_type, value, 0, u32::MAX as i128, 2)
        }
        PointType::Int64 => {
            encode_integer(point_type, value, i64::MIN as i128, i64::MAX as i128, 4)
        }
        PointType::Uint64 | PointType::Acc64 => {
            encode_integer(point_type, value, 0, u64::MAX as i128, 4)
        }
        PointType::Float32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(point_type, value))?;
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(out_of_range(point_type, value));
            }
            Ok(split((v as f32).to_bits() as u64, 2))
        }
        PointType::Float64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(point_type, value))?;
            Ok(split(v.to_bits(), 4))
        }
        PointType::Ipaddr => match value {
            Value::Text(s) => {
                let addr: Ipv4Addr = s.parse().map_err(|_| mismatch(point_type, value))?;
                Ok(split(u32::from(addr) as u64, 2))
            }
            _ => encode_integer(point_type, value, 0, u32::MAX as i128, 2),
        },
        PointType::String => {
            let text = value.as_str().ok_or_else(|| mismatch(point_type, value))?;
            let capacity = size as usize * 2;
            if text.len() > capacity {
                return Err(out_of_range(point_type, value));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            Ok(bytes
                .chunks(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect())
        }
        PointType::Pad => Err(mismatch(point_type, value)),
    }
}

fn pow10(exp: i16) -> f64 {
    10f64.powi(exp.unsigned_abs() as i32)
}

/// Apply a scale factor: `value * 10^sf`.
///
/// Negative exponents divide by `10^-sf` so that e.g. `2345` with `-2` is
/// exactly `23.45`. A zero exponent leaves the value untouched. Text values
/// are never scaled.
pub fn apply_scale(value: &Value, sf: i16) -> Value {
    if sf == 0 {
        return value.clone();
    }
    match value.as_f64() {
        Some(v) if sf > 0 => Value::Float(v * pow10(sf)),
        Some(v) => Value::Float(v / pow10(sf)),
        None => value.clone(),
    }
}

/// Reverse a scale factor for writing: `round(value / 10^sf)`.
///
/// Integral results are returned as integers so they can be encoded into
/// integer registers.
pub fn remove_scale(value: &Value, sf: i16) -> Value {
    if sf == 0 {
        return value.clone();
    }
    match value.as_f64() {
        Some(v) => {
            let scaled = if sf > 0 { v / pow10(sf) } else { v * pow10(sf) };
            let rounded = scaled.round();
            if rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
                Value::Int(rounded as i64)
            } else {
                Value::Float(rounded)
            }
        }
        None => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [PointType; 20] = [
        PointType::Int16,
        PointType::Uint16,
        PointType::Count,
        PointType::Acc16,
        PointType::Enum16,
        PointType::Bitfield16,
        PointType::Pad,
        PointType::Int32,
        PointType::Uint32,
        PointType::Acc32,
        PointType::Enum32,
        PointType::Bitfield32,
        PointType::Ipaddr,
        PointType::Int64,
        PointType::Uint64,
        PointType::Acc64,
        PointType::Float32,
        PointType::Float64,
        PointType::Sunssf,
        PointType::String,
    ];

    #[test]
    fn test_unimplemented_patterns_decode_to_none() {
        for point_type in ALL_TYPES {
            let words = unimplemented(point_type, 8);
            assert_eq!(
                decode(point_type, &words).unwrap(),
                None,
                "{} should decode {:04x?} as unimplemented",
                point_type,
                words
            );
        }
    }

    #[test]
    fn test_decode_signed() {
        assert_eq!(
            decode(PointType::Int16, &[0xFFFE]).unwrap(),
            Some(Value::Int(-2))
        );
        assert_eq!(
            decode(PointType::Sunssf, &[0xFFFE]).unwrap(),
            Some(Value::Int(-2))
        );
        assert_eq!(
            decode(PointType::Int32, &[0xFFFF, 0xFFF6]).unwrap(),
            Some(Value::Int(-10))
        );
        assert_eq!(
            decode(PointType::Int64, &[0, 0, 0x0001, 0x0000]).unwrap(),
            Some(Value::Int(65536))
        );
    }

    #[test]
    fn test_decode_unsigned() {
        assert_eq!(
            decode(PointType::Uint16, &[2345]).unwrap(),
            Some(Value::Uint(2345))
        );
        assert_eq!(
            decode(PointType::Uint32, &[0x0001, 0x0002]).unwrap(),
            Some(Value::Uint(0x0001_0002))
        );
        assert_eq!(
            decode(PointType::Acc32, &[0, 1500]).unwrap(),
            Some(Value::Uint(1500))
        );
        assert_eq!(
            decode(PointType::Bitfield32, &[0, 0]).unwrap(),
            Some(Value::Uint(0))
        );
    }

    #[test]
    fn test_decode_float() {
        let words = split(23.5f32.to_bits() as u64, 2);
        assert_eq!(
            decode(PointType::Float32, &words).unwrap(),
            Some(Value::Float(23.5))
        );

        let words = split((-0.125f64).to_bits(), 4);
        assert_eq!(
            decode(PointType::Float64, &words).unwrap(),
            Some(Value::Float(-0.125))
        );
    }

    #[test]
    fn test_decode_string() {
        // "SunSpecTest" padded with NULs to 16 registers.
        let mut bytes = b"SunSpecTest".to_vec();
        bytes.resize(32, 0);
        let words: Vec<u16> = bytes
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        assert_eq!(
            decode(PointType::String, &words).unwrap(),
            Some(Value::Text("SunSpecTest".to_string()))
        );
    }

    #[test]
    fn test_decode_ipaddr() {
        assert_eq!(
            decode(PointType::Ipaddr, &[0xC0A8, 0x010A]).unwrap(),
            Some(Value::Text("192.168.1.10".to_string()))
        );
    }

    #[test]
    fn test_decode_wrong_length() {
        let err = decode(PointType::Uint32, &[1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Length {
                point_type: PointType::Uint32,
                expected: 2,
                actual: 1
            }
        );
        assert!(decode(PointType::String, &[]).is_err());
    }

    #[test]
    fn test_encode_matches_decode() {
        let cases = [
            (PointType::Int16, 1, Value::Int(-300)),
            (PointType::Uint16, 1, Value::Uint(65534)),
            (PointType::Int32, 2, Value::Int(-70000)),
            (PointType::Acc64, 4, Value::Uint(123_456_789_012)),
            (PointType::Float32, 2, Value::Float(50.25)),
            (PointType::String, 4, Value::Text("SN42".to_string())),
            (PointType::Ipaddr, 2, Value::Text("10.0.0.1".to_string())),
        ];

        for (point_type, size, value) in cases {
            let words = encode(point_type, size, &value).unwrap();
            assert_eq!(words.len(), size as usize);
            assert_eq!(decode(point_type, &words).unwrap(), Some(value));
        }
    }

    #[test]
    fn test_encode_range_checks() {
        assert!(matches!(
            encode(PointType::Uint16, 1, &Value::Int(-1)),
            Err(DecodeError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(PointType::Int16, 1, &Value::Int(40000)),
            Err(DecodeError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(PointType::String, 2, &Value::Text("too long".to_string())),
            Err(DecodeError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(PointType::Uint16, 1, &Value::Text("x".to_string())),
            Err(DecodeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            encode(PointType::Uint16, 1, &Value::Float(1.5)),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_apply_scale() {
        assert_eq!(apply_scale(&Value::Uint(2345), -2), Value::Float(23.45));
        assert_eq!(apply_scale(&Value::Int(-5), 3), Value::Float(-5000.0));
        assert_eq!(apply_scale(&Value::Uint(7), 0), Value::Uint(7));
        assert_eq!(
            apply_scale(&Value::Text("x".to_string()), -1),
            Value::Text("x".to_string())
        );
    }

    #[test]
    fn test_remove_scale() {
        assert_eq!(remove_scale(&Value::Float(23.45), -2), Value::Int(2345));
        assert_eq!(remove_scale(&Value::Float(5000.0), 3), Value::Int(5));
        assert_eq!(remove_scale(&Value::Float(1.006), -2), Value::Int(101));
    }

    #[test]
    fn test_value_serializes_untagged() {
        let values = vec![
            Value::Int(-1),
            Value::Uint(2),
            Value::Float(0.5),
            Value::Text("on".to_string()),
        ];
        assert_eq!(
            serde_json::to_string(&values).unwrap(),
            r#"[-1,2,0.5,"on"]"#
        );
    }
}
