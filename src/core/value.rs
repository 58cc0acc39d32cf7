//! Purpose: Field types and typed field values carried by records.
//! Exports: `FieldType`, `Value`.
//! Role: Shared vocabulary for schema definitions, the codec, and selector evaluation.
//! Invariants: Every non-null value has exactly one `FieldType`; `Null` fits any field.
//! Invariants: Type names and wire codes are stable once published.
use std::fmt;

use serde_json::{Number, Value as JsonValue};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    String,
    Varint,
    Uint32,
    Float,
    Boolean,
    Bytes,
    Datetime,
}

impl FieldType {
    pub const ALL: [FieldType; 7] = [
        FieldType::String,
        FieldType::Varint,
        FieldType::Uint32,
        FieldType::Float,
        FieldType::Boolean,
        FieldType::Bytes,
        FieldType::Datetime,
    ];

    pub fn parse(name: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name() == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown field type `{name}`"))
                    .with_hint(format!("Supported types: {}", supported_type_names()))
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Varint => "varint",
            FieldType::Uint32 => "uint32",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Bytes => "bytes",
            FieldType::Datetime => "datetime",
        }
    }

    /// Wire tag for a non-null value of this type. Tag 0 is reserved for null.
    pub fn code(self) -> u8 {
        match self {
            FieldType::String => 1,
            FieldType::Varint => 2,
            FieldType::Uint32 => 3,
            FieldType::Float => 4,
            FieldType::Boolean => 5,
            FieldType::Bytes => 6,
            FieldType::Datetime => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.code() == code)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn supported_type_names() -> String {
    FieldType::ALL
        .iter()
        .map(|ty| ty.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Equality is structural: floats compare by bit pattern, so a NaN field
/// equals itself after a round trip.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    String(String),
    Varint(i64),
    Uint32(u32),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Datetime(OffsetDateTime),
}

impl Value {
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(FieldType::String),
            Value::Varint(_) => Some(FieldType::Varint),
            Value::Uint32(_) => Some(FieldType::Uint32),
            Value::Float(_) => Some(FieldType::Float),
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Bytes(_) => Some(FieldType::Bytes),
            Value::Datetime(_) => Some(FieldType::Datetime),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Varint(n) => Some(*n),
            Value::Uint32(n) => Some(i64::from(*n)),
            _ => None,
        }
    }

    /// Converts a value into the representation declared for a field.
    ///
    /// Lossless widenings (`varint` into `uint32` when in range, integers into
    /// `float`, RFC 3339 strings into `datetime`) are accepted; anything else
    /// is a usage error naming the field.
    pub fn coerce(self, field: &str, ty: FieldType) -> Result<Value, Error> {
        if self.field_type().is_none_or(|actual| actual == ty) {
            return Ok(self);
        }
        let coerced = match (ty, &self) {
            (FieldType::Uint32, Value::Varint(n)) => u32::try_from(*n).ok().map(Value::Uint32),
            (FieldType::Varint, Value::Uint32(n)) => Some(Value::Varint(i64::from(*n))),
            (FieldType::Float, Value::Varint(n)) => Some(Value::Float(*n as f64)),
            (FieldType::Float, Value::Uint32(n)) => Some(Value::Float(f64::from(*n))),
            (FieldType::Bytes, Value::String(s)) => Some(Value::Bytes(s.as_bytes().to_vec())),
            (FieldType::Datetime, Value::String(s)) => {
                OffsetDateTime::parse(s, &Rfc3339).ok().map(Value::Datetime)
            }
            _ => None,
        };
        coerced.ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "field `{field}` expects {ty}, got {}",
                self.type_label()
            ))
        })
    }

    pub fn type_label(&self) -> &'static str {
        self.field_type().map(FieldType::name).unwrap_or("null")
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Varint(n) => JsonValue::from(*n),
            Value::Uint32(n) => JsonValue::from(*n),
            Value::Float(n) => Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Bytes(bytes) => JsonValue::String(hex(bytes)),
            Value::Datetime(dt) => format_datetime(dt)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}

pub(crate) fn format_datetime(dt: &OffsetDateTime) -> Option<String> {
    dt.format(&Rfc3339).ok()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::String(s) => {
                f.write_str("'")?;
                for ch in s.chars() {
                    match ch {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        _ => write!(f, "{ch}")?,
                    }
                }
                f.write_str("'")
            }
            Value::Varint(n) => write!(f, "{n}"),
            Value::Uint32(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n:?}"),
            Value::Boolean(b) => f.write_str(if *b { "True" } else { "False" }),
            Value::Bytes(bytes) => write_bytes_literal(f, bytes),
            Value::Datetime(dt) => match format_datetime(dt) {
                Some(text) => f.write_str(&text),
                None => write!(f, "{dt}"),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Varint(a), Value::Varint(b)) => a == b,
            (Value::Uint32(a), Value::Uint32(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Datetime(a), Value::Datetime(b)) => a == b,
            _ => false,
        }
    }
}

fn write_bytes_literal(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    f.write_str("b'")?;
    for &byte in bytes {
        match byte {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\t' => f.write_str("\\t")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            0x20..=0x7e => write!(f, "{}", byte as char)?,
            _ => write!(f, "\\x{byte:02x}")?,
        }
    }
    f.write_str("'")
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Varint(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Varint(i64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Varint(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Uint32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::Datetime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
