//! Typed scalar and list values exchanged between the online store, transforms and callers.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    Bytes,
    UnixTimestamp,
    StringList,
    Int32List,
    Int64List,
    Float32List,
    Float64List,
    BoolList,
    BytesList,
    UnixTimestampList,
}

impl ValueType {
    pub fn is_list(self) -> bool {
        self.element_type().is_some()
    }

    /// Scalar kind held by a list kind.
    pub fn element_type(self) -> Option<ValueType> {
        match self {
            ValueType::StringList => Some(ValueType::String),
            ValueType::Int32List => Some(ValueType::Int32),
            ValueType::Int64List => Some(ValueType::Int64),
            ValueType::Float32List => Some(ValueType::Float32),
            ValueType::Float64List => Some(ValueType::Float64),
            ValueType::BoolList => Some(ValueType::Bool),
            ValueType::BytesList => Some(ValueType::Bytes),
            ValueType::UnixTimestampList => Some(ValueType::UnixTimestamp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::String => "String",
            ValueType::Int32 => "Int32",
            ValueType::Int64 => "Int64",
            ValueType::Float32 => "Float32",
            ValueType::Float64 => "Float64",
            ValueType::Bool => "Bool",
            ValueType::Bytes => "Bytes",
            ValueType::UnixTimestamp => "UnixTimestamp",
            ValueType::StringList => "Array(String)",
            ValueType::Int32List => "Array(Int32)",
            ValueType::Int64List => "Array(Int64)",
            ValueType::Float32List => "Array(Float32)",
            ValueType::Float64List => "Array(Float64)",
            ValueType::BoolList => "Array(Bool)",
            ValueType::BytesList => "Array(Bytes)",
            ValueType::UnixTimestampList => "Array(UnixTimestamp)",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How far a value may be converted to reach a declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastMode {
    /// Identity plus lossless widening (Int32 -> Int64, Float32 -> Float64).
    Strict,
    /// Any representable numeric conversion, RFC3339 strings and epoch seconds to timestamps,
    /// base64 strings to bytes. Used for caller supplied data.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    String(String),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    UnixTimestamp(DateTime<Utc>),
    StringList(Vec<String>),
    Int32List(Vec<i32>),
    Int64List(Vec<i64>),
    Float32List(Vec<f32>),
    Float64List(Vec<f64>),
    BoolList(Vec<bool>),
    BytesList(Vec<Vec<u8>>),
    UnixTimestampList(Vec<DateTime<Utc>>),
}

impl Value {
    /// Kind of this value, `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        let kind = match self {
            Value::Null => return None,
            Value::String(_) => ValueType::String,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::Bool(_) => ValueType::Bool,
            Value::Bytes(_) => ValueType::Bytes,
            Value::UnixTimestamp(_) => ValueType::UnixTimestamp,
            Value::StringList(_) => ValueType::StringList,
            Value::Int32List(_) => ValueType::Int32List,
            Value::Int64List(_) => ValueType::Int64List,
            Value::Float32List(_) => ValueType::Float32List,
            Value::Float64List(_) => ValueType::Float64List,
            Value::BoolList(_) => ValueType::BoolList,
            Value::BytesList(_) => ValueType::BytesList,
            Value::UnixTimestampList(_) => ValueType::UnixTimestampList,
        };
        Some(kind)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Float32(f) => Some(*f as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::UnixTimestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Converts this value to `target`, `None` when the conversion is not allowed by `mode`.
    /// Null converts to every type.
    pub fn cast(&self, target: ValueType, mode: CastMode) -> Option<Value> {
        if self.is_null() || self.value_type() == Some(target) {
            return Some(self.clone());
        }
        match target.element_type() {
            Some(element) => {
                let items = self.list_items()?;
                let cast = items.iter().map(|item| item.cast_scalar(element, mode)).collect::<Option<Vec<_>>>()?;
                Value::list_of(element, cast)
            }
            None => self.cast_scalar(target, mode),
        }
    }

    fn cast_scalar(&self, target: ValueType, mode: CastMode) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (v, t) if v.value_type() == Some(t) => Some(v.clone()),
            (Value::Int32(i), ValueType::Int64) => Some(Value::Int64(*i as i64)),
            (Value::Float32(f), ValueType::Float64) => Some(Value::Float64(*f as f64)),
            _ if mode == CastMode::Strict => None,
            (Value::Int64(i), ValueType::Int32) => i32::try_from(*i).ok().map(Value::Int32),
            (Value::Int32(_) | Value::Int64(_), ValueType::Float32) => self.as_f64().map(|f| Value::Float32(f as f32)),
            (Value::Int32(_) | Value::Int64(_), ValueType::Float64) => self.as_f64().map(Value::Float64),
            (Value::Float64(f), ValueType::Float32) => Some(Value::Float32(*f as f32)),
            (Value::Float32(_) | Value::Float64(_), ValueType::Int32) => {
                integral(self.as_f64()?).and_then(|i| i32::try_from(i).ok()).map(Value::Int32)
            }
            (Value::Float32(_) | Value::Float64(_), ValueType::Int64) => integral(self.as_f64()?).map(Value::Int64),
            (Value::String(s), ValueType::UnixTimestamp) => {
                DateTime::parse_from_rfc3339(s).ok().map(|ts| Value::UnixTimestamp(ts.with_timezone(&Utc)))
            }
            (Value::Int32(_) | Value::Int64(_), ValueType::UnixTimestamp) => {
                Utc.timestamp_opt(self.as_i64()?, 0).single().map(Value::UnixTimestamp)
            }
            (Value::String(s), ValueType::Bytes) => general_purpose::STANDARD.decode(s).ok().map(Value::Bytes),
            _ => None,
        }
    }

    fn list_items(&self) -> Option<Vec<Value>> {
        let items = match self {
            Value::StringList(v) => v.iter().cloned().map(Value::String).collect(),
            Value::Int32List(v) => v.iter().copied().map(Value::Int32).collect(),
            Value::Int64List(v) => v.iter().copied().map(Value::Int64).collect(),
            Value::Float32List(v) => v.iter().copied().map(Value::Float32).collect(),
            Value::Float64List(v) => v.iter().copied().map(Value::Float64).collect(),
            Value::BoolList(v) => v.iter().copied().map(Value::Bool).collect(),
            Value::BytesList(v) => v.iter().cloned().map(Value::Bytes).collect(),
            Value::UnixTimestampList(v) => v.iter().copied().map(Value::UnixTimestamp).collect(),
            _ => return None,
        };
        Some(items)
    }

    /// Builds a list of `element` kind, `None` if any item is of another kind.
    pub fn list_of(element: ValueType, items: Vec<Value>) -> Option<Value> {
        let list = match element {
            ValueType::String => Value::StringList(items.into_iter().map(|v| match v { Value::String(s) => Some(s), _ => None }).collect::<Option<_>>()?),
            ValueType::Int32 => Value::Int32List(items.into_iter().map(|v| match v { Value::Int32(i) => Some(i), _ => None }).collect::<Option<_>>()?),
            ValueType::Int64 => Value::Int64List(items.into_iter().map(|v| match v { Value::Int64(i) => Some(i), _ => None }).collect::<Option<_>>()?),
            ValueType::Float32 => Value::Float32List(items.into_iter().map(|v| match v { Value::Float32(f) => Some(f), _ => None }).collect::<Option<_>>()?),
            ValueType::Float64 => Value::Float64List(items.into_iter().map(|v| match v { Value::Float64(f) => Some(f), _ => None }).collect::<Option<_>>()?),
            ValueType::Bool => Value::BoolList(items.into_iter().map(|v| match v { Value::Bool(b) => Some(b), _ => None }).collect::<Option<_>>()?),
            ValueType::Bytes => Value::BytesList(items.into_iter().map(|v| match v { Value::Bytes(b) => Some(b), _ => None }).collect::<Option<_>>()?),
            ValueType::UnixTimestamp => Value::UnixTimestampList(items.into_iter().map(|v| match v { Value::UnixTimestamp(t) => Some(t), _ => None }).collect::<Option<_>>()?),
            _ => return None,
        };
        Some(list)
    }

    /// Infers a value from untyped JSON: integers become Int64, other numbers Float64,
    /// arrays take the kind of their first non-null item.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int64(i)),
                None => n.as_f64().map(Value::Float64),
            },
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(items) => {
                let items = items.iter().map(Value::from_json).collect::<Option<Vec<_>>>()?;
                if items.iter().any(Value::is_null) {
                    return None;
                }
                let element = if items.iter().any(|v| matches!(v, Value::Float64(_))) {
                    ValueType::Float64
                } else {
                    items.first().and_then(Value::value_type).unwrap_or(ValueType::String)
                };
                let items = items.iter().map(|v| v.cast_scalar(element, CastMode::Lenient)).collect::<Option<Vec<_>>>()?;
                Value::list_of(element, items)
            }
            serde_json::Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        fn float(f: f64) -> Json {
            serde_json::Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null)
        }
        fn bytes(b: &[u8]) -> Json {
            Json::String(general_purpose::STANDARD.encode(b))
        }
        fn ts(t: &DateTime<Utc>) -> Json {
            Json::String(t.to_rfc3339())
        }
        match self {
            Value::Null => Json::Null,
            Value::String(s) => Json::String(s.clone()),
            Value::Int32(i) => Json::from(*i),
            Value::Int64(i) => Json::from(*i),
            Value::Float32(f) => float(*f as f64),
            Value::Float64(f) => float(*f),
            Value::Bool(b) => Json::Bool(*b),
            Value::Bytes(b) => bytes(b),
            Value::UnixTimestamp(t) => ts(t),
            Value::StringList(v) => Json::Array(v.iter().cloned().map(Json::String).collect()),
            Value::Int32List(v) => Json::Array(v.iter().map(|i| Json::from(*i)).collect()),
            Value::Int64List(v) => Json::Array(v.iter().map(|i| Json::from(*i)).collect()),
            Value::Float32List(v) => Json::Array(v.iter().map(|f| float(*f as f64)).collect()),
            Value::Float64List(v) => Json::Array(v.iter().map(|f| float(*f)).collect()),
            Value::BoolList(v) => Json::Array(v.iter().map(|b| Json::Bool(*b)).collect()),
            Value::BytesList(v) => Json::Array(v.iter().map(|b| bytes(b)).collect()),
            Value::UnixTimestampList(v) => Json::Array(v.iter().map(ts).collect()),
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::UnixTimestamp(t) => write!(f, "{}", t.to_rfc3339()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int32(v) }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int64(v) }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self { Value::Float32(v) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float64(v) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}
impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self { Value::UnixTimestamp(v) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(Value::Null) }
}
