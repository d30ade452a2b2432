// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Values that can cross a process boundary.
//!
//! Every message, return value, payload and global is a [`Value`]. The
//! variant doubles as the `data_type` tag on the wire, so the receiver can
//! tell a boolean from an integer without guessing.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

use super::error::CodecError;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// The wire `data_type` tag for this value.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Build a value from any serializable type.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let json = serde_json::to_value(value)?;
        Ok(Self::from_json(json))
    }

    /// Decode this value into a concrete type.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let json = self
            .to_json()
            .ok_or_else(|| CodecError::TypeMismatch {
                declared: self.type_tag().to_string(),
            })?;
        Ok(serde_json::from_value(json)?)
    }

    /// Convert to JSON. Returns `None` for non-finite floats, which JSON
    /// cannot represent.
    pub(crate) fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::Number(serde_json::Number::from_f64(*f)?),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json()?);
                }
                serde_json::Value::Object(out)
            }
        })
    }

    /// Untagged conversion, used for nested values and `from_serialize`.
    pub(crate) fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Tagged conversion: the declared `data_type` decides the variant.
    pub(crate) fn from_tagged_json(tag: &str, json: serde_json::Value) -> Result<Self, CodecError> {
        let mismatch = || CodecError::TypeMismatch {
            declared: tag.to_string(),
        };
        match (tag, json) {
            ("null", serde_json::Value::Null) => Ok(Value::Null),
            ("bool", serde_json::Value::Bool(b)) => Ok(Value::Bool(b)),
            // Older senders encoded booleans as 0/1.
            ("bool", serde_json::Value::Number(n)) => {
                n.as_i64().map(|i| Value::Bool(i > 0)).ok_or_else(mismatch)
            }
            ("int", serde_json::Value::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(mismatch),
            ("float", serde_json::Value::Number(n)) => {
                n.as_f64().map(Value::Float).ok_or_else(mismatch)
            }
            ("string", serde_json::Value::String(s)) => Ok(Value::String(s)),
            ("array", json @ serde_json::Value::Array(_)) => Ok(Value::from_json(json)),
            ("object", json @ serde_json::Value::Object(_)) => Ok(Value::from_json(json)),
            _ => Err(mismatch()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_tags_follow_variants() {
        assert_eq!(Value::from(true).type_tag(), "bool");
        assert_eq!(Value::from(42).type_tag(), "int");
        assert_eq!(Value::from(1.5).type_tag(), "float");
        assert_eq!(Value::from("x").type_tag(), "string");
        assert_eq!(Value::from(vec![1, 2]).type_tag(), "array");
        assert_eq!(Value::Null.type_tag(), "null");
    }

    #[test]
    fn test_bool_tag_accepts_integer_encoding() {
        let v = Value::from_tagged_json("bool", serde_json::json!(1)).unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = Value::from_tagged_json("bool", serde_json::json!(0)).unwrap();
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let err = Value::from_tagged_json("int", serde_json::json!("nope")).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
        assert!(Value::from_tagged_json("mystery", serde_json::json!(null)).is_err());
    }

    #[test]
    fn test_float_tag_keeps_integral_numbers_as_float() {
        let v = Value::from_tagged_json("float", serde_json::json!(3)).unwrap();
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn test_non_finite_float_has_no_json_form() {
        assert!(Value::Float(f64::NAN).to_json().is_none());
        assert!(Value::from(vec![Value::Float(f64::INFINITY)]).to_json().is_none());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        name: String,
        retries: u32,
    }

    #[test]
    fn test_serde_bridge() {
        let job = Job {
            name: "index".into(),
            retries: 3,
        };
        let value = Value::from_serialize(&job).unwrap();
        assert_eq!(value.get("retries"), Some(&Value::Int(3)));
        let back: Job = value.deserialize().unwrap();
        assert_eq!(back, job);
    }
}
