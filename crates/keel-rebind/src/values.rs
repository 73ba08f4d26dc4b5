//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Declared config value types and coercion."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use keel_persistence::ObjectKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Key of the marker object persisted in place of a reference to another object.
pub const REF_MARKER: &str = "$ref";

/// Reference to another persisted object embedded in a config or attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// `{"$ref": {"kind": ..., "id": ...}}`
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            REF_MARKER.to_owned(),
            serde_json::json!({"kind": self.kind, "id": self.id}),
        );
        Value::Object(map)
    }

    /// Parse a reference marker; `None` when the value is not one.
    pub fn from_value(value: &Value) -> Option<Result<Self>> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let inner = map.get(REF_MARKER)?;
        Some(serde_json::from_value(inner.clone()).map_err(|err| anyhow!("malformed reference: {err}")))
    }
}

/// Declared type of a config key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Map,
    Any,
    /// Named type that must be registered with the type registry.
    Custom(String),
}

impl FromStr for ValueType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "string" => ValueType::String,
            "integer" | "int" | "long" => ValueType::Integer,
            "float" | "double" => ValueType::Float,
            "boolean" | "bool" => ValueType::Boolean,
            "list" => ValueType::List,
            "map" => ValueType::Map,
            "any" | "object" => ValueType::Any,
            _ => ValueType::Custom(s.to_owned()),
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => f.write_str("string"),
            ValueType::Integer => f.write_str("integer"),
            ValueType::Float => f.write_str("float"),
            ValueType::Boolean => f.write_str("boolean"),
            ValueType::List => f.write_str("list"),
            ValueType::Map => f.write_str("map"),
            ValueType::Any => f.write_str("any"),
            ValueType::Custom(name) => f.write_str(name),
        }
    }
}

impl ValueType {
    /// Coerce a persisted value to this type.
    ///
    /// `null` is accepted for every type. References are only accepted where an
    /// arbitrary object may appear (`any` and custom types).
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if ObjectRef::from_value(value).is_some() {
            return match self {
                ValueType::Any | ValueType::Custom(_) => Ok(value.clone()),
                other => bail!("cannot coerce object reference to {other}"),
            };
        }
        match (self, value) {
            (ValueType::Any | ValueType::Custom(_), v) => Ok(v.clone()),
            (ValueType::String, Value::String(_)) => Ok(value.clone()),
            (ValueType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ValueType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (ValueType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (ValueType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|err| anyhow!("cannot coerce {s:?} to integer: {err}")),
            (ValueType::Float, Value::Number(n)) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| anyhow!("cannot coerce {n} to float")),
            (ValueType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| anyhow!("cannot coerce {s:?} to float")),
            (ValueType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ValueType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => bail!("cannot coerce {s:?} to boolean"),
            },
            (ValueType::List, Value::Array(_)) => Ok(value.clone()),
            (ValueType::Map, Value::Object(_)) => Ok(value.clone()),
            (expected, actual) => bail!("cannot coerce {actual} to {expected}"),
        }
    }
}
