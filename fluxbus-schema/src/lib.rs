//! Fluxbus Payload Model
//!
//! Defines the opaque, tagged payload carried by every event on the bus.
//! Payloads are string-keyed maps of dynamically typed values so publishers
//! never have to register a schema up front.

use ahash::AHashMap;
use thiserror::Error;

/// A dynamically typed payload value.
///
/// Mirrors the handful of shapes publishers actually send: scalars, byte
/// blobs, lists, and nested maps.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Payload),
    Null,
}

/// A string-keyed bag of [`Value`]s: the body of an `Event`.
pub type Payload = AHashMap<String, Value>;

/// Reserved key under which the queue subsystem stamps `queue_meta` onto a
/// serialized payload snapshot.
pub const RESERVED_QUEUE_META_KEY: &str = "_queue_meta";

/// Reserved key under which the backlog stamps `backlog_meta`.
pub const RESERVED_BACKLOG_META_KEY: &str = "_backlog_meta";

/// True if `key` is one of the reserved, underscore-prefixed structural keys
/// the bus stamps onto payload snapshots. Publishers should avoid these.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with('_')
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            Value::I64(v) => Some(*v as f64),
            Value::U64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

// Manual Serialize/Deserialize so the externally-tagged shape stays stable
// even as variants are added, and so nested Map/Array round-trip cleanly.
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::I64(v) => serializer.serialize_newtype_variant("Value", 0, "I64", v),
            Value::U64(v) => serializer.serialize_newtype_variant("Value", 1, "U64", v),
            Value::F64(v) => serializer.serialize_newtype_variant("Value", 2, "F64", v),
            Value::Bool(v) => serializer.serialize_newtype_variant("Value", 3, "Bool", v),
            Value::String(v) => serializer.serialize_newtype_variant("Value", 4, "String", v),
            Value::Bytes(v) => serializer.serialize_newtype_variant("Value", 5, "Bytes", v),
            Value::Array(v) => serializer.serialize_newtype_variant("Value", 6, "Array", v),
            Value::Map(v) => {
                let entries: Vec<(&String, &Value)> = v.iter().collect();
                serializer.serialize_newtype_variant("Value", 7, "Map", &entries)
            }
            Value::Null => serializer.serialize_unit_variant("Value", 8, "Null"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::VariantAccess;

        #[derive(serde::Deserialize)]
        #[serde(field_identifier, rename_all = "lowercase")]
        enum Field {
            I64,
            U64,
            F64,
            Bool,
            String,
            Bytes,
            Array,
            Map,
            Null,
        }

        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a Value variant")
            }

            fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::EnumAccess<'de>,
            {
                match data.variant::<Field>()? {
                    (Field::I64, v) => v.newtype_variant().map(Value::I64),
                    (Field::U64, v) => v.newtype_variant().map(Value::U64),
                    (Field::F64, v) => v.newtype_variant().map(Value::F64),
                    (Field::Bool, v) => v.newtype_variant().map(Value::Bool),
                    (Field::String, v) => v.newtype_variant().map(Value::String),
                    (Field::Bytes, v) => v.newtype_variant().map(Value::Bytes),
                    (Field::Array, v) => v.newtype_variant().map(Value::Array),
                    (Field::Map, v) => {
                        let entries: Vec<(String, Value)> = v.newtype_variant()?;
                        Ok(Value::Map(entries.into_iter().collect()))
                    }
                    (Field::Null, v) => {
                        v.unit_variant()?;
                        Ok(Value::Null)
                    }
                }
            }
        }

        deserializer.deserialize_enum(
            "Value",
            &[
                "i64", "u64", "f64", "bool", "string", "bytes", "array", "map", "null",
            ],
            ValueVisitor,
        )
    }
}

/// Errors surfaced while working with payload values.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("reserved key used by caller: {0}")]
    ReservedKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_key_detection() {
        assert!(is_reserved_key("_queue_meta"));
        assert!(!is_reserved_key("user_id"));
    }

    #[test]
    fn scalar_coercions() {
        assert_eq!(Value::I64(-4).as_u64(), None);
        assert_eq!(Value::U64(4).as_i64(), Some(4));
        assert_eq!(Value::F64(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::I64(2).as_f64(), Some(2.0));
    }

    #[test]
    fn nested_map_access() {
        let mut inner = Payload::default();
        inner.insert("a".to_string(), Value::I64(1));
        let v = Value::Map(inner);
        assert_eq!(v.as_map().unwrap().get("a"), Some(&Value::I64(1)));
    }

    #[test]
    fn serde_roundtrip_scalar() {
        let v = Value::String("hello".to_string());
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn serde_roundtrip_map() {
        let mut m = Payload::default();
        m.insert("x".to_string(), Value::I64(7));
        let v = Value::Map(m);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_map().unwrap().get("x"), Some(&Value::I64(7)));
    }
}
