//! Wire formats for payloads and results crossing the unit boundary.
//!
//! Handler-specific transformation happens inside the unit; the codec only
//! moves the JSON data model (null, booleans, numbers, strings, sequences and
//! maps) across intact.

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::core::errors::{ParallelError, Result};

/// Refuse to allocate more than this while decoding a binary frame
const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// UTF-8 JSON text
    #[default]
    Json,
    /// Packed bincode encoding of [`WireValue`]
    Bincode,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Bincode => "bincode",
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Bincode => Ok(bincode_options().serialize(&WireValue::from(value))?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Bincode => {
                let wire: WireValue = bincode_options().deserialize(bytes)?;
                wire.try_into()
            }
        }
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_BYTES)
}

/// Self-describing mirror of the JSON data model.
///
/// bincode cannot drive `serde_json::Value`'s `deserialize_any`, so values are
/// packed through this tagged enum instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Seq(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    WireValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    WireValue::UInt(u)
                } else {
                    WireValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => WireValue::String(s.clone()),
            Value::Array(items) => WireValue::Seq(items.iter().map(WireValue::from).collect()),
            Value::Object(fields) => WireValue::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), WireValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<WireValue> for Value {
    type Error = ParallelError;

    fn try_from(wire: WireValue) -> Result<Self> {
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Number(i.into()),
            WireValue::UInt(u) => Value::Number(u.into()),
            WireValue::Float(f) => Number::from_f64(f).map(Value::Number).ok_or_else(|| {
                ParallelError::serialization(
                    "bincode",
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("non-finite float {}", f),
                    ),
                )
            })?,
            WireValue::String(s) => Value::String(s),
            WireValue::Seq(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::Map(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key, Value::try_from(value)?);
                }
                Value::Object(map)
            }
        })
    }
}
