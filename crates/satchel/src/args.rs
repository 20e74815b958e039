//! Module arguments as handed over by the caller.
//!
//! Values are kept in their own tree rather than as `serde_json::Value` so
//! that things JSON cannot express, such as non-finite floats, reach the
//! serializer and are rejected there instead of quietly turning into `null`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer, ser::Error as _};

/// Key under which the bootstrap expects the arguments.
pub const ARGS_ENVELOPE_KEY: &str = "ANSIBLE_MODULE_ARGS";

pub type ModuleArgs = IndexMap<String, ArgValue>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    Map(IndexMap<String, ArgValue>),
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::UInt(value) => serializer.serialize_u64(*value),
            Self::Float(value) if value.is_finite() => serializer.serialize_f64(*value),
            Self::Float(value) => Err(S::Error::custom(format!(
                "{value} cannot be represented in JSON"
            ))),
            Self::Str(value) => serializer.serialize_str(value),
            Self::List(values) => values.serialize(serializer),
            Self::Map(values) => values.serialize(serializer),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::UInt(value), Self::Int)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Compact JSON of the arguments wrapped in their envelope.
pub fn envelope_json(args: &ModuleArgs) -> serde_json::Result<String> {
    #[derive(Serialize)]
    struct Envelope<'a> {
        #[serde(rename = "ANSIBLE_MODULE_ARGS")]
        args: &'a ModuleArgs,
    }
    serde_json::to_string(&Envelope { args })
}

/// Compact JSON of the bare arguments.
pub fn args_json(args: &ModuleArgs) -> serde_json::Result<String> {
    serde_json::to_string(args)
}
