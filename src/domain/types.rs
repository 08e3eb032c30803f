//! Identity primitives shared by every layer.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name of a backend collection (e.g. `posts`).
///
/// Opaque to the core; it is only ever used as a namespace key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Arc<str>);

impl Resource {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Resource {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Resource {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Record identifier. Backends use either integer or string keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Int(i64),
    Str(String),
}

impl Identifier {
    /// Parse a user-supplied id, preferring the integer form when it fits.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(value) => Self::Int(value),
            Err(_) => Self::Str(raw.trim().to_string()),
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(number) => number.as_i64().map(Self::Int),
            serde_json::Value::String(text) => Some(Self::Str(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Str(value) => serde_json::Value::from(value.as_str()),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}
