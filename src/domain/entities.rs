//! Records exchanged with backends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::error::DomainError;
use crate::domain::types::Identifier;

/// Field that carries a record's identity.
pub const ID_FIELD: &str = "id";

/// A backend record: field name to JSON value, identified by its `id` field.
///
/// Equality is structural, but nothing in the cache relies on it; entries are
/// keyed by query fingerprint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with_id(id: Identifier) -> Self {
        let mut record = Self::new();
        record.set_id(id);
        record
    }

    /// Build a record from a JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(DomainError::validation(format!(
                "expected a JSON object for a record, found `{other}`"
            ))),
        }
    }

    pub fn id(&self) -> Option<Identifier> {
        self.0.get(ID_FIELD).and_then(Identifier::from_value)
    }

    pub fn require_id(&self) -> Result<Identifier, DomainError> {
        self.id()
            .ok_or_else(|| DomainError::invariant("record is missing a scalar `id` field"))
    }

    pub fn set_id(&mut self, id: Identifier) {
        self.0.insert(ID_FIELD.to_string(), id.to_value());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Shallow merge: every field of `patch` overwrites the same field here.
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in &patch.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
