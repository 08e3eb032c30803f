//! Cache key definitions.
//!
//! A [`Fingerprint`] is the deterministic encoding of one adapter read:
//! resource, verb and every parameter that can change the answer. Two reads
//! with the same fingerprint share a cache entry and an in-flight load.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::application::adapter::{GetListParams, GetManyReferenceParams, Verb};
use crate::domain::types::{Identifier, Resource};

use super::store::CacheValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    resource: Resource,
    verb: Verb,
    /// Ids addressed directly by `getOne` / `getMany`, sorted and distinct.
    ids: Vec<Identifier>,
    /// Whether this read covers the first page of its result set.
    first_page: bool,
    params: String,
}

impl Fingerprint {
    pub fn list(resource: &Resource, params: &GetListParams) -> Self {
        Self {
            resource: resource.clone(),
            verb: Verb::GetList,
            ids: Vec::new(),
            first_page: params.pagination.is_first(),
            params: canonical(params),
        }
    }

    pub fn one(resource: &Resource, id: &Identifier) -> Self {
        Self {
            resource: resource.clone(),
            verb: Verb::GetOne,
            ids: vec![id.clone()],
            first_page: false,
            params: canonical(id),
        }
    }

    pub fn many(resource: &Resource, ids: &[Identifier]) -> Self {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        Self {
            resource: resource.clone(),
            verb: Verb::GetMany,
            params: canonical(&ids),
            ids,
            first_page: false,
        }
    }

    pub fn many_reference(resource: &Resource, params: &GetManyReferenceParams) -> Self {
        Self {
            resource: resource.clone(),
            verb: Verb::GetManyReference,
            ids: Vec::new(),
            first_page: params.pagination.is_first(),
            params: canonical(params),
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn ids(&self) -> &[Identifier] {
        &self.ids
    }

    pub fn is_first_page(&self) -> bool {
        self.first_page
    }

    /// Whether this key holds a paginated collection (list or reference list).
    pub fn is_collection(&self) -> bool {
        matches!(self.verb, Verb::GetList | Verb::GetManyReference)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.verb, self.params)
    }
}

/// Selects cache entries to mark stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    All,
    Resource(Resource),
    /// Every entry of the resource that addresses or contains the record.
    Record(Resource, Identifier),
    /// Every entry of the resource produced by the given verb.
    Verb(Resource, Verb),
    /// List and reference-list entries of the resource.
    Collections(Resource),
}

impl Invalidation {
    pub fn matches(&self, fingerprint: &Fingerprint, value: Option<&CacheValue>) -> bool {
        match self {
            Invalidation::All => true,
            Invalidation::Resource(resource) => fingerprint.resource() == resource,
            Invalidation::Verb(resource, verb) => {
                fingerprint.resource() == resource && fingerprint.verb() == *verb
            }
            Invalidation::Collections(resource) => {
                fingerprint.resource() == resource && fingerprint.is_collection()
            }
            Invalidation::Record(resource, id) => {
                fingerprint.resource() == resource
                    && (fingerprint.ids().contains(id)
                        || value.is_some_and(|value| value.contains(id)))
            }
        }
    }
}

/// Canonical JSON: object keys sorted at every depth, no whitespace.
fn canonical<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(value) => {
            let mut out = String::new();
            write_canonical(&value, &mut out);
            out
        }
        Err(err) => format!("!unencodable:{err}"),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = fields.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
