//! In-process adapter with fake-REST semantics.
//!
//! Used by the CLI when no REST backend is configured, and by tests as the
//! backing store for scripted adapters.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::application::adapter::{
    Adapter, CreateParams, DeleteManyParams, DeleteParams, GetListParams, GetListResult,
    GetManyParams, GetManyReferenceParams, GetOneParams, UpdateManyParams, UpdateParams,
};
use crate::application::error::DataError;
use crate::application::pagination::{Filter, Pagination, Sort, SortOrder};
use crate::cache::{rw_read, rw_write};
use crate::domain::entities::{ID_FIELD, Record};
use crate::domain::types::{Identifier, Resource};

use super::error::InfraError;

const SOURCE: &str = "infra::memory";
/// Filter key that triggers full-text search instead of field equality.
const FULL_TEXT_KEY: &str = "q";

#[derive(Debug, Default)]
struct Collection {
    records: Vec<Record>,
    next_id: i64,
}

impl Collection {
    fn new(records: Vec<Record>) -> Self {
        let next_id = records
            .iter()
            .filter_map(|record| match record.id() {
                Some(Identifier::Int(id)) => Some(id),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        Self { records, next_id }
    }

    fn position(&self, id: &Identifier) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.id().as_ref() == Some(id))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    collections: RwLock<HashMap<Resource, Collection>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(
        collections: impl IntoIterator<Item = (Resource, Vec<Record>)>,
    ) -> Self {
        let collections = collections
            .into_iter()
            .map(|(resource, records)| (resource, Collection::new(records)))
            .collect();
        Self {
            collections: RwLock::new(collections),
        }
    }

    /// Parse a fixture of the form `{ "posts": [ {...}, ... ], ... }`.
    pub fn from_fixture_str(source: &str, origin: &str) -> Result<Self, InfraError> {
        let value: Value = serde_json::from_str(source)
            .map_err(|err| InfraError::fixture(origin, err.to_string()))?;
        let Value::Object(resources) = value else {
            return Err(InfraError::fixture(origin, "top level must be a JSON object"));
        };

        let mut collections = Vec::with_capacity(resources.len());
        for (name, records) in resources {
            let Value::Array(items) = records else {
                return Err(InfraError::fixture(
                    origin,
                    format!("`{name}` must be an array of records"),
                ));
            };
            let records = items
                .into_iter()
                .map(|item| {
                    Record::from_value(item)
                        .map_err(|err| InfraError::fixture(origin, format!("`{name}`: {err}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            collections.push((Resource::from(name), records));
        }

        info!(origin, resources = collections.len(), "fixture loaded");
        Ok(Self::with_records(collections))
    }

    pub async fn from_fixture_file(path: &Path) -> Result<Self, InfraError> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_fixture_str(&source, &path.display().to_string())
    }

    /// Current contents of a resource, in storage order.
    pub fn records(&self, resource: &Resource) -> Vec<Record> {
        rw_read(&self.collections, SOURCE, "records")
            .get(resource)
            .map(|collection| collection.records.clone())
            .unwrap_or_default()
    }

    fn query(
        &self,
        resource: &Resource,
        filter: &Filter,
        sort: &Sort,
        pagination: &Pagination,
    ) -> GetListResult {
        let collections = rw_read(&self.collections, SOURCE, "query");
        let mut matched: Vec<Record> = collections
            .get(resource)
            .map(|collection| {
                collection
                    .records
                    .iter()
                    .filter(|record| matches_filter(record, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        matched.sort_by(|a, b| {
            let ordering = compare_values(a.get(&sort.field), b.get(&sort.field));
            match sort.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matched.len() as u64;
        let data = matched
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.per_page() as usize)
            .collect();

        GetListResult { data, total }
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    async fn get_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError> {
        Ok(self.query(resource, &params.filter, &params.sort, &params.pagination))
    }

    async fn get_one(
        &self,
        resource: &Resource,
        params: GetOneParams,
    ) -> Result<Record, DataError> {
        let collections = rw_read(&self.collections, SOURCE, "get_one");
        collections
            .get(resource)
            .and_then(|collection| {
                collection
                    .position(&params.id)
                    .map(|index| collection.records[index].clone())
            })
            .ok_or_else(|| DataError::not_found(resource, &params.id))
    }

    async fn get_many(
        &self,
        resource: &Resource,
        params: GetManyParams,
    ) -> Result<Vec<Record>, DataError> {
        let collections = rw_read(&self.collections, SOURCE, "get_many");
        let Some(collection) = collections.get(resource) else {
            return Ok(Vec::new());
        };
        Ok(params
            .ids
            .iter()
            .filter_map(|id| {
                collection
                    .position(id)
                    .map(|index| collection.records[index].clone())
            })
            .collect())
    }

    async fn get_many_reference(
        &self,
        resource: &Resource,
        params: GetManyReferenceParams,
    ) -> Result<GetListResult, DataError> {
        let mut filter = params.filter;
        filter.insert(params.target, params.id.to_value());
        Ok(self.query(resource, &filter, &params.sort, &params.pagination))
    }

    async fn create(
        &self,
        resource: &Resource,
        params: CreateParams,
    ) -> Result<Record, DataError> {
        let mut collections = rw_write(&self.collections, SOURCE, "create");
        let collection = collections.entry(resource.clone()).or_default();
        if collection.next_id == 0 {
            collection.next_id = 1;
        }

        let mut record = params.data;
        match record.id() {
            Some(id) if collection.position(&id).is_some() => {
                return Err(DataError::validation(format!(
                    "`{resource}` already contains a record with id `{id}`"
                )));
            }
            Some(Identifier::Int(id)) => {
                collection.next_id = collection.next_id.max(id + 1);
            }
            Some(Identifier::Str(_)) => {}
            None => {
                record.set_id(Identifier::Int(collection.next_id));
                collection.next_id += 1;
            }
        }

        debug!(resource = %resource, id = ?record.id(), "record created");
        collection.records.push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        resource: &Resource,
        params: UpdateParams,
    ) -> Result<Record, DataError> {
        let mut collections = rw_write(&self.collections, SOURCE, "update");
        let collection = collections
            .get_mut(resource)
            .ok_or_else(|| DataError::not_found(resource, &params.id))?;
        let index = collection
            .position(&params.id)
            .ok_or_else(|| DataError::not_found(resource, &params.id))?;

        let record = &mut collection.records[index];
        record.merge(&params.data);
        record.set_id(params.id);
        Ok(record.clone())
    }

    async fn update_many(
        &self,
        resource: &Resource,
        params: UpdateManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        let mut collections = rw_write(&self.collections, SOURCE, "update_many");
        let Some(collection) = collections.get_mut(resource) else {
            return Ok(Vec::new());
        };

        let mut updated = Vec::with_capacity(params.ids.len());
        for id in params.ids {
            if let Some(index) = collection.position(&id) {
                let record = &mut collection.records[index];
                record.merge(&params.data);
                record.set_id(id.clone());
                updated.push(id);
            }
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        resource: &Resource,
        params: DeleteParams,
    ) -> Result<Record, DataError> {
        let mut collections = rw_write(&self.collections, SOURCE, "delete");
        let collection = collections
            .get_mut(resource)
            .ok_or_else(|| DataError::not_found(resource, &params.id))?;
        let index = collection
            .position(&params.id)
            .ok_or_else(|| DataError::not_found(resource, &params.id))?;
        Ok(collection.records.remove(index))
    }

    async fn delete_many(
        &self,
        resource: &Resource,
        params: DeleteManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        let mut collections = rw_write(&self.collections, SOURCE, "delete_many");
        let Some(collection) = collections.get_mut(resource) else {
            return Ok(Vec::new());
        };

        let mut deleted = Vec::with_capacity(params.ids.len());
        for id in params.ids {
            if let Some(index) = collection.position(&id) {
                collection.records.remove(index);
                deleted.push(id);
            }
        }
        Ok(deleted)
    }
}

fn matches_filter(record: &Record, filter: &Filter) -> bool {
    filter.iter().all(|(field, expected)| {
        if field == FULL_TEXT_KEY {
            return matches_full_text(record, expected);
        }
        let actual = record.get(field).unwrap_or(&Value::Null);
        match expected {
            Value::Array(options) => options.iter().any(|option| loosely_equal(actual, option)),
            expected => loosely_equal(actual, expected),
        }
    })
}

fn matches_full_text(record: &Record, needle: &Value) -> bool {
    let needle = match needle {
        Value::String(text) => text.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    if needle.is_empty() {
        return true;
    }
    record
        .fields()
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .any(|(_, value)| match value {
            Value::String(text) => text.to_lowercase().contains(&needle),
            _ => false,
        })
}

/// Equality that also treats `1` and `"1"` as equal, since filters often
/// arrive as strings from a URL or the command line.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(number), Value::String(text))
        | (Value::String(text), Value::Number(number)) => number.to_string() == *text,
        (Value::Bool(flag), Value::String(text)) | (Value::String(text), Value::Bool(flag)) => {
            flag.to_string() == *text
        }
        _ => false,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or_default();
            let b = b.as_f64().unwrap_or_default();
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}
