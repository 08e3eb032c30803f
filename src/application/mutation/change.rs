//! Local cache changes produced by mutations.
//!
//! A [`CacheChange`] is a pure description; [`CacheChange::plan`] turns it
//! into concrete per-entry writes against the current cache contents.

use uuid::Uuid;

use crate::application::adapter::Verb;
use crate::cache::{CacheStore, CacheValue, Fingerprint};
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

use super::types::{MutationOutcome, MutationRequest};

const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    /// Merge `data` into every cached copy of the records.
    Patch {
        resource: Resource,
        ids: Vec<Identifier>,
        data: Record,
    },
    /// Replace every cached copy of the record; also seeds its `getOne` entry.
    Upsert { resource: Resource, record: Record },
    /// Drop the records from collections and their `getOne` entries.
    Remove {
        resource: Resource,
        ids: Vec<Identifier>,
    },
    /// Prepend to first-page lists and seed the `getOne` entry.
    Insert { resource: Resource, record: Record },
    /// Swap a temporary record for the one the backend created.
    Replace {
        resource: Resource,
        temp_id: Identifier,
        record: Record,
    },
}

/// A planned write: `None` removes the entry.
pub(crate) type EntryWrite = (Fingerprint, Option<CacheValue>);

impl CacheChange {
    pub fn resource(&self) -> &Resource {
        match self {
            CacheChange::Patch { resource, .. }
            | CacheChange::Upsert { resource, .. }
            | CacheChange::Remove { resource, .. }
            | CacheChange::Insert { resource, .. }
            | CacheChange::Replace { resource, .. } => resource,
        }
    }

    /// Entries this change creates even when they are not cached yet.
    fn seeded_keys(&self) -> Vec<Fingerprint> {
        match self {
            CacheChange::Upsert { resource, record } | CacheChange::Insert { resource, record } => {
                record
                    .id()
                    .map(|id| vec![Fingerprint::one(resource, &id)])
                    .unwrap_or_default()
            }
            CacheChange::Replace {
                resource,
                temp_id,
                record,
            } => {
                let mut keys = vec![Fingerprint::one(resource, temp_id)];
                keys.extend(record.id().map(|id| Fingerprint::one(resource, &id)));
                keys
            }
            CacheChange::Patch { .. } | CacheChange::Remove { .. } => Vec::new(),
        }
    }

    /// Compute the writes this change implies for the current cache contents.
    pub(crate) fn plan(&self, cache: &CacheStore) -> Vec<EntryWrite> {
        let mut keys = cache.fingerprints_for(self.resource());
        for key in self.seeded_keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        keys.into_iter()
            .filter_map(|key| {
                let current = cache.peek(&key);
                self.apply_to(&key, current.as_ref()).map(|next| (key, next))
            })
            .collect()
    }

    /// `None` leaves the entry untouched; `Some(None)` removes it.
    fn apply_to(&self, key: &Fingerprint, current: Option<&CacheValue>) -> Option<Option<CacheValue>> {
        if key.resource() != self.resource() {
            return None;
        }

        match self {
            CacheChange::Patch { ids, data, .. } => {
                let current = current?;
                if !ids.iter().any(|id| current.contains(id)) {
                    return None;
                }
                Some(Some(map_records(current, |record| {
                    if record.id().is_some_and(|id| ids.contains(&id)) {
                        let mut patched = record.clone();
                        patched.merge(data);
                        Some(patched)
                    } else {
                        Some(record.clone())
                    }
                })))
            }
            CacheChange::Upsert { record, .. } => {
                let id = record.id()?;
                if key.verb() == Verb::GetOne && key.ids() == [id.clone()] {
                    return Some(Some(CacheValue::Record(record.clone())));
                }
                let current = current?;
                if !current.contains(&id) {
                    return None;
                }
                Some(Some(replace_record(current, &id, record)))
            }
            CacheChange::Remove { ids, .. } => {
                if key.verb() == Verb::GetOne && key.ids().iter().any(|id| ids.contains(id)) {
                    return current.map(|_| None);
                }
                let current = current?;
                if !ids.iter().any(|id| current.contains(id)) {
                    return None;
                }
                Some(Some(map_records(current, |record| {
                    if record.id().is_some_and(|id| ids.contains(&id)) {
                        None
                    } else {
                        Some(record.clone())
                    }
                })))
            }
            CacheChange::Insert { record, .. } => {
                if key.verb() == Verb::GetOne {
                    let id = record.id()?;
                    return (key.ids() == [id]).then(|| Some(CacheValue::Record(record.clone())));
                }
                if key.verb() != Verb::GetList || !key.is_first_page() {
                    return None;
                }
                match current? {
                    CacheValue::List { data, total } => {
                        let mut data = data.clone();
                        data.insert(0, record.clone());
                        Some(Some(CacheValue::List {
                            data,
                            total: total + 1,
                        }))
                    }
                    _ => None,
                }
            }
            CacheChange::Replace {
                temp_id, record, ..
            } => {
                if key.verb() == Verb::GetOne {
                    if key.ids() == [temp_id.clone()] {
                        return current.map(|_| None);
                    }
                    let id = record.id()?;
                    return (key.ids() == [id]).then(|| Some(CacheValue::Record(record.clone())));
                }
                let current = current?;
                if !current.contains(temp_id) {
                    return None;
                }
                Some(Some(replace_record(current, temp_id, record)))
            }
        }
    }
}

/// Rebuild a value record by record; `None` drops the record.
fn map_records(value: &CacheValue, mut f: impl FnMut(&Record) -> Option<Record>) -> CacheValue {
    match value {
        CacheValue::Record(record) => match f(record) {
            Some(record) => CacheValue::Record(record),
            None => CacheValue::Records(Vec::new()),
        },
        CacheValue::Records(records) => CacheValue::Records(records.iter().filter_map(f).collect()),
        CacheValue::List { data, total } => {
            let kept: Vec<Record> = data.iter().filter_map(f).collect();
            let removed = (data.len() - kept.len()) as u64;
            CacheValue::List {
                data: kept,
                total: total.saturating_sub(removed),
            }
        }
    }
}

fn replace_record(value: &CacheValue, id: &Identifier, replacement: &Record) -> CacheValue {
    map_records(value, |record| {
        if record.id().as_ref() == Some(id) {
            Some(replacement.clone())
        } else {
            Some(record.clone())
        }
    })
}

pub(crate) fn temporary_id() -> Identifier {
    Identifier::Str(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
}

/// Changes applied before the backend answers. For a create without an id,
/// `temp_id` is the placeholder identity of the inserted record.
pub(crate) fn optimistic_changes(
    request: &MutationRequest,
    temp_id: Option<&Identifier>,
) -> Vec<CacheChange> {
    match request {
        MutationRequest::Create { resource, data } => {
            let mut record = data.clone();
            if let Some(temp_id) = temp_id {
                record.set_id(temp_id.clone());
            }
            vec![CacheChange::Insert {
                resource: resource.clone(),
                record,
            }]
        }
        MutationRequest::Update {
            resource, id, data, ..
        } => vec![CacheChange::Patch {
            resource: resource.clone(),
            ids: vec![id.clone()],
            data: data.clone(),
        }],
        MutationRequest::UpdateMany {
            resource, ids, data,
        } => vec![CacheChange::Patch {
            resource: resource.clone(),
            ids: ids.clone(),
            data: data.clone(),
        }],
        MutationRequest::Delete { resource, id, .. } => vec![CacheChange::Remove {
            resource: resource.clone(),
            ids: vec![id.clone()],
        }],
        MutationRequest::DeleteMany { resource, ids } => vec![CacheChange::Remove {
            resource: resource.clone(),
            ids: ids.clone(),
        }],
    }
}

/// Changes that reconcile the cache with the backend's answer.
pub(crate) fn server_changes(
    request: &MutationRequest,
    outcome: &MutationOutcome,
    temp_id: Option<&Identifier>,
) -> Vec<CacheChange> {
    let resource = request.resource().clone();
    match (request, outcome) {
        (MutationRequest::Create { .. }, MutationOutcome::Record(record)) => match temp_id {
            Some(temp_id) => vec![CacheChange::Replace {
                resource,
                temp_id: temp_id.clone(),
                record: record.clone(),
            }],
            None => vec![CacheChange::Insert {
                resource,
                record: record.clone(),
            }],
        },
        (MutationRequest::Update { .. }, MutationOutcome::Record(record)) => {
            vec![CacheChange::Upsert {
                resource,
                record: record.clone(),
            }]
        }
        (MutationRequest::UpdateMany { data, .. }, MutationOutcome::Ids(ids)) => {
            vec![CacheChange::Patch {
                resource,
                ids: ids.clone(),
                data: data.clone(),
            }]
        }
        (MutationRequest::Delete { id, .. }, _) => vec![CacheChange::Remove {
            resource,
            ids: vec![id.clone()],
        }],
        (MutationRequest::DeleteMany { .. }, MutationOutcome::Ids(ids)) => {
            vec![CacheChange::Remove {
                resource,
                ids: ids.clone(),
            }]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::application::adapter::GetListParams;
    use crate::cache::CacheConfig;

    fn posts() -> Resource {
        Resource::new("posts")
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).expect("record")
    }

    fn seeded() -> (CacheStore, Fingerprint) {
        let cache = CacheStore::new(&CacheConfig::default());
        let list = Fingerprint::list(&posts(), &GetListParams::default());
        cache.write(
            &list,
            CacheValue::List {
                data: vec![
                    record(json!({"id": 1, "title": "A"})),
                    record(json!({"id": 2, "title": "B"})),
                ],
                total: 2,
            },
        );
        cache.write(
            &Fingerprint::one(&posts(), &Identifier::Int(1)),
            CacheValue::Record(record(json!({"id": 1, "title": "A"}))),
        );
        (cache, list)
    }

    fn apply(cache: &CacheStore, change: &CacheChange) {
        for (key, value) in change.plan(cache) {
            match value {
                Some(value) => cache.write(&key, value),
                None => cache.remove(&key),
            }
        }
    }

    #[test]
    fn patch_merges_every_cached_copy() {
        let (cache, list) = seeded();
        apply(
            &cache,
            &CacheChange::Patch {
                resource: posts(),
                ids: vec![Identifier::Int(1)],
                data: record(json!({"title": "A2"})),
            },
        );

        let one = cache
            .peek(&Fingerprint::one(&posts(), &Identifier::Int(1)))
            .and_then(CacheValue::into_record)
            .expect("one");
        assert_eq!(one.get("title"), Some(&json!("A2")));
        let list = cache.peek(&list).expect("list");
        assert_eq!(list.records()[0].get("title"), Some(&json!("A2")));
        assert_eq!(list.records()[1].get("title"), Some(&json!("B")));
    }

    #[test]
    fn remove_drops_records_and_decrements_total() {
        let (cache, list) = seeded();
        apply(
            &cache,
            &CacheChange::Remove {
                resource: posts(),
                ids: vec![Identifier::Int(1)],
            },
        );

        assert!(cache.peek(&Fingerprint::one(&posts(), &Identifier::Int(1))).is_none());
        let list = cache.peek(&list).expect("list");
        assert_eq!(list.total(), Some(1));
        assert!(!list.contains(&Identifier::Int(1)));
    }

    #[test]
    fn insert_prepends_to_first_page_only() {
        let (cache, list) = seeded();
        let second_page = Fingerprint::list(
            &posts(),
            &GetListParams {
                pagination: crate::application::pagination::Pagination::new(2, 10).expect("page"),
                ..Default::default()
            },
        );
        cache.write(&second_page, CacheValue::List { data: vec![], total: 2 });

        apply(
            &cache,
            &CacheChange::Insert {
                resource: posts(),
                record: record(json!({"id": "tmp-1", "title": "New"})),
            },
        );

        let first = cache.peek(&list).expect("list");
        assert_eq!(first.total(), Some(3));
        assert_eq!(first.records()[0].id(), Some(Identifier::from("tmp-1")));
        assert_eq!(cache.peek(&second_page).and_then(|v| v.total()), Some(2));
        assert!(cache.peek(&Fingerprint::one(&posts(), &Identifier::from("tmp-1"))).is_some());
    }

    #[test]
    fn replace_swaps_temporary_identity() {
        let (cache, list) = seeded();
        let temp = Identifier::from("tmp-1");
        apply(
            &cache,
            &CacheChange::Insert {
                resource: posts(),
                record: record(json!({"id": "tmp-1", "title": "New"})),
            },
        );
        apply(
            &cache,
            &CacheChange::Replace {
                resource: posts(),
                temp_id: temp.clone(),
                record: record(json!({"id": 3, "title": "New"})),
            },
        );

        let first = cache.peek(&list).expect("list");
        assert!(first.contains(&Identifier::Int(3)));
        assert!(!first.contains(&temp));
        assert!(cache.peek(&Fingerprint::one(&posts(), &temp)).is_none());
        assert!(cache.peek(&Fingerprint::one(&posts(), &Identifier::Int(3))).is_some());
    }

    #[test]
    fn other_resources_are_untouched() {
        let (cache, _) = seeded();
        let change = CacheChange::Remove {
            resource: Resource::new("comments"),
            ids: vec![Identifier::Int(1)],
        };
        assert!(change.plan(&cache).is_empty());
    }

    #[test]
    fn temporary_ids_are_prefixed_and_unique() {
        let a = temporary_id();
        let b = temporary_id();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with(TEMP_ID_PREFIX));
    }
}
