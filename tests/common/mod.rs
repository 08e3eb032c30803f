#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use folio::application::adapter::{
    Adapter, CreateParams, DeleteManyParams, DeleteParams, GetListParams, GetListResult,
    GetManyParams, GetManyReferenceParams, GetOneParams, UpdateManyParams, UpdateParams, Verb,
};
use folio::application::effects::{EffectSink, Notification};
use folio::application::error::DataError;
use folio::domain::entities::Record;
use folio::domain::types::{Identifier, Resource};
use folio::infra::memory::InMemoryAdapter;

pub fn record(value: Value) -> Record {
    Record::from_value(value).expect("fixture record should be an object")
}

pub fn ids(values: &[i64]) -> Vec<Identifier> {
    values.iter().copied().map(Identifier::Int).collect()
}

/// In-memory backend that counts calls, fails on request and can hold calls
/// in flight until released.
pub struct ScriptedAdapter {
    backend: InMemoryAdapter,
    calls: Mutex<Vec<(Verb, Vec<Identifier>)>>,
    failures: Mutex<HashMap<(Verb, usize), DataError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedAdapter {
    pub fn new(resources: Vec<(&str, Vec<Record>)>) -> Arc<Self> {
        let backend = InMemoryAdapter::with_records(
            resources
                .into_iter()
                .map(|(name, records)| (Resource::new(name), records)),
        );
        Arc::new(Self {
            backend,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            gate: Mutex::new(None),
        })
    }

    pub fn calls(&self, verb: Verb) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(called, _)| *called == verb)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// Ids carried by each call of `verb`, in call order.
    pub fn call_ids(&self, verb: Verb) -> Vec<Vec<Identifier>> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(called, _)| *called == verb)
            .map(|(_, ids)| ids.clone())
            .collect()
    }

    /// The next call of `verb` to arrive fails with `error`, even if calls
    /// held by the gate are later released in a different order.
    pub fn fail_next(&self, verb: Verb, error: DataError) {
        let index = self.calls(verb);
        self.failures
            .lock()
            .expect("failures lock")
            .insert((verb, index), error);
    }

    /// Hold every subsequent call until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate.lock().expect("gate lock") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().expect("gate lock").take() {
            gate.close();
        }
    }

    pub fn records(&self, resource: &str) -> Vec<Record> {
        self.backend.records(&Resource::new(resource))
    }

    async fn enter(&self, verb: Verb, ids: Vec<Identifier>) -> Result<(), DataError> {
        let index = self.calls(verb);
        self.calls.lock().expect("calls lock").push((verb, ids));
        let gate = self.gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            // Closing the semaphore is the release signal.
            let _ = gate.acquire().await;
        }
        match self
            .failures
            .lock()
            .expect("failures lock")
            .remove(&(verb, index))
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn get_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError> {
        self.enter(Verb::GetList, Vec::new()).await?;
        self.backend.get_list(resource, params).await
    }

    async fn get_one(&self, resource: &Resource, params: GetOneParams) -> Result<Record, DataError> {
        self.enter(Verb::GetOne, vec![params.id.clone()]).await?;
        self.backend.get_one(resource, params).await
    }

    async fn get_many(
        &self,
        resource: &Resource,
        params: GetManyParams,
    ) -> Result<Vec<Record>, DataError> {
        self.enter(Verb::GetMany, params.ids.clone()).await?;
        self.backend.get_many(resource, params).await
    }

    async fn get_many_reference(
        &self,
        resource: &Resource,
        params: GetManyReferenceParams,
    ) -> Result<GetListResult, DataError> {
        self.enter(Verb::GetManyReference, vec![params.id.clone()])
            .await?;
        self.backend.get_many_reference(resource, params).await
    }

    async fn create(&self, resource: &Resource, params: CreateParams) -> Result<Record, DataError> {
        self.enter(Verb::Create, Vec::new()).await?;
        self.backend.create(resource, params).await
    }

    async fn update(&self, resource: &Resource, params: UpdateParams) -> Result<Record, DataError> {
        self.enter(Verb::Update, vec![params.id.clone()]).await?;
        self.backend.update(resource, params).await
    }

    async fn update_many(
        &self,
        resource: &Resource,
        params: UpdateManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        self.enter(Verb::UpdateMany, params.ids.clone()).await?;
        self.backend.update_many(resource, params).await
    }

    async fn delete(&self, resource: &Resource, params: DeleteParams) -> Result<Record, DataError> {
        self.enter(Verb::Delete, vec![params.id.clone()]).await?;
        self.backend.delete(resource, params).await
    }

    async fn delete_many(
        &self,
        resource: &Resource,
        params: DeleteManyParams,
    ) -> Result<Vec<Identifier>, DataError> {
        self.enter(Verb::DeleteMany, params.ids.clone()).await?;
        self.backend.delete_many(resource, params).await
    }
}

/// Effect sink that records what it was asked to do.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    redirects: Mutex<Vec<String>>,
    refreshes: Mutex<usize>,
    session_invalidations: Mutex<usize>,
}

impl RecordingSink {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().expect("sink lock").clone()
    }

    pub fn redirects(&self) -> Vec<String> {
        self.redirects.lock().expect("sink lock").clone()
    }

    pub fn refreshes(&self) -> usize {
        *self.refreshes.lock().expect("sink lock")
    }

    pub fn session_invalidations(&self) -> usize {
        *self.session_invalidations.lock().expect("sink lock")
    }

    pub fn is_empty(&self) -> bool {
        self.notifications().is_empty()
            && self.redirects().is_empty()
            && self.refreshes() == 0
            && self.session_invalidations() == 0
    }
}

impl EffectSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.notifications
            .lock()
            .expect("sink lock")
            .push(notification.clone());
    }

    fn redirect(&self, path: &str) {
        self.redirects.lock().expect("sink lock").push(path.to_string());
    }

    fn refresh(&self) {
        *self.refreshes.lock().expect("sink lock") += 1;
    }

    fn invalidate_session(&self) {
        *self.session_invalidations.lock().expect("sink lock") += 1;
    }
}
