//! View-facing data provider.
//!
//! Reads go through the cache (single-flight, freshness) and, for lookups by
//! id, through the batching queue. Writes go through the mutation pipeline.
//! Views observe entries with [`DataProvider::subscribe`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::application::adapter::{
    Adapter, CreateParams, DeleteManyParams, DeleteParams, GetListParams, GetListResult,
    GetManyParams, GetManyReferenceParams, GetOneParams, UpdateManyParams, UpdateParams,
};
use crate::application::batch::RequestBatcher;
use crate::application::effects::{
    EffectDescriptor, EffectDispatcher, EffectSink, FailureNotification,
};
use crate::application::error::DataError;
use crate::application::mutation::{
    MutationOptions, MutationOutcome, MutationPipeline, MutationRequest, UndoHandle, UndoQueue,
};
use crate::cache::{
    CacheConfig, CacheStore, CacheValue, EntryEvent, EntryState, Fingerprint, Invalidation,
    Unsubscribe,
};
use crate::config::DataSettings;
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

struct ProviderInner {
    adapter: Arc<dyn Adapter>,
    cache: CacheStore,
    batcher: RequestBatcher,
    effects: EffectDispatcher,
    pipeline: MutationPipeline,
}

#[derive(Clone)]
pub struct DataProvider {
    inner: Arc<ProviderInner>,
}

impl DataProvider {
    pub fn new(adapter: Arc<dyn Adapter>, sink: Arc<dyn EffectSink>, settings: &DataSettings) -> Self {
        let cache = CacheStore::new(&CacheConfig::from(settings));
        let batcher = RequestBatcher::new(adapter.clone(), cache.clone(), settings.batch_max_ids);
        let effects = EffectDispatcher::new(sink, cache.clone());
        let undo = UndoQueue::new(settings.undo_scope, settings.undoable_delay);
        let pipeline = MutationPipeline::new(adapter.clone(), cache.clone(), effects.clone(), undo);

        Self {
            inner: Arc::new(ProviderInner {
                adapter,
                cache,
                batcher,
                effects,
                pipeline,
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn batcher(&self) -> &RequestBatcher {
        &self.inner.batcher
    }

    pub fn pipeline(&self) -> &MutationPipeline {
        &self.inner.pipeline
    }

    pub fn undo_queue(&self) -> &UndoQueue {
        self.inner.pipeline.undo_queue()
    }

    // ----- reads -----

    #[instrument(skip(self, params), fields(resource = %resource))]
    pub async fn get_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError> {
        let key = Fingerprint::list(resource, &params);
        let value = self
            .inner
            .cache
            .query(key, || self.list_loader(resource, params))
            .await?;
        into_list(value)
    }

    /// Load the page again even if the cached copy is fresh.
    pub async fn refetch_list(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> Result<GetListResult, DataError> {
        let key = Fingerprint::list(resource, &params);
        let value = self
            .inner
            .cache
            .refetch(key, || self.list_loader(resource, params))
            .await?;
        into_list(value)
    }

    /// Fetch one record. Lookups issued in the same scheduler pass are merged
    /// into one `getMany` call for the resource.
    #[instrument(skip(self, params), fields(resource = %resource, id = %params.id))]
    pub async fn get_one(
        &self,
        resource: &Resource,
        params: GetOneParams,
    ) -> Result<Record, DataError> {
        let key = Fingerprint::one(resource, &params.id);
        let value = self
            .inner
            .cache
            .query(key, || self.one_loader(resource, params.id))
            .await?;
        into_record(value)
    }

    pub async fn refetch_one(
        &self,
        resource: &Resource,
        params: GetOneParams,
    ) -> Result<Record, DataError> {
        let key = Fingerprint::one(resource, &params.id);
        let value = self
            .inner
            .cache
            .refetch(key, || self.one_loader(resource, params.id))
            .await?;
        into_record(value)
    }

    /// Fetch the records for `ids`, in the caller's order. Ids the backend
    /// cannot resolve are absent from the result.
    #[instrument(skip(self, params), fields(resource = %resource, ids = params.ids.len()))]
    pub async fn get_many(
        &self,
        resource: &Resource,
        params: GetManyParams,
    ) -> Result<Vec<Record>, DataError> {
        let GetManyParams { ids } = params;
        let key = Fingerprint::many(resource, &ids);
        let requested = key.ids().to_vec();
        let value = self
            .inner
            .cache
            .query(key, || {
                let ticket = self.inner.batcher.enqueue_many(resource, requested);
                self.guarded(async move { ticket.wait().await.map(CacheValue::Records) })
            })
            .await?;

        Ok(in_request_order(&ids, value.into_records()))
    }

    #[instrument(skip(self, params), fields(resource = %resource, target = %params.target))]
    pub async fn get_many_reference(
        &self,
        resource: &Resource,
        params: GetManyReferenceParams,
    ) -> Result<GetListResult, DataError> {
        let key = Fingerprint::many_reference(resource, &params);
        let adapter = self.inner.adapter.clone();
        let owner = resource.clone();
        let value = self
            .inner
            .cache
            .query(key, || {
                self.guarded(async move {
                    adapter
                        .get_many_reference(&owner, params)
                        .await
                        .map(|GetListResult { data, total }| CacheValue::List { data, total })
                })
            })
            .await?;
        into_list(value)
    }

    fn list_loader(
        &self,
        resource: &Resource,
        params: GetListParams,
    ) -> impl Future<Output = Result<CacheValue, DataError>> + Send + 'static {
        let adapter = self.inner.adapter.clone();
        let owner = resource.clone();
        self.guarded(async move {
            adapter
                .get_list(&owner, params)
                .await
                .map(|GetListResult { data, total }| CacheValue::List { data, total })
        })
    }

    fn one_loader(
        &self,
        resource: &Resource,
        id: Identifier,
    ) -> impl Future<Output = Result<CacheValue, DataError>> + Send + 'static {
        let ticket = self.inner.batcher.enqueue_one(resource, id);
        self.guarded(async move { ticket.wait().await.map(CacheValue::Record) })
    }

    /// Invalidate the session when a read is rejected for authentication.
    ///
    /// Runs inside the single-flight load, so joined callers do not repeat it.
    fn guarded<Fut>(
        &self,
        load: Fut,
    ) -> impl Future<Output = Result<CacheValue, DataError>> + Send + 'static
    where
        Fut: Future<Output = Result<CacheValue, DataError>> + Send + 'static,
    {
        let pipeline = self.inner.pipeline.clone();
        let generation = self.inner.cache.generation();
        async move {
            let result = load.await;
            if let Err(error) = &result
                && error.is_auth()
            {
                pipeline.invalidate_session(error, FailureNotification::Default, generation);
            }
            result
        }
    }

    // ----- writes -----

    pub async fn create(
        &self,
        resource: &Resource,
        params: CreateParams,
        options: MutationOptions,
    ) -> Result<Record, DataError> {
        let request = MutationRequest::Create {
            resource: resource.clone(),
            data: params.data,
        };
        self.mutate(request, options).await.and_then(outcome_record)
    }

    pub async fn update(
        &self,
        resource: &Resource,
        params: UpdateParams,
        options: MutationOptions,
    ) -> Result<Record, DataError> {
        let request = MutationRequest::Update {
            resource: resource.clone(),
            id: params.id,
            data: params.data,
            previous_data: params.previous_data,
        };
        self.mutate(request, options).await.and_then(outcome_record)
    }

    pub async fn update_many(
        &self,
        resource: &Resource,
        params: UpdateManyParams,
        options: MutationOptions,
    ) -> Result<Vec<Identifier>, DataError> {
        let request = MutationRequest::UpdateMany {
            resource: resource.clone(),
            ids: params.ids,
            data: params.data,
        };
        self.mutate(request, options)
            .await
            .map(MutationOutcome::into_ids)
    }

    pub async fn delete(
        &self,
        resource: &Resource,
        params: DeleteParams,
        options: MutationOptions,
    ) -> Result<Record, DataError> {
        let request = MutationRequest::Delete {
            resource: resource.clone(),
            id: params.id,
            previous_data: params.previous_data,
        };
        self.mutate(request, options).await.and_then(outcome_record)
    }

    pub async fn delete_many(
        &self,
        resource: &Resource,
        params: DeleteManyParams,
        options: MutationOptions,
    ) -> Result<Vec<Identifier>, DataError> {
        let request = MutationRequest::DeleteMany {
            resource: resource.clone(),
            ids: params.ids,
        };
        self.mutate(request, options)
            .await
            .map(MutationOutcome::into_ids)
    }

    /// Run a write to its terminal state in the requested mode.
    pub async fn mutate(
        &self,
        request: MutationRequest,
        options: MutationOptions,
    ) -> Result<MutationOutcome, DataError> {
        self.inner.pipeline.execute(request, options).await
    }

    /// Apply a write locally and return its undo handle without waiting.
    pub fn stage(&self, request: MutationRequest, effects: Option<EffectDescriptor>) -> UndoHandle {
        self.inner.pipeline.stage(request, effects)
    }

    // ----- observation -----

    pub fn subscribe(
        &self,
        fingerprint: &Fingerprint,
        callback: impl Fn(&EntryEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.inner.cache.subscribe(fingerprint, callback)
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        self.inner.cache.state(fingerprint)
    }

    pub fn invalidate(&self, matcher: &Invalidation) -> usize {
        self.inner.cache.invalidate(matcher)
    }

    /// Mark everything stale and ask views to re-run their queries.
    pub fn refresh(&self) {
        self.inner.effects.refresh();
    }

    /// Send every staged mutation now, wait for each to settle, and drain
    /// pending batch lookups.
    pub async fn shutdown(&self) {
        let (committed, ()) = tokio::join!(
            self.undo_queue().settle_all(),
            self.inner.batcher.flush_all(),
        );
        debug!(committed, "data provider shut down");
    }
}

fn into_list(value: CacheValue) -> Result<GetListResult, DataError> {
    match value {
        CacheValue::List { data, total } => Ok(GetListResult { data, total }),
        other => Err(DataError::unexpected(format!(
            "list entry holds {} records without a total",
            other.records().len()
        ))),
    }
}

fn into_record(value: CacheValue) -> Result<Record, DataError> {
    value
        .into_record()
        .ok_or_else(|| DataError::unexpected("single-record entry holds a collection"))
}

fn outcome_record(outcome: MutationOutcome) -> Result<Record, DataError> {
    outcome
        .into_record()
        .ok_or_else(|| DataError::unexpected("mutation returned ids instead of a record"))
}

/// Reorder `records` to follow `ids`, dropping ids with no record.
fn in_request_order(ids: &[Identifier], records: Vec<Record>) -> Vec<Record> {
    let by_id: HashMap<Identifier, Record> = records
        .into_iter()
        .filter_map(|record| record.id().map(|id| (id, record)))
        .collect();
    ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
}
