use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::application::adapter::{
    Adapter, CreateParams, DeleteManyParams, DeleteParams, UpdateManyParams, UpdateParams,
};
use crate::application::effects::{EffectDescriptor, EffectDispatcher, FailureNotification};
use crate::application::error::DataError;
use crate::cache::{CacheStore, Invalidation};
use crate::domain::types::Identifier;

use super::change::{optimistic_changes, server_changes, temporary_id};
use super::ledger::OptimisticLedger;
use super::types::{MutationId, MutationMode, MutationOptions, MutationOutcome, MutationRequest};
use super::undo::{StagedMutation, UndoHandle, UndoQueue};

/// A request plus the identity its optimistic record was given, if any.
#[derive(Debug, Clone)]
struct Prepared {
    id: MutationId,
    request: MutationRequest,
    temp_id: Option<Identifier>,
    optimistic: bool,
    generation: u64,
}

struct PipelineInner {
    adapter: Arc<dyn Adapter>,
    cache: CacheStore,
    ledger: OptimisticLedger,
    effects: EffectDispatcher,
    undo: UndoQueue,
    next_id: AtomicU64,
}

/// Runs writes against the adapter and keeps the cache consistent with them.
#[derive(Clone)]
pub struct MutationPipeline {
    inner: Arc<PipelineInner>,
}

impl MutationPipeline {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        cache: CacheStore,
        effects: EffectDispatcher,
        undo: UndoQueue,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                ledger: OptimisticLedger::new(cache.clone()),
                adapter,
                cache,
                effects,
                undo,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn undo_queue(&self) -> &UndoQueue {
        &self.inner.undo
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.inner.ledger
    }

    /// Run `request` to its terminal state.
    ///
    /// In undoable mode this waits out the undo delay; a cancelled mutation
    /// returns [`DataError::Cancelled`] and never reaches the adapter.
    #[instrument(
        skip(self, request, options),
        fields(resource = %request.resource(), verb = %request.verb(), mode = ?options.mode)
    )]
    pub async fn execute(
        &self,
        request: MutationRequest,
        options: MutationOptions,
    ) -> Result<MutationOutcome, DataError> {
        match options.mode {
            MutationMode::Undoable => self.stage(request, options.effects).settled().await,
            MutationMode::Optimistic => {
                let prepared = self.prepare(request, true);
                self.send(prepared, options.effects, false).await
            }
            MutationMode::Pessimistic => {
                let prepared = self.prepare(request, false);
                self.send(prepared, options.effects, false).await
            }
        }
    }

    /// Apply `request` optimistically and stage its adapter call behind the
    /// undo delay.
    pub fn stage(
        &self,
        request: MutationRequest,
        effects: Option<EffectDescriptor>,
    ) -> UndoHandle {
        let prepared = self.prepare(request, true);
        let id = prepared.id;
        let resource = prepared.request.resource().clone();
        let verb = prepared.request.verb();

        let pipeline = self.clone();
        let commit = async move { pipeline.send(prepared, effects, true).await }.boxed();
        let pipeline = self.clone();
        let rollback = Box::new(move || {
            pipeline.inner.ledger.rollback(id);
        });

        self.inner.undo.stage(StagedMutation {
            id,
            resource,
            verb,
            commit,
            rollback,
        })
    }

    /// Drop every cache entry and pending optimistic state after the backend
    /// rejected the session.
    ///
    /// `generation` is the cache generation read before the rejected request
    /// was issued; see [`EffectDispatcher::on_auth_failure`].
    pub fn invalidate_session(
        &self,
        error: &DataError,
        notification: FailureNotification,
        generation: u64,
    ) {
        if self
            .inner
            .effects
            .on_auth_failure(error, notification, generation)
        {
            self.inner.ledger.clear();
        }
    }

    /// Assign an id and, for optimistic modes, write the local changes before
    /// anything can suspend.
    fn prepare(&self, request: MutationRequest, optimistic: bool) -> Prepared {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.inner.cache.generation();
        let temp_id = match &request {
            MutationRequest::Create { data, .. } if optimistic && data.id().is_none() => {
                Some(temporary_id())
            }
            _ => None,
        };

        if optimistic {
            let changes = optimistic_changes(&request, temp_id.as_ref());
            self.inner.ledger.apply(id, changes);
        }
        debug!(mutation_id = id, optimistic, "mutation requested");

        Prepared {
            id,
            request,
            temp_id,
            optimistic,
            generation,
        }
    }

    async fn send(
        &self,
        prepared: Prepared,
        effects: Option<EffectDescriptor>,
        undoable: bool,
    ) -> Result<MutationOutcome, DataError> {
        let Prepared {
            id,
            request,
            temp_id,
            optimistic,
            generation,
        } = prepared;
        let resource = request.resource().clone();
        let verb = request.verb();
        let effects = effects
            .unwrap_or_else(|| EffectDescriptor::for_verb(verb))
            .mark_undoable(undoable);

        debug!(mutation_id = id, resource = %resource, verb = %verb, "mutation in flight");
        match self.call_adapter(&request).await {
            Ok(outcome) => {
                let server = server_changes(&request, &outcome, temp_id.as_ref());
                self.inner.ledger.settle(id, server);
                if request.reshapes_collections() {
                    self.inner
                        .cache
                        .invalidate(&Invalidation::Collections(resource.clone()));
                }
                info!(mutation_id = id, resource = %resource, verb = %verb, "mutation settled");

                let record_id = outcome.record().and_then(|record| record.id());
                self.inner
                    .effects
                    .on_success(&resource, verb, record_id.as_ref(), effects);
                Ok(outcome)
            }
            Err(error) if error.is_auth() => {
                warn!(mutation_id = id, error = %error, "mutation rejected: session invalid");
                self.invalidate_session(&error, effects.on_failure.notification, generation);
                Err(error)
            }
            Err(error) => {
                warn!(mutation_id = id, resource = %resource, verb = %verb, error = %error, "mutation failed");
                if optimistic {
                    self.inner.ledger.rollback(id);
                }
                self.inner.effects.on_failure(&resource, verb, &error, effects);
                Err(error)
            }
        }
    }

    async fn call_adapter(&self, request: &MutationRequest) -> Result<MutationOutcome, DataError> {
        let adapter = &self.inner.adapter;
        match request.clone() {
            MutationRequest::Create { resource, data } => adapter
                .create(&resource, CreateParams { data })
                .await
                .map(MutationOutcome::Record),
            MutationRequest::Update {
                resource,
                id,
                data,
                previous_data,
            } => adapter
                .update(
                    &resource,
                    UpdateParams {
                        id,
                        data,
                        previous_data,
                    },
                )
                .await
                .map(MutationOutcome::Record),
            MutationRequest::UpdateMany {
                resource,
                ids,
                data,
            } => adapter
                .update_many(&resource, UpdateManyParams { ids, data })
                .await
                .map(MutationOutcome::Ids),
            MutationRequest::Delete {
                resource,
                id,
                previous_data,
            } => adapter
                .delete(&resource, DeleteParams { id, previous_data })
                .await
                .map(MutationOutcome::Record),
            MutationRequest::DeleteMany { resource, ids } => adapter
                .delete_many(&resource, DeleteManyParams { ids })
                .await
                .map(MutationOutcome::Ids),
        }
    }
}
