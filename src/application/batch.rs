//! Request batching: many `getOne`/`getMany` lookups, one `getMany` call.
//!
//! Lookups register their ids into the resource's open [`BatchWindow`] and
//! receive a [`BatchTicket`]. Awaiting a ticket yields once and then drains
//! the resource's windows from the awaiting task itself, so every lookup
//! registered before the first waiter resumes lands in one window. Later
//! waiters find their window already draining and wait for its reply.
//! A window that reaches `max_ids` distinct ids is sealed and a fresh one
//! opens behind it.
//!
//! Records a drain returns also seed the matching `getOne` entries, unless
//! that entry was written locally after the window opened or belongs to an
//! unresolved optimistic mutation.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use metrics::histogram;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::application::adapter::{Adapter, GetManyParams};
use crate::application::error::DataError;
use crate::cache::{CacheStore, CacheValue, Epoch, Fingerprint, mutex_lock};
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

const SOURCE: &str = "application::batch";

pub(crate) const METRIC_BATCH_IDS: &str = "folio_batch_ids";

type Reply<T> = oneshot::Sender<Result<T, DataError>>;

enum Waiter {
    One { id: Identifier, reply: Reply<Record> },
    Many { ids: Vec<Identifier>, reply: Reply<Vec<Record>> },
}

/// Ids registered for one resource since the last drain, with their requesters.
#[derive(Default)]
struct BatchWindow {
    ids: Vec<Identifier>,
    seen: HashSet<Identifier>,
    waiters: Vec<Waiter>,
    opened_at: Epoch,
}

impl BatchWindow {
    fn register(&mut self, ids: &[Identifier]) {
        for id in ids {
            if self.seen.insert(id.clone()) {
                self.ids.push(id.clone());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[derive(Default)]
struct ResourceQueue {
    open: BatchWindow,
    sealed: Vec<BatchWindow>,
}

impl ResourceQueue {
    fn drain(&mut self) -> Vec<BatchWindow> {
        let mut windows = std::mem::take(&mut self.sealed);
        if !self.open.is_empty() {
            windows.push(std::mem::take(&mut self.open));
        }
        windows
    }
}

/// Deferred result of a batched lookup.
#[must_use = "a batched lookup is only sent once a ticket is awaited or the batcher flushed"]
pub struct BatchTicket<T> {
    receiver: oneshot::Receiver<Result<T, DataError>>,
    flush: Option<(RequestBatcher, Resource)>,
}

impl<T> BatchTicket<T> {
    /// Let the current task finish registering lookups, drain whatever is
    /// queued for the resource, then wait for this ticket's reply.
    pub async fn wait(self) -> Result<T, DataError> {
        if let Some((batcher, resource)) = self.flush {
            tokio::task::yield_now().await;
            batcher.flush(&resource).await;
        }
        self.receiver
            .await
            .unwrap_or_else(|_| Err(DataError::unexpected("batch window dropped before draining")))
    }
}

struct BatcherInner {
    adapter: Arc<dyn Adapter>,
    cache: CacheStore,
    max_ids: NonZeroUsize,
    queues: Mutex<HashMap<Resource, ResourceQueue>>,
}

#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    pub fn new(adapter: Arc<dyn Adapter>, cache: CacheStore, max_ids: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                adapter,
                cache,
                max_ids,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn enqueue_one(&self, resource: &Resource, id: Identifier) -> BatchTicket<Record> {
        let (reply, receiver) = oneshot::channel();
        self.register(resource, std::slice::from_ref(&id), Waiter::One { id: id.clone(), reply });
        self.ticket(resource, receiver)
    }

    pub fn enqueue_many(&self, resource: &Resource, ids: Vec<Identifier>) -> BatchTicket<Vec<Record>> {
        let (reply, receiver) = oneshot::channel();
        if ids.is_empty() {
            let _ = reply.send(Ok(Vec::new()));
            return BatchTicket {
                receiver,
                flush: None,
            };
        }
        let registered = ids.clone();
        self.register(resource, &registered, Waiter::Many { ids, reply });
        self.ticket(resource, receiver)
    }

    fn ticket<T>(
        &self,
        resource: &Resource,
        receiver: oneshot::Receiver<Result<T, DataError>>,
    ) -> BatchTicket<T> {
        BatchTicket {
            receiver,
            flush: Some((self.clone(), resource.clone())),
        }
    }

    fn register(&self, resource: &Resource, ids: &[Identifier], waiter: Waiter) {
        let mut queues = mutex_lock(&self.inner.queues, SOURCE, "register");
        let queue = queues.entry(resource.clone()).or_default();
        if queue.open.is_empty() {
            queue.open.opened_at = self.inner.cache.epoch();
        }
        queue.open.register(ids);
        queue.open.waiters.push(waiter);

        if queue.open.ids.len() >= self.inner.max_ids.get() {
            debug!(resource = %resource, ids = queue.open.ids.len(), "batch window sealed");
            let full = std::mem::take(&mut queue.open);
            queue.sealed.push(full);
        }
    }

    /// Distinct ids waiting in the resource's open window.
    pub fn pending_ids(&self, resource: &Resource) -> Vec<Identifier> {
        mutex_lock(&self.inner.queues, SOURCE, "pending_ids")
            .get(resource)
            .map(|queue| queue.open.ids.clone())
            .unwrap_or_default()
    }

    /// Number of windows (open or sealed) waiting for a flush.
    pub fn pending_windows(&self, resource: &Resource) -> usize {
        mutex_lock(&self.inner.queues, SOURCE, "pending_windows")
            .get(resource)
            .map(|queue| queue.sealed.len() + usize::from(!queue.open.is_empty()))
            .unwrap_or(0)
    }

    /// Drain every window of `resource`, one `getMany` per window.
    pub async fn flush(&self, resource: &Resource) {
        let windows = mutex_lock(&self.inner.queues, SOURCE, "flush")
            .get_mut(resource)
            .map(ResourceQueue::drain)
            .unwrap_or_default();
        if windows.is_empty() {
            return;
        }
        join_all(windows.into_iter().map(|window| self.drain(resource, window))).await;
    }

    pub async fn flush_all(&self) {
        let drained: Vec<(Resource, Vec<BatchWindow>)> = {
            let mut queues = mutex_lock(&self.inner.queues, SOURCE, "flush_all");
            queues
                .iter_mut()
                .map(|(resource, queue)| (resource.clone(), queue.drain()))
                .filter(|(_, windows)| !windows.is_empty())
                .collect()
        };

        let drains = drained.into_iter().flat_map(|(resource, windows)| {
            windows
                .into_iter()
                .map(move |window| (resource.clone(), window))
        });
        join_all(drains.map(|(resource, window)| async move {
            self.drain(&resource, window).await;
        }))
        .await;
    }

    async fn drain(&self, resource: &Resource, window: BatchWindow) {
        let BatchWindow {
            ids,
            waiters,
            opened_at,
            ..
        } = window;
        histogram!(METRIC_BATCH_IDS).record(ids.len() as f64);
        debug!(
            resource = %resource,
            ids = ids.len(),
            requesters = waiters.len(),
            "draining batch window"
        );

        let result = self
            .inner
            .adapter
            .get_many(resource, GetManyParams { ids })
            .await;

        let records = match result {
            Ok(records) => records,
            Err(error) => {
                warn!(resource = %resource, error = %error, "batched getMany failed");
                for waiter in waiters {
                    match waiter {
                        Waiter::One { reply, .. } => {
                            let _ = reply.send(Err(error.clone()));
                        }
                        Waiter::Many { reply, .. } => {
                            let _ = reply.send(Err(error.clone()));
                        }
                    }
                }
                return;
            }
        };

        let by_id: HashMap<Identifier, Record> = records
            .into_iter()
            .filter_map(|record| record.id().map(|id| (id, record)))
            .collect();

        for (id, record) in &by_id {
            let key = Fingerprint::one(resource, id);
            self.inner
                .cache
                .seed(&key, CacheValue::Record(record.clone()), opened_at);
        }

        for waiter in waiters {
            match waiter {
                Waiter::One { id, reply } => {
                    let outcome = by_id
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| DataError::not_found(resource, &id));
                    let _ = reply.send(outcome);
                }
                Waiter::Many { ids, reply } => {
                    let found = ids.iter().filter_map(|id| by_id.get(id).cloned()).collect();
                    let _ = reply.send(Ok(found));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::infra::memory::InMemoryAdapter;

    fn authors() -> Resource {
        Resource::new("authors")
    }

    fn batcher(max_ids: usize) -> RequestBatcher {
        let adapter = InMemoryAdapter::with_records([(
            authors(),
            vec![
                Record::from_value(json!({"id": 1, "name": "Ada"})).expect("record"),
                Record::from_value(json!({"id": 2, "name": "Brian"})).expect("record"),
                Record::from_value(json!({"id": 3, "name": "Cleo"})).expect("record"),
            ],
        )]);
        RequestBatcher::new(
            Arc::new(adapter),
            CacheStore::new(&CacheConfig::default()),
            NonZeroUsize::new(max_ids).expect("non-zero"),
        )
    }

    #[test]
    fn duplicate_ids_share_one_slot() {
        let batcher = batcher(100);
        let _a = batcher.enqueue_one(&authors(), Identifier::Int(1));
        let _b = batcher.enqueue_one(&authors(), Identifier::Int(2));
        let _c = batcher.enqueue_one(&authors(), Identifier::Int(2));
        let _d = batcher.enqueue_many(&authors(), vec![Identifier::Int(3), Identifier::Int(1)]);

        assert_eq!(
            batcher.pending_ids(&authors()),
            vec![Identifier::Int(1), Identifier::Int(2), Identifier::Int(3)]
        );
        assert_eq!(batcher.pending_windows(&authors()), 1);
    }

    #[test]
    fn full_window_is_sealed_and_a_new_one_opens() {
        let batcher = batcher(2);
        let _a = batcher.enqueue_one(&authors(), Identifier::Int(1));
        let _b = batcher.enqueue_one(&authors(), Identifier::Int(2));
        let _c = batcher.enqueue_one(&authors(), Identifier::Int(3));

        assert_eq!(batcher.pending_ids(&authors()), vec![Identifier::Int(3)]);
        assert_eq!(batcher.pending_windows(&authors()), 2);
    }

    #[tokio::test]
    async fn flush_resolves_each_requester_and_reports_missing_ids() {
        let batcher = batcher(100);
        let two = batcher.enqueue_one(&authors(), Identifier::Int(2));
        let missing = batcher.enqueue_one(&authors(), Identifier::Int(9));
        let many = batcher.enqueue_many(&authors(), vec![Identifier::Int(3), Identifier::Int(9)]);

        batcher.flush(&authors()).await;

        let two = two.wait().await.expect("found");
        assert_eq!(two.get("name"), Some(&json!("Brian")));
        assert!(matches!(missing.wait().await, Err(DataError::NotFound { .. })));
        let many = many.wait().await.expect("subset");
        assert_eq!(many.len(), 1);
        assert_eq!(many[0].id(), Some(Identifier::Int(3)));
        assert_eq!(batcher.pending_windows(&authors()), 0);
    }

    #[tokio::test]
    async fn lookups_from_one_pass_drain_without_an_explicit_flush() {
        let batcher = batcher(100);
        let (one, three) = tokio::join!(
            batcher.enqueue_one(&authors(), Identifier::Int(1)).wait(),
            batcher.enqueue_one(&authors(), Identifier::Int(3)).wait(),
        );

        assert_eq!(one.expect("found").get("name"), Some(&json!("Ada")));
        assert_eq!(three.expect("found").get("name"), Some(&json!("Cleo")));
        assert_eq!(batcher.pending_windows(&authors()), 0);
    }

    #[tokio::test]
    async fn flushed_records_populate_get_one_entries() {
        let batcher = batcher(100);
        let ticket = batcher.enqueue_many(&authors(), vec![Identifier::Int(1)]);
        batcher.flush_all().await;
        ticket.wait().await.expect("records");

        let cached = batcher
            .inner
            .cache
            .peek(&Fingerprint::one(&authors(), &Identifier::Int(1)));
        assert!(matches!(cached, Some(CacheValue::Record(_))));
    }

    #[tokio::test]
    async fn empty_many_request_resolves_immediately() {
        let batcher = batcher(100);
        let ticket = batcher.enqueue_many(&authors(), Vec::new());
        assert_eq!(ticket.wait().await, Ok(Vec::new()));
        assert_eq!(batcher.pending_windows(&authors()), 0);
    }

    #[tokio::test]
    async fn records_do_not_replace_entries_written_while_the_window_was_open() {
        let batcher = batcher(100);
        let key = Fingerprint::one(&authors(), &Identifier::Int(1));
        let local = Record::from_value(json!({"id": 1, "name": "Ada (edited)"})).expect("record");

        let ticket = batcher.enqueue_many(&authors(), vec![Identifier::Int(1), Identifier::Int(2)]);
        batcher.inner.cache.write(&key, CacheValue::Record(local.clone()));
        let records = ticket.wait().await.expect("records");

        assert_eq!(records.len(), 2);
        assert_eq!(batcher.inner.cache.peek(&key), Some(CacheValue::Record(local)));
        assert!(
            batcher
                .inner
                .cache
                .peek(&Fingerprint::one(&authors(), &Identifier::Int(2)))
                .is_some()
        );
    }
}
