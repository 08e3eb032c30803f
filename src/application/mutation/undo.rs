//! Delayed-commit slots for undoable mutations.
//!
//! A staged mutation waits in its slot until the delay elapses, the caller
//! cancels it, or another mutation is staged into the same slot (which
//! commits it immediately). Whichever happens first removes it from the slot
//! under the slot lock, so each staged mutation is decided exactly once.
//! The countdown tasks live in a [`JoinSet`] so shutdown can wait for every
//! commit to reach the backend.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::adapter::Verb;
use crate::application::error::DataError;
use crate::cache::mutex_lock;
use crate::domain::types::Resource;

use super::types::{MutationId, MutationOutcome};

const SOURCE: &str = "mutation::undo";

pub(crate) const METRIC_UNDO_CANCELLED: &str = "folio_undo_cancelled_total";

/// Whether undo slots are shared by every resource or kept per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndoScope {
    #[default]
    Global,
    PerResource,
}

#[derive(Debug, Error)]
#[error("unknown undo scope `{0}` (expected global|per_resource)")]
pub struct UnknownUndoScope(String);

impl FromStr for UndoScope {
    type Err = UnknownUndoScope;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "global" => Ok(UndoScope::Global),
            "per_resource" | "per-resource" | "resource" => Ok(UndoScope::PerResource),
            _ => Err(UnknownUndoScope(value.to_string())),
        }
    }
}

impl fmt::Display for UndoScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoScope::Global => f.write_str("global"),
            UndoScope::PerResource => f.write_str("per_resource"),
        }
    }
}

impl UndoScope {
    pub fn slot_for(self, resource: &Resource) -> UndoSlot {
        match self {
            UndoScope::Global => UndoSlot::Global,
            UndoScope::PerResource => UndoSlot::Resource(resource.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UndoSlot {
    Global,
    Resource(Resource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndoSignal {
    Commit,
    Cancel,
}

/// Work handed to the queue: what to run on commit and on cancel.
pub struct StagedMutation {
    pub id: MutationId,
    pub resource: Resource,
    pub verb: Verb,
    pub commit: BoxFuture<'static, Result<MutationOutcome, DataError>>,
    pub rollback: Box<dyn FnOnce() + Send>,
}

struct Slotted {
    id: MutationId,
    resource: Resource,
    verb: Verb,
    deadline: Instant,
    signal: oneshot::Sender<UndoSignal>,
}

/// Read-only view of a staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUndo {
    pub id: MutationId,
    pub slot: UndoSlot,
    pub resource: Resource,
    pub verb: Verb,
    pub deadline: Instant,
}

struct UndoInner {
    scope: UndoScope,
    delay: Duration,
    slots: Mutex<HashMap<UndoSlot, Slotted>>,
    tasks: Mutex<JoinSet<()>>,
}

#[derive(Clone)]
pub struct UndoQueue {
    inner: Arc<UndoInner>,
}

impl UndoQueue {
    pub fn new(scope: UndoScope, delay: Duration) -> Self {
        Self {
            inner: Arc::new(UndoInner {
                scope,
                delay,
                slots: Mutex::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn scope(&self) -> UndoScope {
        self.inner.scope
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Start the countdown for `staged`. A mutation already waiting in the
    /// same slot is committed right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stage(&self, staged: StagedMutation) -> UndoHandle {
        let StagedMutation {
            id,
            resource,
            verb,
            commit,
            rollback,
        } = staged;
        let slot = self.inner.scope.slot_for(&resource);
        let (signal, mut signals) = oneshot::channel();
        let (settle, settled) = oneshot::channel();

        let displaced = {
            let mut slots = mutex_lock(&self.inner.slots, SOURCE, "stage");
            slots.insert(
                slot.clone(),
                Slotted {
                    id,
                    resource: resource.clone(),
                    verb,
                    deadline: Instant::now() + self.inner.delay,
                    signal,
                },
            )
        };
        if let Some(previous) = displaced {
            info!(
                mutation_id = previous.id,
                resource = %previous.resource,
                verb = %previous.verb,
                "undo slot reused; committing earlier mutation"
            );
            let _ = previous.signal.send(UndoSignal::Commit);
        }
        debug!(mutation_id = id, resource = %resource, verb = %verb, "mutation staged");

        let queue = self.clone();
        let task_slot = slot.clone();
        let delay = self.inner.delay;
        let mut tasks = mutex_lock(&self.inner.tasks, SOURCE, "stage");
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);

            let early = tokio::select! {
                signal = &mut signals => Some(signal.unwrap_or(UndoSignal::Commit)),
                () = &mut timer => None,
            };
            let decision = match early {
                Some(signal) => signal,
                None if queue.release(&task_slot, id).is_some() => UndoSignal::Commit,
                // Someone else took the slot between the timer and the lock.
                None => signals.await.unwrap_or(UndoSignal::Commit),
            };

            let outcome = match decision {
                UndoSignal::Commit => {
                    debug!(mutation_id = id, "undo window closed; committing");
                    commit.await
                }
                UndoSignal::Cancel => {
                    rollback();
                    counter!(METRIC_UNDO_CANCELLED).increment(1);
                    info!(mutation_id = id, "undoable mutation cancelled");
                    Err(DataError::Cancelled)
                }
            };
            let _ = settle.send(outcome);
        });
        drop(tasks);

        UndoHandle {
            id,
            slot,
            queue: self.clone(),
            settled,
        }
    }

    fn release(&self, slot: &UndoSlot, id: MutationId) -> Option<Slotted> {
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "release");
        let owned = slots.get(slot).is_some_and(|staged| staged.id == id);
        if owned { slots.remove(slot) } else { None }
    }

    fn signal(&self, slot: &UndoSlot, id: Option<MutationId>, signal: UndoSignal) -> bool {
        let taken = {
            let mut slots = mutex_lock(&self.inner.slots, SOURCE, "signal");
            let matches = slots
                .get(slot)
                .is_some_and(|staged| id.is_none_or(|id| staged.id == id));
            if matches { slots.remove(slot) } else { None }
        };
        match taken {
            Some(staged) => staged.signal.send(signal).is_ok(),
            None => false,
        }
    }

    /// Cancel whatever is staged in `slot`. No-op when the slot is empty.
    pub fn cancel(&self, slot: &UndoSlot) -> bool {
        self.signal(slot, None, UndoSignal::Cancel)
    }

    /// Send whatever is staged in `slot` now instead of waiting.
    pub fn commit(&self, slot: &UndoSlot) -> bool {
        self.signal(slot, None, UndoSignal::Commit)
    }

    /// Commit every staged mutation. Returns how many were released.
    pub fn commit_all(&self) -> usize {
        let drained: Vec<Slotted> = mutex_lock(&self.inner.slots, SOURCE, "commit_all")
            .drain()
            .map(|(_, staged)| staged)
            .collect();
        let count = drained.len();
        for staged in drained {
            let _ = staged.signal.send(UndoSignal::Commit);
        }
        if count > 0 {
            info!(count, "committed all staged mutations");
        }
        count
    }

    /// Commit every staged mutation and wait until each one has settled.
    /// Returns how many were still waiting for their delay.
    pub async fn settle_all(&self) -> usize {
        let committed = self.commit_all();
        let mut tasks = std::mem::take(&mut *mutex_lock(&self.inner.tasks, SOURCE, "settle_all"));
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(error = %error, "undo task ended abnormally");
            }
        }
        committed
    }

    pub fn pending(&self) -> Vec<PendingUndo> {
        mutex_lock(&self.inner.slots, SOURCE, "pending")
            .iter()
            .map(|(slot, staged)| PendingUndo {
                id: staged.id,
                slot: slot.clone(),
                resource: staged.resource.clone(),
                verb: staged.verb,
                deadline: staged.deadline,
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        mutex_lock(&self.inner.slots, SOURCE, "pending_count").len()
    }
}

/// Caller's grip on one staged mutation.
pub struct UndoHandle {
    id: MutationId,
    slot: UndoSlot,
    queue: UndoQueue,
    settled: oneshot::Receiver<Result<MutationOutcome, DataError>>,
}

impl UndoHandle {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn slot(&self) -> &UndoSlot {
        &self.slot
    }

    /// Undo the mutation if it has not been sent yet.
    ///
    /// Idempotent; returns `false` once the mutation was committed, cancelled
    /// or displaced by a newer one.
    pub fn cancel(&self) -> bool {
        self.queue.signal(&self.slot, Some(self.id), UndoSignal::Cancel)
    }

    /// Commit now instead of waiting for the delay.
    pub fn commit(&self) -> bool {
        self.queue.signal(&self.slot, Some(self.id), UndoSignal::Commit)
    }

    /// Wait for the terminal state. A cancelled mutation yields
    /// [`DataError::Cancelled`].
    pub async fn settled(self) -> Result<MutationOutcome, DataError> {
        self.settled
            .await
            .unwrap_or_else(|_| Err(DataError::unexpected("undo task ended without settling")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::domain::entities::Record;

    struct Counters {
        commits: Arc<AtomicUsize>,
        rollbacks: Arc<AtomicUsize>,
    }

    impl Counters {
        fn new() -> Self {
            Self {
                commits: Arc::new(AtomicUsize::new(0)),
                rollbacks: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn staged(&self, id: MutationId, resource: &str) -> StagedMutation {
            let commits = Arc::clone(&self.commits);
            let rollbacks = Arc::clone(&self.rollbacks);
            StagedMutation {
                id,
                resource: Resource::new(resource),
                verb: Verb::Delete,
                commit: async move {
                    commits.fetch_add(1, Ordering::SeqCst);
                    Ok(MutationOutcome::Record(Record::new()))
                }
                .boxed(),
                rollback: Box::new(move || {
                    rollbacks.fetch_add(1, Ordering::SeqCst);
                }),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_delay_commits() {
        let queue = UndoQueue::new(UndoScope::Global, Duration::from_millis(1_000));
        let counters = Counters::new();

        let handle = queue.stage(counters.staged(1, "posts"));
        assert_eq!(queue.pending_count(), 1);

        assert!(handle.settled().await.is_ok());
        assert_eq!(counters.commits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_commit_is_a_no_op() {
        let queue = UndoQueue::new(UndoScope::Global, Duration::from_millis(1_000));
        let counters = Counters::new();

        let handle = queue.stage(counters.staged(1, "posts"));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(!handle.cancel());
        assert!(handle.settled().await.is_ok());
        assert_eq!(counters.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_resource_slots_are_independent() {
        let queue = UndoQueue::new(UndoScope::PerResource, Duration::from_millis(1_000));
        let counters = Counters::new();

        let posts = queue.stage(counters.staged(1, "posts"));
        let _comments = queue.stage(counters.staged(2, "comments"));
        assert_eq!(queue.pending_count(), 2);

        assert!(posts.cancel());
        assert_eq!(posts.settled().await, Err(DataError::Cancelled));
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(counters.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_all_flushes_every_slot() {
        let queue = UndoQueue::new(UndoScope::PerResource, Duration::from_secs(60));
        let counters = Counters::new();

        let a = queue.stage(counters.staged(1, "posts"));
        let b = queue.stage(counters.staged(2, "comments"));
        assert_eq!(queue.commit_all(), 2);

        assert!(a.settled().await.is_ok());
        assert!(b.settled().await.is_ok());
        assert_eq!(counters.commits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_all_waits_for_commits_to_finish() {
        let queue = UndoQueue::new(UndoScope::PerResource, Duration::from_secs(60));
        let commits = Arc::new(AtomicUsize::new(0));

        for (id, resource) in [(1, "posts"), (2, "comments")] {
            let commits = Arc::clone(&commits);
            let _handle = queue.stage(StagedMutation {
                id,
                resource: Resource::new(resource),
                verb: Verb::Update,
                commit: async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    commits.fetch_add(1, Ordering::SeqCst);
                    Ok(MutationOutcome::Record(Record::new()))
                }
                .boxed(),
                rollback: Box::new(|| {}),
            });
        }

        assert_eq!(queue.settle_all().await, 2);
        assert_eq!(commits.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn scope_parses_from_settings() {
        assert_eq!("global".parse::<UndoScope>().ok(), Some(UndoScope::Global));
        assert_eq!(
            "per_resource".parse::<UndoScope>().ok(),
            Some(UndoScope::PerResource)
        );
        assert!("per_user".parse::<UndoScope>().is_err());
    }
}
