//! Ordered record of optimistic mutations still able to roll back.
//!
//! Each entry owns the snapshot taken right before its own changes were
//! written. Rolling back entry `k` restores snapshots from the newest entry
//! down to `k`, drops `k`, then replays every later entry on top, so
//! overlapping mutations compose in request order and unwind in reverse.
//!
//! Unsettled entries hold their cache keys (see [`CacheStore::hold`]) so a
//! load finishing meanwhile cannot overwrite the optimistic value.
//!
//! Lock order is ledger, then cache. Nothing awaits while the ledger is held.

use std::sync::Mutex;

use metrics::counter;
use tracing::{debug, info};

use crate::cache::{CacheStore, Fingerprint, Snapshot, mutex_lock};

use super::change::CacheChange;
use super::types::MutationId;

const SOURCE: &str = "mutation::ledger";

pub(crate) const METRIC_MUTATION_ROLLBACK: &str = "folio_mutation_rollback_total";

#[derive(Debug)]
struct LedgerEntry {
    id: MutationId,
    changes: Vec<CacheChange>,
    snapshot: Snapshot,
    held: Vec<Fingerprint>,
    settled: bool,
}

impl LedgerEntry {
    fn hold(&mut self, cache: &CacheStore) {
        self.held = self.snapshot.keys().cloned().collect();
        cache.hold(&self.held);
    }

    fn release(&mut self, cache: &CacheStore) {
        cache.release(&self.held);
        self.held.clear();
    }
}

pub struct OptimisticLedger {
    cache: CacheStore,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl OptimisticLedger {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot the affected entries, then write the changes.
    pub fn apply(&self, id: MutationId, changes: Vec<CacheChange>) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "apply");
        let snapshot = write_changes(&self.cache, &changes);
        debug!(mutation_id = id, entries = snapshot.len(), "optimistic changes applied");
        let mut entry = LedgerEntry {
            id,
            changes,
            snapshot,
            held: Vec::new(),
            settled: false,
        };
        entry.hold(&self.cache);
        entries.push(entry);
    }

    /// Reconcile with the backend's answer and mark the mutation settled.
    ///
    /// A mutation the ledger has never seen (pessimistic) is recorded as
    /// settled so that rolling back an older entry replays it.
    pub fn settle(&self, id: MutationId, server: Vec<CacheChange>) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "settle");
        let server_snapshot = write_changes(&self.cache, &server);

        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.snapshot.extend_missing(server_snapshot);
                entry.changes.extend(server);
                entry.settled = true;
                entry.release(&self.cache);
            }
            None => entries.push(LedgerEntry {
                id,
                changes: server,
                snapshot: server_snapshot,
                held: Vec::new(),
                settled: true,
            }),
        }

        compact(&mut entries);
    }

    /// Undo mutation `id`, leaving every other mutation's effect in place.
    ///
    /// Returns `false` when the ledger does not hold `id`.
    pub fn rollback(&self, id: MutationId) -> bool {
        let mut entries = mutex_lock(&self.entries, SOURCE, "rollback");
        let Some(position) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };

        for entry in entries[position..].iter().rev() {
            self.cache.restore(&entry.snapshot);
        }
        entries.remove(position).release(&self.cache);

        for entry in entries[position..].iter_mut() {
            entry.release(&self.cache);
            entry.snapshot = write_changes(&self.cache, &entry.changes);
            if !entry.settled {
                entry.hold(&self.cache);
            }
        }

        counter!(METRIC_MUTATION_ROLLBACK).increment(1);
        info!(
            mutation_id = id,
            replayed = entries.len() - position,
            "optimistic mutation rolled back"
        );
        compact(&mut entries);
        true
    }

    /// Forget every entry without touching cached values.
    pub fn clear(&self) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "clear");
        for entry in entries.iter_mut() {
            entry.release(&self.cache);
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_changes(cache: &CacheStore, changes: &[CacheChange]) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for change in changes {
        let writes = change.plan(cache);
        snapshot.extend_missing(cache.snapshot(writes.iter().map(|(key, _)| key)));
        for (key, value) in writes {
            match value {
                Some(value) => cache.write(&key, value),
                None => cache.remove(&key),
            }
        }
    }
    snapshot
}

/// Settled entries at the front can never be rolled back again.
fn compact(entries: &mut Vec<LedgerEntry>) {
    let settled = entries.iter().take_while(|entry| entry.settled).count();
    entries.drain(..settled);
}
