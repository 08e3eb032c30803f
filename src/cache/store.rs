//! Cache Store: fingerprint-keyed query results with single-flight loading.
//!
//! Every mutation of cached state goes through this type (`write`, `remove`,
//! `restore`, `invalidate`, `clear`). No lock is ever held across an await or
//! while subscriber callbacks run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::application::error::DataError;
use crate::domain::entities::Record;
use crate::domain::types::{Identifier, Resource};

use super::config::CacheConfig;
use super::keys::{Fingerprint, Invalidation};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_HIT: &str = "folio_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "folio_cache_miss_total";
pub(crate) const METRIC_CACHE_JOIN: &str = "folio_cache_join_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "folio_cache_evict_total";
pub(crate) const METRIC_LOADER_MS: &str = "folio_loader_ms";

/// Monotonic counter ordering writes, invalidations and load starts.
pub type Epoch = u64;

/// Payload of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// `getOne`.
    Record(Record),
    /// `getMany`: whatever subset of the ids the backend resolved.
    Records(Vec<Record>),
    /// `getList` / `getManyReference`: one page plus the unpaginated total.
    List { data: Vec<Record>, total: u64 },
}

impl CacheValue {
    pub fn records(&self) -> &[Record] {
        match self {
            CacheValue::Record(record) => std::slice::from_ref(record),
            CacheValue::Records(records) | CacheValue::List { data: records, .. } => records,
        }
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.records()
            .iter()
            .any(|record| record.id().as_ref() == Some(id))
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            CacheValue::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            CacheValue::Record(record) => vec![record],
            CacheValue::Records(records) | CacheValue::List { data: records, .. } => records,
        }
    }

    pub fn total(&self) -> Option<u64> {
        match self {
            CacheValue::List { total, .. } => Some(*total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Loading,
    Loaded,
    Error,
}

/// What a view sees for one fingerprint: loading flag, data, error.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryState {
    pub status: EntryStatus,
    pub data: Option<CacheValue>,
    pub error: Option<DataError>,
    pub stale: bool,
    pub updated_at: Option<OffsetDateTime>,
}

impl EntryState {
    fn loading() -> Self {
        Self {
            status: EntryStatus::Loading,
            data: None,
            error: None,
            stale: false,
            updated_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == EntryStatus::Loading
    }
}

/// Delivered to subscribers. `state` is `None` once the entry is gone.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    pub fingerprint: Fingerprint,
    pub state: Option<EntryState>,
}

pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

type Listener = dyn Fn(&EntryEvent) + Send + Sync;
type SharedLoad = Shared<BoxFuture<'static, Result<CacheValue, DataError>>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    state: EntryState,
    fetched_at: Option<Instant>,
    written_epoch: Epoch,
    invalidated_epoch: Epoch,
}

impl CacheEntry {
    fn new(state: EntryState, fetched_at: Option<Instant>) -> Self {
        Self {
            state,
            fetched_at,
            written_epoch: 0,
            invalidated_epoch: 0,
        }
    }
}

struct InFlight {
    token: Epoch,
    load: SharedLoad,
}

/// Saved copy of an entry, or of its absence.
#[derive(Debug, Clone, PartialEq)]
struct SavedEntry {
    state: EntryState,
    fetched_at: Option<Instant>,
}

/// Point-in-time copy of a set of entries, restorable verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: Vec<(Fingerprint, Option<SavedEntry>)>,
}

impl Snapshot {
    pub fn keys(&self) -> impl Iterator<Item = &Fingerprint> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.iter().any(|(key, _)| key == fingerprint)
    }

    /// Adopt the entries of `other` this snapshot does not already cover.
    pub fn extend_missing(&mut self, other: Snapshot) {
        for (key, saved) in other.entries {
            if !self.contains(&key) {
                self.entries.push((key, saved));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct StoreInner {
    config: CacheConfig,
    entries: RwLock<LruCache<Fingerprint, CacheEntry>>,
    in_flight: DashMap<Fingerprint, InFlight>,
    held: Mutex<HashMap<Fingerprint, usize>>,
    subscribers: Mutex<HashMap<Fingerprint, Vec<(u64, Arc<Listener>)>>>,
    epoch: AtomicU64,
    generation: AtomicU64,
    next_subscriber: AtomicU64,
}

/// Process-wide query cache.
///
/// Cheap to clone; every clone shares the same entries. Construct one at
/// application start and hand it to the components that need it.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: config.clone(),
                entries: RwLock::new(LruCache::new(config.max_entries_non_zero())),
                in_flight: DashMap::new(),
                held: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the cached value when fresh; otherwise run `loader` once, no
    /// matter how many callers ask for the same fingerprint concurrently.
    ///
    /// Callers arriving while a load is in flight join it and observe the
    /// same result. A failed load leaves the entry in `Error`; the next query
    /// starts over.
    #[instrument(skip(self, loader), fields(fingerprint = %fingerprint))]
    pub async fn query<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        loader: F,
    ) -> Result<CacheValue, DataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, DataError>> + Send + 'static,
    {
        if let Some(value) = self.fresh_value(&fingerprint) {
            counter!(METRIC_CACHE_HIT).increment(1);
            debug!("cache hit");
            return Ok(value);
        }

        let load = self.join_or_start(fingerprint, loader);
        load.await
    }

    /// Mark the entry stale and load it again, joining a load already in flight.
    pub async fn refetch<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        loader: F,
    ) -> Result<CacheValue, DataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, DataError>> + Send + 'static,
    {
        self.mark_stale(&fingerprint);
        self.query(fingerprint, loader).await
    }

    fn fresh_value(&self, fingerprint: &Fingerprint) -> Option<CacheValue> {
        let max_age = self.inner.config.cache_duration();
        let mut entries = rw_write(&self.inner.entries, SOURCE, "fresh_value");
        let entry = entries.get(fingerprint)?;
        let fresh = entry.state.status == EntryStatus::Loaded
            && !entry.state.stale
            && entry
                .fetched_at
                .is_some_and(|fetched_at| fetched_at.elapsed() < max_age);
        if fresh { entry.state.data.clone() } else { None }
    }

    fn join_or_start<F, Fut>(&self, fingerprint: Fingerprint, loader: F) -> SharedLoad
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheValue, DataError>> + Send + 'static,
    {
        let started = match self.inner.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(occupied) => {
                counter!(METRIC_CACHE_JOIN).increment(1);
                debug!(fingerprint = %fingerprint, "joined in-flight load");
                return occupied.get().load.clone();
            }
            Entry::Vacant(vacant) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                let token = self.inner.next_epoch();
                let generation = self.inner.generation.load(Ordering::SeqCst);
                let load = self.settling_load(fingerprint.clone(), token, generation, loader());
                vacant.insert(InFlight {
                    token,
                    load: load.clone(),
                });
                load
            }
        };

        self.mark_loading(&fingerprint);
        started
    }

    fn settling_load<Fut>(
        &self,
        fingerprint: Fingerprint,
        token: Epoch,
        generation: u64,
        load: Fut,
    ) -> SharedLoad
    where
        Fut: Future<Output = Result<CacheValue, DataError>> + Send + 'static,
    {
        let store: Weak<StoreInner> = Arc::downgrade(&self.inner);
        async move {
            let started_at = Instant::now();
            let result = load.await;
            histogram!(METRIC_LOADER_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
            if let Some(inner) = store.upgrade() {
                CacheStore { inner }.settle(&fingerprint, token, generation, &result);
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Record a finished load. The entry is written before the in-flight
    /// marker goes, so a query in between either joins or hits.
    fn settle(
        &self,
        fingerprint: &Fingerprint,
        token: Epoch,
        generation: u64,
        result: &Result<CacheValue, DataError>,
    ) {
        let state = if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(fingerprint = %fingerprint, "load finished after cache clear; discarded");
            None
        } else {
            let held = self.is_held(fingerprint);
            self.write_settled(fingerprint, token, held, result)
        };

        self.inner
            .in_flight
            .remove_if(fingerprint, |_, in_flight| in_flight.token == token);

        if let Some(state) = state {
            self.notify(fingerprint, Some(state));
        }
    }

    fn write_settled(
        &self,
        fingerprint: &Fingerprint,
        token: Epoch,
        held: bool,
        result: &Result<CacheValue, DataError>,
    ) -> Option<EntryState> {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "settle");
        let now = Instant::now();
        if entries.peek(fingerprint).is_none() {
            let placeholder = CacheEntry::new(EntryState::loading(), None);
            self.push_entry(&mut entries, fingerprint.clone(), placeholder);
        }
        let entry = entries.get_mut(fingerprint)?;
        let written_locally = entry.written_epoch > token || held;

        match result {
            Ok(_) if written_locally && entry.state.data.is_some() => {
                debug!(
                    fingerprint = %fingerprint,
                    held,
                    "entry has pending local changes; keeping local value, marking stale"
                );
                entry.state.status = EntryStatus::Loaded;
                entry.state.stale = true;
            }
            Ok(value) => {
                entry.state = EntryState {
                    status: EntryStatus::Loaded,
                    data: Some(value.clone()),
                    error: None,
                    stale: entry.invalidated_epoch > token || written_locally,
                    updated_at: Some(OffsetDateTime::now_utc()),
                };
                entry.fetched_at = Some(now);
            }
            Err(error) => {
                warn!(fingerprint = %fingerprint, error = %error, "cache load failed");
                entry.state.status = EntryStatus::Error;
                entry.state.error = Some(error.clone());
                entry.state.stale = true;
            }
        }
        Some(entry.state.clone())
    }

    fn mark_loading(&self, fingerprint: &Fingerprint) {
        let state = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "mark_loading");
            match entries.get_mut(fingerprint) {
                Some(entry) => {
                    entry.state.status = EntryStatus::Loading;
                    entry.state.clone()
                }
                None => {
                    let entry = CacheEntry::new(EntryState::loading(), None);
                    let state = entry.state.clone();
                    self.push_entry(&mut entries, fingerprint.clone(), entry);
                    state
                }
            }
        };
        self.notify(fingerprint, Some(state));
    }

    fn mark_stale(&self, fingerprint: &Fingerprint) {
        let state = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "mark_stale");
            let epoch = self.inner.next_epoch();
            entries.get_mut(fingerprint).map(|entry| {
                entry.state.stale = true;
                entry.invalidated_epoch = epoch;
                entry.state.clone()
            })
        };
        if let Some(state) = state {
            self.notify(fingerprint, Some(state));
        }
    }

    fn push_entry(
        &self,
        entries: &mut LruCache<Fingerprint, CacheEntry>,
        fingerprint: Fingerprint,
        entry: CacheEntry,
    ) {
        if let Some((evicted, _)) = entries.push(fingerprint.clone(), entry)
            && evicted != fingerprint
        {
            counter!(METRIC_CACHE_EVICT).increment(1);
            debug!(evicted = %evicted, "cache entry evicted");
        }
    }

    /// Synchronous local update; never touches the network.
    pub fn write(&self, fingerprint: &Fingerprint, value: CacheValue) {
        let state = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "write");
            self.write_entry(&mut entries, fingerprint, value)
        };
        self.notify(fingerprint, Some(state));
    }

    /// Write a value that arrived as a by-product of another read.
    ///
    /// Skipped when the entry is loading, is held by a pending mutation, or
    /// was written after `since`. Returns whether the value was written.
    pub fn seed(&self, fingerprint: &Fingerprint, value: CacheValue, since: Epoch) -> bool {
        if self.is_in_flight(fingerprint) || self.is_held(fingerprint) {
            return false;
        }
        let state = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "seed");
            if entries
                .peek(fingerprint)
                .is_some_and(|entry| entry.written_epoch > since)
            {
                return false;
            }
            self.write_entry(&mut entries, fingerprint, value)
        };
        self.notify(fingerprint, Some(state));
        true
    }

    fn write_entry(
        &self,
        entries: &mut LruCache<Fingerprint, CacheEntry>,
        fingerprint: &Fingerprint,
        value: CacheValue,
    ) -> EntryState {
        let epoch = self.inner.next_epoch();
        let now = OffsetDateTime::now_utc();
        match entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.state.data = Some(value);
                entry.state.error = None;
                if entry.state.status != EntryStatus::Loading {
                    entry.state.status = EntryStatus::Loaded;
                }
                entry.state.updated_at = Some(now);
                entry.fetched_at.get_or_insert_with(Instant::now);
                entry.written_epoch = epoch;
                entry.state.clone()
            }
            None => {
                let state = EntryState {
                    status: EntryStatus::Loaded,
                    data: Some(value),
                    error: None,
                    stale: false,
                    updated_at: Some(now),
                };
                let mut entry = CacheEntry::new(state.clone(), Some(Instant::now()));
                entry.written_epoch = epoch;
                self.push_entry(entries, fingerprint.clone(), entry);
                state
            }
        }
    }

    /// Pin `keys` while a mutation that wrote them locally is unresolved.
    ///
    /// Loads that settle into a held entry keep its local value and leave it
    /// stale; [`seed`](Self::seed) skips held entries. Holds nest.
    pub fn hold<'a>(&self, keys: impl IntoIterator<Item = &'a Fingerprint>) {
        let mut held = mutex_lock(&self.inner.held, SOURCE, "hold");
        for key in keys {
            *held.entry(key.clone()).or_default() += 1;
        }
    }

    pub fn release<'a>(&self, keys: impl IntoIterator<Item = &'a Fingerprint>) {
        let mut held = mutex_lock(&self.inner.held, SOURCE, "release");
        for key in keys {
            if let Some(count) = held.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    held.remove(key);
                }
            }
        }
    }

    pub fn is_held(&self, fingerprint: &Fingerprint) -> bool {
        mutex_lock(&self.inner.held, SOURCE, "is_held").contains_key(fingerprint)
    }

    /// Latest epoch handed out; anything written later compares greater.
    pub fn epoch(&self) -> Epoch {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn remove(&self, fingerprint: &Fingerprint) {
        let removed = rw_write(&self.inner.entries, SOURCE, "remove")
            .pop(fingerprint)
            .is_some();
        if removed {
            self.notify(fingerprint, None);
        }
    }

    /// Mark every matching entry stale so its next query reloads it.
    ///
    /// Returns the number of entries affected.
    pub fn invalidate(&self, matcher: &Invalidation) -> usize {
        let touched: Vec<(Fingerprint, EntryState)> = {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "invalidate");
            let epoch = self.inner.next_epoch();
            entries
                .iter_mut()
                .filter(|(key, entry)| matcher.matches(key, entry.state.data.as_ref()))
                .map(|(key, entry)| {
                    entry.state.stale = true;
                    entry.invalidated_epoch = epoch;
                    (key.clone(), entry.state.clone())
                })
                .collect()
        };

        debug!(matcher = ?matcher, count = touched.len(), "cache invalidated");
        let count = touched.len();
        for (fingerprint, state) in touched {
            self.notify(&fingerprint, Some(state));
        }
        count
    }

    /// Drop every entry and abandon in-flight results. Subscriptions survive.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.drop_entries();
    }

    /// Clear only if nothing cleared the store since `generation` was read.
    ///
    /// Returns `false` when another clear got there first.
    pub fn clear_since(&self, generation: u64) -> bool {
        let swapped = self.inner.generation.compare_exchange(
            generation,
            generation + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_err() {
            return false;
        }
        self.drop_entries();
        true
    }

    /// Bumped by every clear.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn drop_entries(&self) {
        rw_write(&self.inner.entries, SOURCE, "clear").clear();
        self.inner.in_flight.clear();

        let subscribed: Vec<Fingerprint> = mutex_lock(&self.inner.subscribers, SOURCE, "clear")
            .keys()
            .cloned()
            .collect();
        debug!(subscribed = subscribed.len(), "cache cleared");
        for fingerprint in subscribed {
            self.notify(&fingerprint, None);
        }
    }

    /// Clear everything, including subscriptions. Used at shutdown and between tests.
    pub fn teardown(&self) {
        self.clear();
        mutex_lock(&self.inner.subscribers, SOURCE, "teardown").clear();
    }

    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a Fingerprint>) -> Snapshot {
        let entries = rw_read(&self.inner.entries, SOURCE, "snapshot");
        let mut snapshot = Snapshot::default();
        for key in keys {
            if snapshot.contains(key) {
                continue;
            }
            let saved = entries.peek(key).map(|entry| SavedEntry {
                state: entry.state.clone(),
                fetched_at: entry.fetched_at,
            });
            snapshot.entries.push((key.clone(), saved));
        }
        snapshot
    }

    /// Put every entry of `snapshot` back exactly as captured, including
    /// entries that did not exist at capture time.
    pub fn restore(&self, snapshot: &Snapshot) {
        let mut changed = Vec::with_capacity(snapshot.entries.len());
        {
            let mut entries = rw_write(&self.inner.entries, SOURCE, "restore");
            for (key, saved) in &snapshot.entries {
                let epoch = self.inner.next_epoch();
                match saved {
                    Some(saved) => {
                        let invalidated_epoch = entries
                            .peek(key)
                            .map(|entry| entry.invalidated_epoch)
                            .unwrap_or(0);
                        let entry = CacheEntry {
                            state: saved.state.clone(),
                            fetched_at: saved.fetched_at,
                            written_epoch: epoch,
                            invalidated_epoch,
                        };
                        match entries.get_mut(key) {
                            Some(existing) => *existing = entry,
                            None => self.push_entry(&mut entries, key.clone(), entry),
                        }
                        changed.push((key.clone(), Some(saved.state.clone())));
                    }
                    None => {
                        if entries.pop(key).is_some() {
                            changed.push((key.clone(), None));
                        }
                    }
                }
            }
        }

        for (fingerprint, state) in changed {
            self.notify(&fingerprint, state);
        }
    }

    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheValue> {
        rw_read(&self.inner.entries, SOURCE, "peek")
            .peek(fingerprint)
            .and_then(|entry| entry.state.data.clone())
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        rw_read(&self.inner.entries, SOURCE, "state")
            .peek(fingerprint)
            .map(|entry| entry.state.clone())
    }

    /// Fingerprints of every entry that belongs to `resource`.
    pub fn fingerprints_for(&self, resource: &Resource) -> Vec<Fingerprint> {
        rw_read(&self.inner.entries, SOURCE, "fingerprints_for")
            .iter()
            .filter(|(key, _)| key.resource() == resource)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.in_flight.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `callback` for every change to `fingerprint`'s entry.
    ///
    /// The returned closure removes the subscription; calling it after the
    /// store is gone is harmless.
    pub fn subscribe(
        &self,
        fingerprint: &Fingerprint,
        callback: impl Fn(&EntryEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.subscribers, SOURCE, "subscribe")
            .entry(fingerprint.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let store: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let key = fingerprint.clone();
        Box::new(move || {
            let Some(inner) = store.upgrade() else {
                return;
            };
            let mut subscribers = mutex_lock(&inner.subscribers, SOURCE, "unsubscribe");
            if let Some(listeners) = subscribers.get_mut(&key) {
                listeners.retain(|(listener_id, _)| *listener_id != id);
                if listeners.is_empty() {
                    subscribers.remove(&key);
                }
            }
        })
    }

    pub fn subscriber_count(&self, fingerprint: &Fingerprint) -> usize {
        mutex_lock(&self.inner.subscribers, SOURCE, "subscriber_count")
            .get(fingerprint)
            .map_or(0, Vec::len)
    }

    fn notify(&self, fingerprint: &Fingerprint, state: Option<EntryState>) {
        let listeners: Vec<Arc<Listener>> = {
            let subscribers = mutex_lock(&self.inner.subscribers, SOURCE, "notify");
            match subscribers.get(fingerprint) {
                Some(listeners) => listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };

        let event = EntryEvent {
            fingerprint: fingerprint.clone(),
            state,
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

impl StoreInner {
    fn next_epoch(&self) -> Epoch {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    fn store() -> CacheStore {
        CacheStore::new(&CacheConfig::default())
    }

    fn record(id: i64, title: &str) -> Record {
        Record::from_value(json!({"id": id, "title": title})).expect("record")
    }

    fn post_key(id: i64) -> Fingerprint {
        Fingerprint::one(&Resource::new("posts"), &Identifier::Int(id))
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_loader() {
        let store = store();
        let key = post_key(1);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = store
                .query(key.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheValue::Record(record(1, "A")))
                })
                .await
                .expect("load");
            assert_eq!(value, CacheValue::Record(record(1, "A")));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_records_error_and_next_query_retries() {
        let store = store();
        let key = post_key(1);

        let failed = store
            .query(key.clone(), || async {
                Err(DataError::adapter(503, "unavailable"))
            })
            .await;
        assert_eq!(failed, Err(DataError::adapter(503, "unavailable")));

        let state = store.state(&key).expect("entry exists");
        assert_eq!(state.status, EntryStatus::Error);
        assert!(state.error.is_some());

        let retried = store
            .query(key.clone(), || async { Ok(CacheValue::Record(record(1, "A"))) })
            .await;
        assert!(retried.is_ok());
        assert_eq!(
            store.state(&key).map(|state| state.status),
            Some(EntryStatus::Loaded)
        );
    }

    #[tokio::test]
    async fn invalidated_entries_reload() {
        let store = store();
        let key = post_key(1);
        store.write(&key, CacheValue::Record(record(1, "old")));

        let count = store.invalidate(&Invalidation::Resource(Resource::new("posts")));
        assert_eq!(count, 1);

        let value = store
            .query(key.clone(), || async { Ok(CacheValue::Record(record(1, "new"))) })
            .await
            .expect("reload");
        assert_eq!(value, CacheValue::Record(record(1, "new")));
    }

    #[tokio::test]
    async fn zero_duration_always_revalidates() {
        let store = CacheStore::new(&CacheConfig {
            cache_duration_ms: 0,
            ..Default::default()
        });
        let key = post_key(1);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            store
                .query(key.clone(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CacheValue::Record(record(1, "A")))
                })
                .await
                .expect("load");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn snapshot_restores_values_and_absence() {
        let store = store();
        let existing = post_key(1);
        let missing = post_key(2);
        store.write(&existing, CacheValue::Record(record(1, "before")));
        let before = store.state(&existing);

        let snapshot = store.snapshot([&existing, &missing]);
        store.write(&existing, CacheValue::Record(record(1, "after")));
        store.write(&missing, CacheValue::Record(record(2, "temp")));

        store.restore(&snapshot);

        assert_eq!(store.state(&existing), before);
        assert!(store.state(&missing).is_none());
    }

    #[test]
    fn subscribers_see_writes_until_unsubscribed() {
        let store = store();
        let key = post_key(1);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let unsubscribe = store.subscribe(&key, move |event| {
            assert!(event.state.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.write(&key, CacheValue::Record(record(1, "A")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        unsubscribe();
        store.write(&key, CacheValue::Record(record(1, "B")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(&key), 0);
    }

    #[test]
    fn lru_evicts_oldest_entries() {
        let store = CacheStore::new(&CacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        store.write(&post_key(1), CacheValue::Record(record(1, "A")));
        store.write(&post_key(2), CacheValue::Record(record(2, "B")));
        store.write(&post_key(3), CacheValue::Record(record(3, "C")));

        assert!(store.peek(&post_key(1)).is_none());
        assert!(store.peek(&post_key(2)).is_some());
        assert!(store.peek(&post_key(3)).is_some());
    }

    #[test]
    fn clear_drops_entries_and_notifies_subscribers() {
        let store = store();
        let key = post_key(1);
        store.write(&key, CacheValue::Record(record(1, "A")));

        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleared);
        let _unsubscribe = store.subscribe(&key, move |event| {
            if event.state.is_none() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.clear();

        assert!(store.is_empty());
        assert_eq!(cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn held_entries_keep_local_value_through_loads_and_seeds() {
        let store = store();
        let key = post_key(1);
        store.write(&key, CacheValue::Record(record(1, "local")));
        store.hold([&key]);

        let since = store.epoch();
        assert!(!store.seed(&key, CacheValue::Record(record(1, "server")), since));

        let loaded = store
            .refetch(key.clone(), || async { Ok(CacheValue::Record(record(1, "server"))) })
            .await
            .expect("load");
        assert_eq!(loaded, CacheValue::Record(record(1, "server")));
        let state = store.state(&key).expect("entry");
        assert_eq!(state.data, Some(CacheValue::Record(record(1, "local"))));
        assert_eq!(state.status, EntryStatus::Loaded);
        assert!(state.stale);

        store.release([&key]);
        assert!(!store.is_held(&key));
        assert!(store.seed(&key, CacheValue::Record(record(1, "server")), store.epoch()));
        assert_eq!(store.peek(&key), Some(CacheValue::Record(record(1, "server"))));
    }

    #[test]
    fn seed_skips_entries_written_after_the_read_began() {
        let store = store();
        let key = post_key(1);
        let since = store.epoch();
        store.write(&key, CacheValue::Record(record(1, "newer")));

        assert!(!store.seed(&key, CacheValue::Record(record(1, "older")), since));
        assert_eq!(store.peek(&key), Some(CacheValue::Record(record(1, "newer"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_flight_marker_outlives_the_entry_write() {
        let store = store();
        let key = post_key(1);
        let (open, gate) = oneshot::channel::<()>();
        let loading = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .query(key, move || async move {
                        let _ = gate.await;
                        Ok(CacheValue::Record(record(1, "A")))
                    })
                    .await
            })
        };
        while !store.state(&key).is_some_and(|state| state.is_loading()) {
            tokio::task::yield_now().await;
        }

        {
            // Blocks the settle write; the marker must still be there.
            let _entries = rw_read(&store.inner.entries, SOURCE, "test");
            let _ = open.send(());
            std::thread::sleep(Duration::from_millis(50));
            assert!(store.is_in_flight(&key));
        }

        loading.await.expect("task").expect("load");
        assert!(!store.is_in_flight(&key));
        assert_eq!(
            store.state(&key).map(|state| state.status),
            Some(EntryStatus::Loaded)
        );
    }
}
