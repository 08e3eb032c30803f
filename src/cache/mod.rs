//! Folio query cache.
//!
//! Holds the result of every read the data layer has performed, keyed by a
//! [`Fingerprint`] of the request:
//!
//! - **Single-flight**: concurrent queries for the same fingerprint share
//!   one loader call.
//! - **Freshness**: entries younger than `cache_duration` are served
//!   without touching the backend.
//! - **Snapshots**: optimistic writes capture entries before changing them
//!   and restore them verbatim on failure.
//!
//! ## Configuration
//!
//! ```toml
//! [data]
//! cache_duration_ms = 300000
//! cache_max_entries = 500
//! ```

mod config;
mod keys;
mod lock;
mod store;

pub use config::CacheConfig;
pub use keys::{Fingerprint, Invalidation};
pub use store::{
    CacheStore, CacheValue, EntryEvent, EntryState, EntryStatus, Epoch, Snapshot, Unsubscribe,
};

pub(crate) use lock::{mutex_lock, rw_read, rw_write};
pub(crate) use store::{
    METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_JOIN, METRIC_CACHE_MISS, METRIC_LOADER_MS,
};
