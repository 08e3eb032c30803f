//! Cache configuration.
//!
//! Derived from the `[data]` section of `folio.toml`; see `config::DataSettings`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CACHE_DURATION_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a loaded entry is considered stale. Zero means every
    /// query revalidates.
    pub cache_duration_ms: u64,
    /// Maximum number of loaded entries kept (LRU eviction).
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_duration_ms: DEFAULT_CACHE_DURATION_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::DataSettings> for CacheConfig {
    fn from(settings: &crate::config::DataSettings) -> Self {
        Self {
            cache_duration_ms: settings.cache_duration.as_millis() as u64,
            max_entries: settings.cache_max_entries.get(),
        }
    }
}

impl CacheConfig {
    pub fn cache_duration(&self) -> Duration {
        Duration::from_millis(self.cache_duration_ms)
    }

    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
