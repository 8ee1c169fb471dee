//! Sync layer configuration.
//!
//! Controls entry retention, invalidation refetching and the size of the
//! diagnostic event journal. Loaded from the `[sync]` table of `marketsync.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_KEEP_UNUSED_DATA_FOR_MS: u64 = 0;
const DEFAULT_EVENT_JOURNAL_LIMIT: usize = 256;

/// Sync layer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Grace period (ms) before an entry with no subscribers is evicted.
    /// Zero evicts as soon as the last subscriber leaves.
    pub keep_unused_data_for_ms: u64,
    /// Refetch invalidated entries that still have subscribers. When off,
    /// invalidated entries are only marked stale.
    pub refetch_on_invalidate: bool,
    /// Maximum events retained by the event journal.
    pub event_journal_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            keep_unused_data_for_ms: DEFAULT_KEEP_UNUSED_DATA_FOR_MS,
            refetch_on_invalidate: true,
            event_journal_limit: DEFAULT_EVENT_JOURNAL_LIMIT,
        }
    }
}

impl From<&crate::config::SyncSettings> for SyncConfig {
    fn from(settings: &crate::config::SyncSettings) -> Self {
        Self {
            keep_unused_data_for_ms: settings.keep_unused_data_for.as_millis() as u64,
            refetch_on_invalidate: settings.refetch_on_invalidate,
            event_journal_limit: settings.event_journal_limit.get(),
        }
    }
}

impl SyncConfig {
    /// Eviction grace period, or `None` for immediate eviction.
    pub fn keep_unused_data_for(&self) -> Option<Duration> {
        (self.keep_unused_data_for_ms > 0)
            .then(|| Duration::from_millis(self.keep_unused_data_for_ms))
    }

    /// Returns the journal limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_journal_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_journal_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
