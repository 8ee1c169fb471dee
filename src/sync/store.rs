//! Cache entry storage.
//!
//! One entry per cache key holding the last known data, fetch status,
//! subscriber count and the tags fixed at first resolution. The store is owned
//! by the client's state lock and is never locked on its own.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use metrics::gauge;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::SyncError;
use super::keys::{CacheKey, Tag};

const METRIC_ENTRIES: &str = "marketsync_entries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

struct CacheEntry {
    params: Value,
    status: QueryStatus,
    data: Option<Arc<Value>>,
    error: Option<SyncError>,
    tags: Option<BTreeSet<Tag>>,
    version: u64,
    confirmed_version: u64,
    subscriber_count: usize,
    stale: bool,
    current_request: Option<u64>,
    eviction_generation: u64,
}

impl CacheEntry {
    fn new(params: Value) -> Self {
        Self {
            params,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            tags: None,
            version: 0,
            confirmed_version: 0,
            subscriber_count: 0,
            stale: false,
            current_request: None,
            eviction_generation: 0,
        }
    }
}

/// Result of writing a fetch result back into an entry.
#[derive(Debug)]
pub struct FetchWrite {
    pub version: u64,
    /// Tags fixed by this write; `None` when the entry already had tags.
    pub new_tags: Option<BTreeSet<Tag>>,
}

/// Immutable view of one entry, handed to subscribers and callers.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub status: QueryStatus,
    pub data: Option<Arc<Value>>,
    pub error: Option<SyncError>,
    pub tags: Vec<Tag>,
    pub version: u64,
    pub confirmed_version: u64,
    pub subscriber_count: usize,
    pub stale: bool,
}

impl EntrySnapshot {
    /// Snapshot of a key that has no entry yet.
    pub fn uninitialized(key: CacheKey) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            tags: Vec::new(),
            version: 0,
            confirmed_version: 0,
            subscriber_count: 0,
            stale: false,
        }
    }

    /// Decode the cached data as `T`. `Ok(None)` when there is no data yet.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
        self.data
            .as_deref()
            .map(|data| {
                serde_json::from_value(data.clone())
                    .map_err(|err| SyncError::codec(self.key.endpoint(), err))
            })
            .transpose()
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Data was written locally (patch or rollback) since the last
    /// server-confirmed write.
    pub fn has_local_writes(&self) -> bool {
        self.version != self.confirmed_version
    }
}

#[derive(Default)]
pub struct CacheStore {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an Idle entry for `key` if none exists. Returns true when created.
    pub fn ensure(&mut self, key: &CacheKey, params: Value) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.clone(), CacheEntry::new(params));
        self.record_len();
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        self.entries.get(key).map(|entry| EntrySnapshot {
            key: key.clone(),
            status: entry.status,
            data: entry.data.clone(),
            error: entry.error.clone(),
            tags: entry
                .tags
                .as_ref()
                .map(|tags| tags.iter().cloned().collect())
                .unwrap_or_default(),
            version: entry.version,
            confirmed_version: entry.confirmed_version,
            subscriber_count: entry.subscriber_count,
            stale: entry.stale,
        })
    }

    /// Data that can be served without fetching: resolved and not stale.
    pub fn fresh_data(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.entries
            .get(key)
            .filter(|entry| entry.status == QueryStatus::Success && !entry.stale)
            .and_then(|entry| entry.data.clone())
    }

    pub fn data(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.entries.get(key).and_then(|entry| entry.data.clone())
    }

    pub fn params(&self, key: &CacheKey) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.params.clone())
    }

    /// Idle, failed and stale entries need a fetch when someone subscribes.
    pub fn needs_fetch(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|entry| {
            entry.stale || matches!(entry.status, QueryStatus::Idle | QueryStatus::Error)
        })
    }

    pub fn begin_fetch(&mut self, key: &CacheKey, request: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.status = QueryStatus::Loading;
        entry.current_request = Some(request);
        true
    }

    /// Whether `request` is still the fetch whose result may be written.
    pub fn is_current_request(&self, key: &CacheKey, request: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.current_request == Some(request))
    }

    /// Write a server result. Tags are computed by `provides` only on the
    /// entry's first successful resolution.
    pub fn complete_success(
        &mut self,
        key: &CacheKey,
        request: u64,
        data: Arc<Value>,
        provides: impl FnOnce(&Value, &Value) -> Vec<Tag>,
    ) -> Option<FetchWrite> {
        let entry = self
            .entries
            .get_mut(key)
            .filter(|entry| entry.current_request == Some(request))?;

        let new_tags = if entry.tags.is_none() {
            let tags: BTreeSet<Tag> = provides(&data, &entry.params).into_iter().collect();
            entry.tags = Some(tags.clone());
            Some(tags)
        } else {
            None
        };

        entry.data = Some(data);
        entry.error = None;
        entry.status = QueryStatus::Success;
        entry.stale = false;
        entry.current_request = None;
        entry.version += 1;
        entry.confirmed_version = entry.version;

        Some(FetchWrite {
            version: entry.version,
            new_tags,
        })
    }

    /// Record a failed fetch. Existing data and version are kept.
    pub fn complete_error(&mut self, key: &CacheKey, request: u64, error: SyncError) -> bool {
        let Some(entry) = self
            .entries
            .get_mut(key)
            .filter(|entry| entry.current_request == Some(request))
        else {
            return false;
        };
        entry.status = QueryStatus::Error;
        entry.error = Some(error);
        entry.current_request = None;
        true
    }

    /// Replace the entry's data with a locally computed value (optimistic
    /// patch or rollback). Returns the new version.
    pub fn write_data(&mut self, key: &CacheKey, data: Value) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        entry.data = Some(Arc::new(data));
        entry.version += 1;
        Some(entry.version)
    }

    pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Add a subscriber and cancel any scheduled eviction.
    pub fn add_subscriber(&mut self, key: &CacheKey) -> usize {
        let Some(entry) = self.entries.get_mut(key) else {
            return 0;
        };
        entry.subscriber_count += 1;
        entry.eviction_generation += 1;
        entry.subscriber_count
    }

    pub fn remove_subscriber(&mut self, key: &CacheKey) -> usize {
        let Some(entry) = self.entries.get_mut(key) else {
            return 0;
        };
        entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
        entry.subscriber_count
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.entries
            .get(key)
            .map_or(0, |entry| entry.subscriber_count)
    }

    /// Start a new eviction generation; a delayed eviction only proceeds if
    /// the generation is unchanged when its timer fires.
    pub fn schedule_eviction(&mut self, key: &CacheKey) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        entry.eviction_generation += 1;
        Some(entry.eviction_generation)
    }

    pub fn eviction_generation(&self, key: &CacheKey) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.eviction_generation)
    }

    pub fn evict(&mut self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.record_len();
        }
        removed
    }

    /// Cached keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.record_len();
    }

    fn record_len(&self) {
        gauge!(METRIC_ENTRIES).set(self.entries.len() as f64);
    }
}
