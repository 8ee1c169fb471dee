//! Sync event journal.
//!
//! A bounded in-memory log of what the sync layer did and why. Events carry a
//! monotonic epoch so tests and diagnostics can order them.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use time::OffsetDateTime;
use tracing::trace;
use uuid::Uuid;

use super::keys::{CacheKey, Tag};
use super::lock::mutex_lock;
use super::patch::MutationId;

const SOURCE: &str = "sync::events";
const METRIC_EVENT_DROPPED: &str = "marketsync_event_dropped_total";

/// Monotonic epoch for ordering events.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl SyncEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Why a revert left data alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// A server-confirmed write or an eviction replaced the patched data.
    Superseded,
    /// Some paths no longer hold what the patch wrote.
    Overwritten { paths: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    // Reads
    CacheHit { key: CacheKey },
    FetchDeduped { key: CacheKey },
    FetchStarted { key: CacheKey, request: u64 },
    FetchSucceeded { key: CacheKey, request: u64, version: u64 },
    FetchFailed { key: CacheKey, request: u64, error: String },
    /// A superseded or evicted request finished; its result was not stored.
    FetchDiscarded { key: CacheKey, request: u64 },

    // Writes
    PatchApplied { mutation: MutationId, key: CacheKey, version: u64 },
    PatchCommitted { mutation: MutationId, key: CacheKey },
    PatchReverted {
        mutation: MutationId,
        key: CacheKey,
        restored: usize,
        rebased: usize,
    },
    PatchConflict {
        mutation: MutationId,
        key: CacheKey,
        reason: ConflictReason,
    },
    MutationSettled {
        mutation: MutationId,
        endpoint: String,
        succeeded: bool,
    },

    // Invalidation and lifecycle
    TagsInvalidated {
        tags: Vec<Tag>,
        refetched: usize,
        stale_only: usize,
    },
    StaleWithoutSubscriber { key: CacheKey },
    Evicted { key: CacheKey },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::CacheHit { key } => write!(f, "cache hit {key}"),
            EventKind::FetchDeduped { key } => write!(f, "fetch deduped {key}"),
            EventKind::FetchStarted { key, request } => {
                write!(f, "fetch started {key} (request {request})")
            }
            EventKind::FetchSucceeded {
                key,
                request,
                version,
            } => write!(f, "fetch succeeded {key} (request {request}, version {version})"),
            EventKind::FetchFailed { key, request, error } => {
                write!(f, "fetch failed {key} (request {request}): {error}")
            }
            EventKind::FetchDiscarded { key, request } => {
                write!(f, "fetch discarded {key} (request {request})")
            }
            EventKind::PatchApplied {
                mutation,
                key,
                version,
            } => write!(f, "patch {mutation} applied to {key} (version {version})"),
            EventKind::PatchCommitted { mutation, key } => {
                write!(f, "patch {mutation} committed on {key}")
            }
            EventKind::PatchReverted {
                mutation,
                key,
                restored,
                rebased,
            } => write!(
                f,
                "patch {mutation} reverted on {key} (restored {restored}, rebased {rebased})"
            ),
            EventKind::PatchConflict {
                mutation,
                key,
                reason,
            } => match reason {
                ConflictReason::Superseded => {
                    write!(f, "patch {mutation} on {key} superseded by server data")
                }
                ConflictReason::Overwritten { paths } => {
                    write!(f, "patch {mutation} on {key}: {paths} path(s) overwritten")
                }
            },
            EventKind::MutationSettled {
                mutation,
                endpoint,
                succeeded,
            } => {
                let outcome = if *succeeded { "fulfilled" } else { "rejected" };
                write!(f, "mutation {mutation} {endpoint} {outcome}")
            }
            EventKind::TagsInvalidated {
                tags,
                refetched,
                stale_only,
            } => {
                let tags: Vec<String> = tags.iter().map(Tag::to_string).collect();
                write!(
                    f,
                    "tags [{}] invalidated (refetched {refetched}, stale {stale_only})",
                    tags.join(", ")
                )
            }
            EventKind::StaleWithoutSubscriber { key } => {
                write!(f, "{key} marked stale without subscriber")
            }
            EventKind::Evicted { key } => write!(f, "{key} evicted"),
        }
    }
}

/// Bounded event log. Oldest events are dropped once the limit is reached.
pub struct EventJournal {
    events: Mutex<VecDeque<SyncEvent>>,
    limit: NonZeroUsize,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
}

impl EventJournal {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(limit.get().min(1024))),
            limit,
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn record(&self, kind: EventKind) {
        let event = SyncEvent::new(kind, self.next_epoch());
        trace!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Sync event recorded"
        );

        let mut events = mutex_lock(&self.events, SOURCE, "record");
        if events.len() >= self.limit.get() {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_EVENT_DROPPED).increment(1);
        }
        events.push_back(event);
    }

    /// Remove and return every retained event, oldest first.
    pub fn drain(&self) -> Vec<SyncEvent> {
        mutex_lock(&self.events, SOURCE, "drain").drain(..).collect()
    }

    /// Copy of every retained event, oldest first.
    pub fn snapshot(&self) -> Vec<SyncEvent> {
        mutex_lock(&self.events, SOURCE, "snapshot")
            .iter()
            .cloned()
            .collect()
    }

    /// The `count` most recent events, oldest first.
    pub fn recent(&self, count: usize) -> Vec<SyncEvent> {
        let events = mutex_lock(&self.events, SOURCE, "recent");
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.events, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.events, SOURCE, "clear").clear();
    }
}
