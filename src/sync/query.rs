//! Query executor.
//!
//! Resolves reads from the cache or the network. Concurrent resolvers of the
//! same key share one in-flight request; only the request currently owning
//! an entry may write its result back.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use super::client::{ClientInner, SyncState};
use super::endpoint::ErasedQuery;
use super::error::SyncError;
use super::events::EventKind;
use super::keys::CacheKey;
use super::notifier::Notifications;

const METRIC_QUERY_HIT: &str = "marketsync_query_hit_total";
const METRIC_QUERY_MISS: &str = "marketsync_query_miss_total";
const METRIC_QUERY_DEDUP: &str = "marketsync_query_dedup_total";
const METRIC_FETCH_ERROR: &str = "marketsync_fetch_error_total";

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>, SyncError>>>;

/// One network operation that any number of resolvers can await.
pub(crate) struct InFlightRequest {
    pub request: u64,
    pub future: SharedFetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Serve fresh cached data, else join or start a fetch.
    CacheFirst,
    /// Always start a new fetch, superseding any in flight.
    Force,
}

impl ClientInner {
    pub(crate) async fn resolve_value(
        self: &Arc<Self>,
        query: Arc<ErasedQuery>,
        key: CacheKey,
        params: Value,
        mode: FetchMode,
    ) -> Result<Arc<Value>, SyncError> {
        let fetch = {
            let mut state = self.lock_state("resolve");
            state.store.ensure(&key, params);

            match mode {
                FetchMode::CacheFirst => {
                    if let Some(data) = state.store.fresh_data(&key) {
                        counter!(METRIC_QUERY_HIT).increment(1);
                        debug!(key = %key, "Cache hit");
                        self.journal.record(EventKind::CacheHit { key });
                        return Ok(data);
                    }

                    let existing = state
                        .inflight
                        .get(&key)
                        .map(|inflight| inflight.future.clone());
                    match existing {
                        Some(future) => {
                            counter!(METRIC_QUERY_DEDUP).increment(1);
                            debug!(key = %key, "Joined in-flight fetch");
                            self.journal.record(EventKind::FetchDeduped { key: key.clone() });
                            future
                        }
                        None => {
                            counter!(METRIC_QUERY_MISS).increment(1);
                            self.start_fetch(&mut state, &query, &key)
                        }
                    }
                }
                FetchMode::Force => self.start_fetch(&mut state, &query, &key),
            }
        };

        fetch.await
    }

    /// Start a fetch for `key` and make it the entry's current request.
    ///
    /// The fetch function runs when the returned future is first polled.
    pub(crate) fn start_fetch(
        self: &Arc<Self>,
        state: &mut SyncState,
        query: &Arc<ErasedQuery>,
        key: &CacheKey,
    ) -> SharedFetch {
        let request = self.next_id();
        let params = state.store.params(key).unwrap_or(Value::Null);
        state.store.begin_fetch(key, request);

        let client = Arc::downgrade(self);
        let fetch_query = Arc::clone(query);
        let fetch_key = key.clone();
        let future = async move {
            let result = (fetch_query.fetch)(params).await;
            match client.upgrade() {
                Some(client) => client.complete_fetch(&fetch_query, &fetch_key, request, result),
                None => result.map(Arc::new),
            }
        }
        .boxed()
        .shared();

        let previous = state.inflight.insert(
            key.clone(),
            InFlightRequest {
                request,
                future: future.clone(),
            },
        );
        match previous {
            Some(previous) => debug!(
                key = %key,
                request,
                superseded = previous.request,
                "Fetch started, superseding in-flight request"
            ),
            None => debug!(key = %key, request, "Fetch started"),
        }
        self.journal.record(EventKind::FetchStarted {
            key: key.clone(),
            request,
        });
        future
    }

    /// Write a fetch result back if `request` still owns the entry.
    ///
    /// Results of superseded or evicted requests are handed to their awaiters
    /// unchanged but never stored. An entry nobody subscribes to is released
    /// once its fetch settles.
    fn complete_fetch(
        self: &Arc<Self>,
        query: &ErasedQuery,
        key: &CacheKey,
        request: u64,
        result: Result<Value, SyncError>,
    ) -> Result<Arc<Value>, SyncError> {
        let result = result.map(Arc::new);
        let mut notifications = Notifications::new();

        {
            let mut state = self.lock_state("complete_fetch");
            if state
                .inflight
                .get(key)
                .is_some_and(|inflight| inflight.request == request)
            {
                state.inflight.remove(key);
            }

            if !state.store.is_current_request(key, request) {
                debug!(key = %key, request, "Fetch result discarded");
                self.journal.record(EventKind::FetchDiscarded {
                    key: key.clone(),
                    request,
                });
                return result;
            }

            match &result {
                Ok(data) => {
                    let write = state.store.complete_success(
                        key,
                        request,
                        Arc::clone(data),
                        |data, params| (query.provides)(data, params),
                    );
                    if let Some(write) = write {
                        if let Some(tags) = write.new_tags {
                            state.tags.register(key.clone(), tags);
                        }
                        let superseded = state.ledger.supersede(key);
                        debug!(
                            key = %key,
                            request,
                            version = write.version,
                            superseded_patches = superseded.len(),
                            "Fetch succeeded"
                        );
                        self.journal.record(EventKind::FetchSucceeded {
                            key: key.clone(),
                            request,
                            version: write.version,
                        });
                    }
                }
                Err(error) => {
                    state.store.complete_error(key, request, error.clone());
                    counter!(METRIC_FETCH_ERROR).increment(1);
                    warn!(key = %key, request, error = %error, "Fetch failed");
                    self.journal.record(EventKind::FetchFailed {
                        key: key.clone(),
                        request,
                        error: error.to_string(),
                    });
                }
            }
            notifications.queue(&state.notifier, &state.store, key);
            if state.store.subscriber_count(key) == 0 {
                self.release_unused(&mut state, key);
            }
        }

        notifications.dispatch();
        result
    }
}
