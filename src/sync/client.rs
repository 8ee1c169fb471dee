//! Sync client.
//!
//! Owns the cache store, tag index, patch ledger, notifier and in-flight
//! requests behind a single state lock. Consumers hold a cheap clonable
//! `SyncClient` handle; there is no global instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::config::SyncConfig;
use super::endpoint::{
    EndpointRegistry, ErasedQuery, MutationEndpoint, MutationHandle, QueryEndpoint, QueryHandle,
};
use super::error::SyncError;
use super::events::{EventJournal, EventKind, SyncEvent};
use super::keys::{CacheKey, Tag};
use super::lock::mutex_lock;
use super::mutation::MutationRecord;
use super::notifier::{Notifier, SubscriberId, Subscription};
use super::patch::PatchLedger;
use super::planner::InvalidationPlan;
use super::query::{FetchMode, InFlightRequest, SharedFetch};
use super::registry::TagIndex;
use super::store::{CacheStore, EntrySnapshot};

const SOURCE: &str = "sync::client";
const METRIC_QUERY_MISS: &str = "marketsync_query_miss_total";
const METRIC_EVICT: &str = "marketsync_evict_total";

/// Everything guarded by the state lock.
#[derive(Default)]
pub(crate) struct SyncState {
    pub store: CacheStore,
    pub tags: TagIndex,
    pub ledger: PatchLedger,
    pub notifier: Notifier,
    pub inflight: HashMap<CacheKey, InFlightRequest>,
    pub mutations: HashMap<CacheKey, MutationRecord>,
}

pub(crate) struct ClientInner {
    pub config: SyncConfig,
    pub endpoints: EndpointRegistry,
    pub journal: EventJournal,
    state: Mutex<SyncState>,
    ids: AtomicU64,
}

impl ClientInner {
    pub(crate) fn lock_state(&self, op: &'static str) -> MutexGuard<'_, SyncState> {
        mutex_lock(&self.state, SOURCE, op)
    }

    /// Process-unique id shared by requests, mutations and subscribers.
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn query(&self, name: &str) -> Result<Arc<ErasedQuery>, SyncError> {
        self.endpoints
            .query(name)
            .ok_or_else(|| SyncError::unknown_endpoint(name))
    }

    /// Drive a fetch that nobody awaits, e.g. one started by a subscription.
    pub(crate) fn spawn_fetch(&self, key: &CacheKey, fetch: SharedFetch) {
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = fetch.await;
                });
            }
            Err(_) => warn!(
                key = %key,
                "No async runtime; fetch will run on the next resolve of this key"
            ),
        }
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>, key: &CacheKey, id: SubscriberId) {
        let callback = {
            let mut state = self.lock_state("unsubscribe");
            let Some(callback) = state.notifier.remove(key, id) else {
                return;
            };

            let remaining = state.store.remove_subscriber(key);
            debug!(key = %key, subscriber = id.0, remaining, "Subscriber removed");
            if remaining == 0 {
                self.release_unused(&mut state, key);
            }
            callback
        };
        // The callback may own a Subscription; its drop re-enters the lock.
        drop(callback);
    }

    /// Evict `key`, now or after the grace period, once nothing watches it.
    pub(crate) fn release_unused(self: &Arc<Self>, state: &mut SyncState, key: &CacheKey) {
        let Some(grace) = self.config.keep_unused_data_for() else {
            self.evict_locked(state, key);
            return;
        };
        let Some(generation) = state.store.schedule_eviction(key) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(key = %key, "No async runtime for delayed eviction; evicting now");
            self.evict_locked(state, key);
            return;
        };

        debug!(key = %key, grace_ms = grace.as_millis() as u64, "Eviction scheduled");
        let client = Arc::downgrade(self);
        let key = key.clone();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(client) = client.upgrade() {
                client.evict_if_unused(&key, generation);
            }
        });
    }

    fn evict_if_unused(&self, key: &CacheKey, generation: u64) {
        let mut state = self.lock_state("evict_if_unused");
        if state.store.eviction_generation(key) == Some(generation)
            && state.store.subscriber_count(key) == 0
        {
            self.evict_locked(&mut state, key);
        }
    }

    /// Drop an entry with its tags, pending patches and in-flight request.
    pub(crate) fn evict_locked(&self, state: &mut SyncState, key: &CacheKey) {
        if !state.store.evict(key) {
            return;
        }
        state.tags.unregister(key);
        let pending_patches = state.ledger.supersede(key).len();
        let inflight_dropped = state.inflight.remove(key).is_some();

        counter!(METRIC_EVICT).increment(1);
        debug!(key = %key, pending_patches, inflight_dropped, "Cache entry evicted");
        self.journal.record(EventKind::Evicted { key: key.clone() });
    }
}

/// Handle to one synchronization cache.
#[derive(Clone)]
pub struct SyncClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl Default for SyncClient {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        let journal = EventJournal::new(config.event_journal_limit_non_zero());
        Self {
            inner: Arc::new(ClientInner {
                config,
                endpoints: EndpointRegistry::new(),
                journal,
                state: Mutex::new(SyncState::default()),
                ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.inner.endpoints
    }

    pub fn register_query<P, T>(
        &self,
        endpoint: QueryEndpoint<P, T>,
    ) -> Result<QueryHandle<P, T>, SyncError>
    where
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.inner.endpoints.register_query(endpoint)
    }

    pub fn register_mutation<A, R>(
        &self,
        endpoint: MutationEndpoint<A, R>,
    ) -> Result<MutationHandle<A, R>, SyncError>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.inner.endpoints.register_mutation(endpoint)
    }

    /// Subscribe to `handle(params)`.
    ///
    /// Creates the entry if needed and starts a fetch when it is idle, failed
    /// or stale and no request is already in flight. `callback` runs on every
    /// later change to the entry.
    pub fn subscribe<P, T, F>(
        &self,
        handle: &QueryHandle<P, T>,
        params: &P,
        callback: F,
    ) -> Result<Subscription, SyncError>
    where
        P: Serialize,
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        let query = self.inner.query(handle.name())?;
        let (key, params) = handle.locate(params)?;
        let id = SubscriberId(self.inner.next_id());

        let fetch = {
            let mut state = self.inner.lock_state("subscribe");
            state.store.ensure(&key, params);
            let subscribers = state.store.add_subscriber(&key);
            state.notifier.add(key.clone(), id, Arc::new(callback));
            debug!(key = %key, subscriber = id.0, subscribers, "Subscriber added");

            if state.store.needs_fetch(&key) && !state.inflight.contains_key(&key) {
                counter!(METRIC_QUERY_MISS).increment(1);
                Some(self.inner.start_fetch(&mut state, &query, &key))
            } else {
                None
            }
        };

        if let Some(fetch) = fetch {
            self.inner.spawn_fetch(&key, fetch);
        }
        Ok(Subscription::new(Arc::downgrade(&self.inner), key, id))
    }

    /// Current state of `handle(params)`; an Idle snapshot if nothing is cached.
    pub fn get_snapshot<P, T>(
        &self,
        handle: &QueryHandle<P, T>,
        params: &P,
    ) -> Result<EntrySnapshot, SyncError>
    where
        P: Serialize,
    {
        let key = handle.cache_key(params)?;
        Ok(self.snapshot_by_key(&key))
    }

    pub fn snapshot_by_key(&self, key: &CacheKey) -> EntrySnapshot {
        self.inner
            .lock_state("snapshot")
            .store
            .snapshot(key)
            .unwrap_or_else(|| EntrySnapshot::uninitialized(key.clone()))
    }

    /// Cached value if fresh, otherwise fetch (sharing any identical request
    /// already in flight).
    pub async fn resolve<P, T>(&self, handle: &QueryHandle<P, T>, params: &P) -> Result<T, SyncError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        self.resolve_with(handle, params, FetchMode::CacheFirst).await
    }

    /// Fetch from the server even if cached. Supersedes any request already
    /// in flight for the same key; the superseded result is not stored.
    pub async fn refetch<P, T>(&self, handle: &QueryHandle<P, T>, params: &P) -> Result<T, SyncError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        self.resolve_with(handle, params, FetchMode::Force).await
    }

    async fn resolve_with<P, T>(
        &self,
        handle: &QueryHandle<P, T>,
        params: &P,
        mode: FetchMode,
    ) -> Result<T, SyncError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let query = self.inner.query(handle.name())?;
        let (key, params) = handle.locate(params)?;
        let data = self.inner.resolve_value(query, key, params, mode).await?;
        serde_json::from_value((*data).clone()).map_err(|err| SyncError::codec(handle.name(), err))
    }

    /// Invalidate tags outside of a mutation; resolves once refetches settle.
    pub async fn invalidate_tags(&self, tags: &[Tag]) -> InvalidationPlan {
        self.inner.invalidate(tags).await
    }

    /// Events retained by the journal, oldest first.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.inner.journal.snapshot()
    }

    pub fn drain_events(&self) -> Vec<SyncEvent> {
        self.inner.journal.drain()
    }

    pub fn cached_keys(&self) -> Vec<CacheKey> {
        self.inner.lock_state("cached_keys").store.keys()
    }

    /// Drop every entry, tag, pending patch, subscription callback and event.
    /// Registered endpoints are kept.
    pub fn reset(&self) {
        let previous = {
            let mut state = self.inner.lock_state("reset");
            let previous = std::mem::take(&mut *state);
            state.store.clear();
            info!(entries = previous.store.len(), "Sync client reset");
            previous
        };
        // Dropped unlocked: subscriber callbacks may own Subscriptions.
        drop(previous);
        self.inner.journal.clear();
    }

    /// Raw cached JSON for a key, if any.
    pub fn cached_value(&self, key: &CacheKey) -> Option<Value> {
        self.inner
            .lock_state("cached_value")
            .store
            .data(key)
            .map(|data| (*data).clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::sync::error::ApiError;
    use crate::sync::keys::TagKind;

    fn counting_client(
        config: SyncConfig,
    ) -> (SyncClient, QueryHandle<(), u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let client = SyncClient::new(config);
        let handle = client
            .register_query(
                QueryEndpoint::new("counter", move |_: ()| {
                    let value = counter.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    async move { Ok::<_, ApiError>(value) }
                })
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Dashboard)]),
            )
            .expect("registers");
        (client, handle, calls)
    }

    #[tokio::test]
    async fn resolve_caches_until_invalidated() {
        let (client, handle, calls) = counting_client(SyncConfig {
            keep_unused_data_for_ms: 60_000,
            ..SyncConfig::default()
        });

        assert_eq!(client.resolve(&handle, &()).await.expect("first"), 1);
        assert_eq!(client.resolve(&handle, &()).await.expect("cached"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let plan = client.invalidate_tags(&[Tag::kind(TagKind::Dashboard)]).await;
        assert_eq!(plan.stale_only.len(), 1);
        assert!(client.get_snapshot(&handle, &()).expect("snapshot").stale);

        assert_eq!(client.resolve(&handle, &()).await.expect("refetched"), 2);
    }

    #[tokio::test]
    async fn unknown_handle_is_rejected() {
        let (_, handle, _) = counting_client(SyncConfig::default());
        let other = SyncClient::default();
        let error = other.resolve(&handle, &()).await.expect_err("not registered here");
        assert!(matches!(error, SyncError::UnknownEndpoint { .. }));
    }

    #[tokio::test]
    async fn last_unsubscribe_evicts_immediately_by_default() {
        let (client, handle, _) = counting_client(SyncConfig::default());
        let subscription = client.subscribe(&handle, &(), |_| {}).expect("subscribes");
        client.resolve(&handle, &()).await.expect("resolves");
        assert_eq!(client.cached_keys().len(), 1);

        subscription.unsubscribe();
        assert!(client.cached_keys().is_empty());
        assert!(
            client
                .events()
                .iter()
                .any(|event| matches!(event.kind, EventKind::Evicted { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_delays_eviction_and_resubscribe_cancels_it() {
        let config = SyncConfig {
            keep_unused_data_for_ms: 1_000,
            ..SyncConfig::default()
        };
        let (client, handle, calls) = counting_client(config);

        let first = client.subscribe(&handle, &(), |_| {}).expect("subscribes");
        client.resolve(&handle, &()).await.expect("resolves");
        drop(first);
        assert_eq!(client.cached_keys().len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = client.subscribe(&handle, &(), |_| {}).expect("resubscribes");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(client.cached_keys().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(second);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(client.cached_keys().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_state_but_keeps_endpoints() {
        let (client, handle, _) = counting_client(SyncConfig {
            keep_unused_data_for_ms: 60_000,
            ..SyncConfig::default()
        });
        client.resolve(&handle, &()).await.expect("resolves");
        assert_eq!(client.cached_keys().len(), 1);

        client.reset();
        assert!(client.cached_keys().is_empty());
        assert!(client.events().is_empty());
        assert_eq!(client.resolve(&handle, &()).await.expect("resolves again"), 2);
    }

    fn subscription_owning_callback(
        client: &SyncClient,
        handle: &QueryHandle<(), u32>,
    ) -> Subscription {
        let inner = client.subscribe(handle, &(), |_| {}).expect("subscribes");
        let held = Mutex::new(Some(inner));
        client
            .subscribe(handle, &(), move |_| {
                let _ = &held;
            })
            .expect("subscribes")
    }

    #[tokio::test]
    async fn dropping_a_callback_that_owns_a_subscription_does_not_deadlock() {
        let (client, handle, _) = counting_client(SyncConfig::default());
        let outer = subscription_owning_callback(&client, &handle);
        client.resolve(&handle, &()).await.expect("resolves");
        assert_eq!(client.cached_keys().len(), 1);

        drop(outer);
        assert!(client.cached_keys().is_empty());
    }

    #[tokio::test]
    async fn reset_drops_subscription_owning_callbacks_unlocked() {
        let (client, handle, _) = counting_client(SyncConfig::default());
        let _outer = subscription_owning_callback(&client, &handle);
        client.resolve(&handle, &()).await.expect("resolves");

        client.reset();
        assert!(client.cached_keys().is_empty());
        assert_eq!(client.resolve(&handle, &()).await.expect("resolves again"), 2);
    }
}
