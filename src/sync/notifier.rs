//! Subscription notifier.
//!
//! Callbacks are collected while the sync state is locked and invoked only
//! after it is released, so a callback may freely call back into the client.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use super::client::ClientInner;
use super::keys::CacheKey;
use super::store::{CacheStore, EntrySnapshot};

/// Callback invoked with an immutable snapshot whenever an entry changes.
pub type SubscriberCallback = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

#[derive(Default)]
pub struct Notifier {
    subscribers: HashMap<CacheKey, BTreeMap<SubscriberId, SubscriberCallback>>,
}

impl Notifier {
    pub fn add(&mut self, key: CacheKey, id: SubscriberId, callback: SubscriberCallback) {
        self.subscribers.entry(key).or_default().insert(id, callback);
    }

    /// Remove one subscriber and hand back its callback, `None` when it was
    /// already gone. The caller drops the callback after releasing the state
    /// lock, since it may own a `Subscription`.
    pub fn remove(&mut self, key: &CacheKey, id: SubscriberId) -> Option<SubscriberCallback> {
        let callbacks = self.subscribers.get_mut(key)?;
        let removed = callbacks.remove(&id);
        if callbacks.is_empty() {
            self.subscribers.remove(key);
        }
        removed
    }

    /// Callbacks for `key` in subscription order.
    pub fn callbacks(&self, key: &CacheKey) -> Vec<SubscriberCallback> {
        self.subscribers
            .get(key)
            .map(|callbacks| callbacks.values().cloned().collect())
            .unwrap_or_default()
    }
}

struct PendingNotification {
    snapshot: EntrySnapshot,
    callbacks: Vec<SubscriberCallback>,
}

/// Notifications gathered under the state lock, to be dispatched after it is
/// released. Each key is notified once with its latest snapshot.
#[must_use = "notifications do nothing until dispatched"]
#[derive(Default)]
pub struct Notifications {
    pending: Vec<PendingNotification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, notifier: &Notifier, store: &CacheStore, key: &CacheKey) {
        let callbacks = notifier.callbacks(key);
        if callbacks.is_empty() {
            return;
        }
        let Some(snapshot) = store.snapshot(key) else {
            return;
        };

        let notification = PendingNotification {
            snapshot,
            callbacks,
        };
        match self
            .pending
            .iter_mut()
            .find(|pending| &pending.snapshot.key == key)
        {
            Some(existing) => *existing = notification,
            None => self.pending.push(notification),
        }
    }

    pub fn dispatch(self) {
        for notification in self.pending {
            for callback in &notification.callbacks {
                callback(&notification.snapshot);
            }
        }
    }
}

/// Live subscription to one cache entry.
///
/// Dropping the subscription unsubscribes. When the last subscriber of an
/// entry leaves, the entry is evicted (immediately or after the configured
/// grace period).
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    client: Weak<ClientInner>,
    key: CacheKey,
    id: SubscriberId,
}

impl Subscription {
    pub(crate) fn new(client: Weak<ClientInner>, key: CacheKey, id: SubscriberId) -> Self {
        Self { client, key, id }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Unsubscribe now. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.unsubscribe(&self.key, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
