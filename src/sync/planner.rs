//! Invalidation planning.
//!
//! Turns a set of invalidated tags into a deduplicated plan: subscribed
//! entries to refetch now, and unsubscribed entries that are only marked
//! stale until someone subscribes again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{info, warn};

use super::client::ClientInner;
use super::events::EventKind;
use super::keys::{CacheKey, Tag};
use super::registry::TagIndex;
use super::store::CacheStore;

const METRIC_INVALIDATION_REFETCH: &str = "marketsync_invalidation_refetch_total";
const METRIC_INVALIDATION_STALE: &str = "marketsync_invalidation_stale_total";
const METRIC_INVALIDATION_MS: &str = "marketsync_invalidation_ms";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Invalidated tags, duplicates removed, in request order.
    pub tags: Vec<Tag>,
    /// Entries with subscribers; refetched immediately.
    pub refetch: BTreeSet<CacheKey>,
    /// Entries without subscribers (or with refetching disabled).
    pub stale_only: BTreeSet<CacheKey>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self.tags.iter().map(Tag::to_string).collect();
        write!(
            f,
            "InvalidationPlan {{ tags: [{}], refetch: {}, stale_only: {} }}",
            tags.join(", "),
            self.refetch.len(),
            self.stale_only.len(),
        )
    }
}

impl InvalidationPlan {
    pub fn build(tags: &[Tag], index: &TagIndex, store: &CacheStore, refetch_subscribed: bool) -> Self {
        let mut plan = Self::default();
        for tag in tags {
            if !plan.tags.contains(tag) {
                plan.tags.push(tag.clone());
            }
        }

        for key in index.fan_out(&plan.tags) {
            if refetch_subscribed && store.subscriber_count(&key) > 0 {
                plan.refetch.insert(key);
            } else {
                plan.stale_only.insert(key);
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.refetch.is_empty() && self.stale_only.is_empty()
    }

    /// Every affected entry.
    pub fn affected(&self) -> impl Iterator<Item = &CacheKey> {
        self.refetch.iter().chain(&self.stale_only)
    }
}

impl ClientInner {
    /// Mark every entry reached by `tags` stale and refetch the subscribed
    /// ones. Resolves once all refetches have settled.
    pub(crate) async fn invalidate(self: &Arc<Self>, tags: &[Tag]) -> InvalidationPlan {
        let started_at = Instant::now();

        let (plan, fetches) = {
            let mut state = self.lock_state("invalidate");
            let plan = InvalidationPlan::build(
                tags,
                &state.tags,
                &state.store,
                self.config.refetch_on_invalidate,
            );

            for key in plan.affected() {
                state.store.mark_stale(key);
            }
            for key in &plan.stale_only {
                self.journal
                    .record(EventKind::StaleWithoutSubscriber { key: key.clone() });
            }

            let mut fetches = Vec::with_capacity(plan.refetch.len());
            for key in &plan.refetch {
                match self.endpoints.query(key.endpoint()) {
                    Some(query) => fetches.push(self.start_fetch(&mut state, &query, key)),
                    None => warn!(key = %key, "Invalidated entry has no registered query"),
                }
            }
            (plan, fetches)
        };

        counter!(METRIC_INVALIDATION_REFETCH).increment(plan.refetch.len() as u64);
        counter!(METRIC_INVALIDATION_STALE).increment(plan.stale_only.len() as u64);
        info!(plan = %plan, "Tags invalidated");
        self.journal.record(EventKind::TagsInvalidated {
            tags: plan.tags.clone(),
            refetched: plan.refetch.len(),
            stale_only: plan.stale_only.len(),
        });

        // Failures are already recorded on the entries.
        join_all(fetches).await;

        histogram!(METRIC_INVALIDATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        plan
    }
}
