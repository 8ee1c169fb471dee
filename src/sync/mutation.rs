//! Mutation executor.
//!
//! A mutation runs its optimistic patch against the cache, awaits the server,
//! then either commits (and invalidates tags) or reverts exactly the paths its
//! own patch changed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::{ClientInner, SyncClient, SyncState};
use super::endpoint::MutationHandle;
use super::error::{ApiError, SyncError};
use super::events::{ConflictReason, EventKind};
use super::keys::CacheKey;
use super::notifier::Notifications;
use super::patch::{Draft, MutationId, PendingPatch, Recipe, TouchedEntry, diff, replay_for};

const METRIC_MUTATION: &str = "marketsync_mutation_total";
const METRIC_MUTATION_MS: &str = "marketsync_mutation_ms";
const METRIC_PATCH_REVERT: &str = "marketsync_patch_revert_total";
const METRIC_PATCH_CONFLICT: &str = "marketsync_patch_conflict_total";

/// Settled invocation records kept for `mutation_status`.
const SETTLED_RECORD_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// Latest invocation of a mutation tracked under its key.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub mutation: MutationId,
    pub status: MutationStatus,
    pub error: Option<ApiError>,
}

impl SyncClient {
    /// Run a mutation.
    ///
    /// Resolves after the server answered and, on success, after every
    /// refetch triggered by its invalidated tags has settled.
    pub async fn mutate<A, R>(&self, handle: &MutationHandle<A, R>, args: A) -> Result<R, SyncError>
    where
        A: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        let inner = &self.inner;
        let endpoint = handle.endpoint();
        if !inner.endpoints.has_mutation(handle.name()) {
            return Err(SyncError::unknown_endpoint(handle.name()));
        }
        let mutation = MutationId(inner.next_id());
        let tracking = endpoint.tracking_key(&args);
        let started_at = Instant::now();

        let (touched, notifications) = {
            let mut state = inner.lock_state("mutate.start");
            if let Some(key) = &tracking {
                state.mutations.insert(
                    key.clone(),
                    MutationRecord {
                        mutation,
                        status: MutationStatus::Pending,
                        error: None,
                    },
                );
            }

            let mut notifications = Notifications::new();
            let touched = match &endpoint.optimistic {
                Some(optimistic) => {
                    let optimistic = Arc::clone(optimistic);
                    let recipe_args = args.clone();
                    let recipe: Recipe =
                        Arc::new(move |draft: &mut Draft<'_>| optimistic(&recipe_args, draft));
                    inner.apply_optimistic(&mut state, mutation, &recipe, &mut notifications)
                }
                None => Vec::new(),
            };
            (touched, notifications)
        };
        notifications.dispatch();

        debug!(
            endpoint = %endpoint.name,
            mutation = %mutation,
            patched = touched.len(),
            "Mutation started"
        );

        match (endpoint.mutate)(args.clone()).await {
            Ok(result) => {
                {
                    let mut state = inner.lock_state("mutate.commit");
                    for key in state.ledger.commit(mutation) {
                        inner
                            .journal
                            .record(EventKind::PatchCommitted { mutation, key });
                    }
                    settle(&mut state, tracking.as_ref(), mutation, MutationStatus::Fulfilled, None);
                }

                let tags = (endpoint.invalidates)(Some(&result), None, &args);
                if !tags.is_empty() {
                    inner.invalidate(&tags).await;
                }

                record_settled(inner, &endpoint.name, mutation, true, started_at);
                info!(
                    endpoint = %endpoint.name,
                    mutation = %mutation,
                    invalidated = tags.len(),
                    "Mutation succeeded"
                );
                Ok(result)
            }
            Err(source) => {
                let notifications = {
                    let mut state = inner.lock_state("mutate.rollback");
                    let mut notifications = Notifications::new();
                    inner.rollback(&mut state, mutation, &touched, &mut notifications);
                    settle(
                        &mut state,
                        tracking.as_ref(),
                        mutation,
                        MutationStatus::Rejected,
                        Some(source.clone()),
                    );
                    notifications
                };
                notifications.dispatch();

                let tags = (endpoint.invalidates)(None, Some(&source), &args);
                if !tags.is_empty() {
                    inner.invalidate(&tags).await;
                }

                record_settled(inner, &endpoint.name, mutation, false, started_at);
                warn!(
                    endpoint = %endpoint.name,
                    mutation = %mutation,
                    error = %source,
                    reverted = touched.len(),
                    "Mutation rejected"
                );
                Err(SyncError::rejected(&endpoint.name, source))
            }
        }
    }

    /// Status of the latest invocation tracked under the key `args` maps to.
    /// `None` when the mutation has no key function or never ran with it.
    pub fn mutation_status<A, R>(&self, handle: &MutationHandle<A, R>, args: &A) -> Option<MutationRecord>
    where
        A: Send + Sync + 'static,
        R: Send + 'static,
    {
        let key = handle.endpoint().tracking_key(args)?;
        self.inner
            .lock_state("mutation_status")
            .mutations
            .get(&key)
            .cloned()
    }
}

impl ClientInner {
    /// Run `recipe` against a draft and commit its edits, recording one
    /// pending patch per changed entry. Returns the patched keys.
    pub(crate) fn apply_optimistic(
        &self,
        state: &mut SyncState,
        mutation: MutationId,
        recipe: &Recipe,
        notifications: &mut Notifications,
    ) -> Vec<CacheKey> {
        let touched = {
            let mut draft = Draft::new(&state.store);
            recipe(&mut draft);
            draft.into_touched()
        };

        let mut patched = Vec::with_capacity(touched.len());
        for TouchedEntry {
            key,
            before,
            working,
        } in touched
        {
            let changes = diff(&before, &working);
            if changes.is_empty() {
                continue;
            }

            let paths = changes.len();
            state.ledger.record(
                PendingPatch {
                    mutation,
                    key: key.clone(),
                    changes,
                    replay: replay_for(&key, recipe),
                },
                &before,
            );
            let Some(version) = state.store.write_data(&key, working) else {
                continue;
            };

            debug!(mutation = %mutation, key = %key, version, paths, "Optimistic patch applied");
            self.journal.record(EventKind::PatchApplied {
                mutation,
                key: key.clone(),
                version,
            });
            notifications.queue(&state.notifier, &state.store, &key);
            patched.push(key);
        }
        patched
    }

    /// Undo every still-pending patch of `mutation` by rebuilding each entry
    /// from the ledger.
    pub(crate) fn rollback(
        &self,
        state: &mut SyncState,
        mutation: MutationId,
        touched: &[CacheKey],
        notifications: &mut Notifications,
    ) {
        for key in touched {
            let mut data = state
                .store
                .data(key)
                .map(|data| (*data).clone())
                .unwrap_or(Value::Null);
            let outcome = state.ledger.revert(mutation, key, &mut data);

            if outcome.superseded {
                counter!(METRIC_PATCH_CONFLICT).increment(1);
                debug!(mutation = %mutation, key = %key, "Revert skipped: patch superseded");
                self.journal.record(EventKind::PatchConflict {
                    mutation,
                    key: key.clone(),
                    reason: ConflictReason::Superseded,
                });
                continue;
            }

            if outcome.changed && state.store.write_data(key, data).is_some() {
                counter!(METRIC_PATCH_REVERT).increment(1);
                notifications.queue(&state.notifier, &state.store, key);
            }
            debug!(
                mutation = %mutation,
                key = %key,
                restored = outcome.restored,
                rebased = outcome.rebased,
                "Optimistic patch reverted"
            );
            self.journal.record(EventKind::PatchReverted {
                mutation,
                key: key.clone(),
                restored: outcome.restored,
                rebased: outcome.rebased,
            });

            if outcome.conflicts > 0 {
                counter!(METRIC_PATCH_CONFLICT).increment(1);
                warn!(
                    mutation = %mutation,
                    key = %key,
                    paths = outcome.conflicts,
                    "Revert left paths that were written after the patch"
                );
                self.journal.record(EventKind::PatchConflict {
                    mutation,
                    key: key.clone(),
                    reason: ConflictReason::Overwritten {
                        paths: outcome.conflicts,
                    },
                });
            }
        }
    }
}

/// Update the tracked status unless a newer invocation took the key over.
fn settle(
    state: &mut SyncState,
    key: Option<&CacheKey>,
    mutation: MutationId,
    status: MutationStatus,
    error: Option<ApiError>,
) {
    let Some(key) = key else {
        return;
    };
    match state.mutations.get_mut(key) {
        Some(record) if record.mutation == mutation => {
            record.status = status;
            record.error = error;
        }
        _ => debug!(key = %key, mutation = %mutation, "Older invocation settled; status kept"),
    }
    prune_settled(&mut state.mutations);
}

/// Drop the oldest settled records beyond the retention limit. Pending ones
/// are always kept.
fn prune_settled(records: &mut HashMap<CacheKey, MutationRecord>) {
    let excess = records.len().saturating_sub(SETTLED_RECORD_LIMIT);
    if excess == 0 {
        return;
    }
    let mut settled: Vec<(MutationId, CacheKey)> = records
        .iter()
        .filter(|(_, record)| record.status != MutationStatus::Pending)
        .map(|(key, record)| (record.mutation, key.clone()))
        .collect();
    settled.sort_unstable();
    for (_, key) in settled.into_iter().take(excess) {
        records.remove(&key);
    }
}

fn record_settled(
    inner: &ClientInner,
    endpoint: &str,
    mutation: MutationId,
    succeeded: bool,
    started_at: Instant,
) {
    let outcome = if succeeded { "success" } else { "failure" };
    counter!(METRIC_MUTATION, "outcome" => outcome).increment(1);
    histogram!(METRIC_MUTATION_MS, "outcome" => outcome)
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
    inner.journal.record(EventKind::MutationSettled {
        mutation,
        endpoint: endpoint.to_string(),
        succeeded,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::sync::config::SyncConfig;
    use crate::sync::endpoint::{MutationEndpoint, QueryEndpoint, QueryHandle};
    use crate::sync::keys::{Tag, TagKind};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    fn client_with_counter() -> (SyncClient, QueryHandle<(), Counter>) {
        let client = SyncClient::new(SyncConfig {
            keep_unused_data_for_ms: 60_000,
            ..SyncConfig::default()
        });
        let handle = client
            .register_query(
                QueryEndpoint::new("counter", |_: ()| async {
                    Ok::<_, ApiError>(Counter { value: 10 })
                })
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Dashboard)]),
            )
            .expect("registers");
        (client, handle)
    }

    #[tokio::test]
    async fn rejected_mutation_restores_snapshot() {
        let (client, counter) = client_with_counter();
        client.resolve(&counter, &()).await.expect("resolves");

        let patch_target = counter.clone();
        let bump = client
            .register_mutation(
                MutationEndpoint::new("bump", |_: i64| async {
                    Err::<(), _>(ApiError::conflict("nope"))
                })
                .optimistic(move |by, draft| {
                    draft.update_query(&patch_target, &(), |counter: &mut Counter| {
                        counter.value += *by;
                    });
                }),
            )
            .expect("registers");

        let error = client.mutate(&bump, 5).await.expect_err("rejected");
        assert!(matches!(error, SyncError::MutationRejected { .. }));

        let snapshot = client.get_snapshot(&counter, &()).expect("snapshot");
        assert_eq!(snapshot.decode::<Counter>().expect("decodes"), Some(Counter { value: 10 }));
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.confirmed_version, 1);
    }

    #[tokio::test]
    async fn successful_mutation_invalidates_tags() {
        let (client, counter) = client_with_counter();
        let _subscription = client.subscribe(&counter, &(), |_| {}).expect("subscribes");
        client.resolve(&counter, &()).await.expect("resolves");

        let save = client
            .register_mutation(
                MutationEndpoint::new("save", |_: ()| async { Ok::<_, ApiError>(()) })
                    .invalidates_tags(|_, _, _| vec![Tag::kind(TagKind::Dashboard)]),
            )
            .expect("registers");

        client.mutate(&save, ()).await.expect("succeeds");
        let snapshot = client.get_snapshot(&counter, &()).expect("snapshot");
        assert!(!snapshot.stale);
        assert_eq!(snapshot.confirmed_version, 2);
    }

    #[tokio::test]
    async fn failure_invalidation_runs_with_error() {
        let (client, counter) = client_with_counter();
        client.resolve(&counter, &()).await.expect("resolves");

        let saw_error = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_error);
        let save = client
            .register_mutation(
                MutationEndpoint::new("save", |_: ()| async {
                    Err::<(), _>(ApiError::network("offline"))
                })
                .invalidates_tags(move |result, error, _| {
                    assert!(result.is_none());
                    flag.store(error.is_some_and(ApiError::is_network), Ordering::SeqCst);
                    vec![Tag::kind(TagKind::Dashboard)]
                }),
            )
            .expect("registers");

        client.mutate(&save, ()).await.expect_err("rejected");
        assert!(saw_error.load(Ordering::SeqCst));
        assert!(client.get_snapshot(&counter, &()).expect("snapshot").stale);
    }

    #[tokio::test]
    async fn keyed_mutation_tracks_latest_status() {
        let client = SyncClient::new(SyncConfig::default());
        let mark = client
            .register_mutation(
                MutationEndpoint::new("mark_read", |id: String| async move {
                    if id == "missing" {
                        Err(ApiError::not_found("no such notification"))
                    } else {
                        Ok(())
                    }
                })
                .key_with(|id: &String| id.clone()),
            )
            .expect("registers");

        assert!(client.mutation_status(&mark, &"n-1".to_string()).is_none());
        client.mutate(&mark, "n-1".to_string()).await.expect("succeeds");
        client
            .mutate(&mark, "missing".to_string())
            .await
            .expect_err("rejected");

        let ok = client
            .mutation_status(&mark, &"n-1".to_string())
            .expect("tracked");
        assert_eq!(ok.status, MutationStatus::Fulfilled);

        let failed = client
            .mutation_status(&mark, &"missing".to_string())
            .expect("tracked");
        assert_eq!(failed.status, MutationStatus::Rejected);
        assert_eq!(failed.error.and_then(|error| error.status_code()), Some(404));
    }

    #[tokio::test]
    async fn settled_records_are_bounded() {
        let client = SyncClient::new(SyncConfig::default());
        let touch = client
            .register_mutation(
                MutationEndpoint::new("touch", |_: u32| async { Ok::<_, ApiError>(()) })
                    .key_with(|id: &u32| id.to_string()),
            )
            .expect("registers");

        let total = SETTLED_RECORD_LIMIT as u32 + 10;
        for id in 0..total {
            client.mutate(&touch, id).await.expect("succeeds");
        }

        assert!(client.mutation_status(&touch, &0).is_none(), "oldest pruned");
        let latest = client.mutation_status(&touch, &(total - 1)).expect("tracked");
        assert_eq!(latest.status, MutationStatus::Fulfilled);
        assert_eq!(
            client.inner.lock_state("test").mutations.len(),
            SETTLED_RECORD_LIMIT
        );
    }

    #[tokio::test]
    async fn mutation_from_another_client_is_rejected() {
        let home = SyncClient::default();
        let save = home
            .register_mutation(MutationEndpoint::new("save", |_: ()| async {
                Ok::<_, ApiError>(())
            }))
            .expect("registers");

        let other = SyncClient::default();
        let error = other.mutate(&save, ()).await.expect_err("not registered here");
        assert!(matches!(error, SyncError::UnknownEndpoint { .. }));
    }

    #[tokio::test]
    async fn overlapping_failures_rebuild_from_the_confirmed_value() {
        let (client, counter) = client_with_counter();
        client.resolve(&counter, &()).await.expect("resolves");

        let patch_target = counter.clone();
        let set = client
            .register_mutation(
                MutationEndpoint::new("set", |(_, delay): (i64, u64)| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    Err::<(), _>(ApiError::status(500, "rejected"))
                })
                .optimistic(move |(value, _): &(i64, u64), draft| {
                    draft.update_query(&patch_target, &(), |counter: &mut Counter| {
                        counter.value = *value;
                    });
                }),
            )
            .expect("registers");

        let (first, second) = tokio::join!(client.mutate(&set, (20, 30)), client.mutate(&set, (30, 10)));
        assert!(first.is_err() && second.is_err());

        let snapshot = client.get_snapshot(&counter, &()).expect("snapshot");
        assert_eq!(snapshot.decode::<Counter>().expect("decodes"), Some(Counter { value: 10 }));
    }
}
