//! Optimistic patches and their rollback records.
//!
//! An optimistic edit is captured as a list of path-level changes between the
//! entry's data before and after the edit, together with a way to replay the
//! edit. The ledger keeps the data each entry held before its oldest live
//! patch; a failed mutation is undone by rebuilding from that base with the
//! surviving edits replayed, so it takes back what it wrote and nothing else.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use super::endpoint::QueryHandle;
use super::keys::CacheKey;
use super::store::CacheStore;

/// Identifies one mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// One changed location. `None` means the location did not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChange {
    pub path: Vec<PathSegment>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Path-level differences between two documents.
///
/// Objects are compared key by key and equal-length arrays index by index;
/// anything else that differs (including arrays that changed length) is
/// recorded as a whole-value replacement.
pub fn diff(before: &Value, after: &Value) -> Vec<PathChange> {
    let mut changes = Vec::new();
    diff_into(&mut Vec::new(), Some(before), Some(after), &mut changes);
    changes
}

fn diff_into(
    path: &mut Vec<PathSegment>,
    before: Option<&Value>,
    after: Option<&Value>,
    changes: &mut Vec<PathChange>,
) {
    if before == after {
        return;
    }

    match (before, after) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                path.push(PathSegment::Key(key.clone()));
                diff_into(path, old.get(key), new.get(key), changes);
                path.pop();
            }
        }
        (Some(Value::Array(old)), Some(Value::Array(new))) if old.len() == new.len() => {
            for (index, (old_item, new_item)) in old.iter().zip(new).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(path, Some(old_item), Some(new_item), changes);
                path.pop();
            }
        }
        _ => changes.push(PathChange {
            path: path.clone(),
            before: before.cloned(),
            after: after.cloned(),
        }),
    }
}

/// Value at `path`, if every segment exists.
pub fn value_at<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match (segment, node) {
        (PathSegment::Key(key), Value::Object(map)) => map.get(key),
        (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
        _ => None,
    })
}

/// Write (or with `None`, remove) the value at `path`.
///
/// Returns false when a parent along the path no longer exists.
pub fn write_at(root: &mut Value, path: &[PathSegment], value: Option<Value>) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return match value {
            Some(value) => {
                *root = value;
                true
            }
            None => false,
        };
    };

    let mut node = root;
    for segment in parents {
        let next = match (segment, node) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
            _ => None,
        };
        match next {
            Some(next) => node = next,
            None => return false,
        }
    }

    match (last, node, value) {
        (PathSegment::Key(key), Value::Object(map), Some(value)) => {
            map.insert(key.clone(), value);
            true
        }
        (PathSegment::Key(key), Value::Object(map), None) => {
            map.remove(key);
            true
        }
        (PathSegment::Index(index), Value::Array(items), Some(value)) if *index < items.len() => {
            items[*index] = value;
            true
        }
        _ => false,
    }
}

// ============================================================================
// Draft
// ============================================================================

pub(crate) struct TouchedEntry {
    pub key: CacheKey,
    pub before: Value,
    pub working: Value,
}

/// Mutable view of cached entries handed to an optimistic patch.
///
/// Edits are staged; the mutation executor diffs and commits them after the
/// patch function returns.
pub struct Draft<'a> {
    store: Option<&'a CacheStore>,
    touched: Vec<TouchedEntry>,
}

impl<'a> Draft<'a> {
    pub(crate) fn new(store: &'a CacheStore) -> Self {
        Self {
            store: Some(store),
            touched: Vec::new(),
        }
    }

    /// Draft over one entry's data with no store behind it. Edits aimed at
    /// any other entry are skipped.
    pub(crate) fn detached(key: &CacheKey, data: Value) -> Draft<'static> {
        Draft {
            store: None,
            touched: vec![TouchedEntry {
                key: key.clone(),
                before: data.clone(),
                working: data,
            }],
        }
    }

    /// Edit the cached result of `handle(params)` in place.
    ///
    /// Returns false, leaving the cache untouched, when the entry has no data
    /// yet or its payload does not decode as `T`.
    pub fn update_query<P, T, F>(&mut self, handle: &QueryHandle<P, T>, params: &P, recipe: F) -> bool
    where
        P: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        match handle.cache_key(params) {
            Ok(key) => self.update_key(&key, recipe),
            Err(err) => {
                warn!(endpoint = handle.name(), error = %err, "optimistic update skipped");
                false
            }
        }
    }

    /// Read the staged value of `handle(params)`, including edits made so far.
    pub fn read_query<P, T>(&self, handle: &QueryHandle<P, T>, params: &P) -> Option<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let key = handle.cache_key(params).ok()?;
        let staged = self.touched.iter().find(|entry| entry.key == key);
        let value = match staged {
            Some(entry) => entry.working.clone(),
            None => (*self.store?.data(&key)?).clone(),
        };
        serde_json::from_value(value).ok()
    }

    pub(crate) fn update_key<T, F>(&mut self, key: &CacheKey, recipe: F) -> bool
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let position = match self.touched.iter().position(|entry| &entry.key == key) {
            Some(position) => position,
            None => {
                let Some(current) = self.store.and_then(|store| store.data(key)) else {
                    return false;
                };
                self.touched.push(TouchedEntry {
                    key: key.clone(),
                    before: (*current).clone(),
                    working: (*current).clone(),
                });
                self.touched.len() - 1
            }
        };

        let entry = &mut self.touched[position];
        let mut typed: T = match serde_json::from_value(entry.working.clone()) {
            Ok(typed) => typed,
            Err(err) => {
                warn!(key = %key, error = %err, "optimistic update skipped: cached data did not decode");
                return false;
            }
        };
        recipe(&mut typed);
        match serde_json::to_value(&typed) {
            Ok(value) => {
                entry.working = value;
                true
            }
            Err(err) => {
                warn!(key = %key, error = %err, "optimistic update skipped: draft did not encode");
                false
            }
        }
    }

    pub(crate) fn into_touched(self) -> Vec<TouchedEntry> {
        self.touched
    }

    fn into_working(self, key: &CacheKey) -> Option<Value> {
        self.touched
            .into_iter()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.working)
    }
}

/// A mutation's optimistic edit bound to its arguments.
pub(crate) type Recipe = Arc<dyn Fn(&mut Draft<'_>) + Send + Sync>;

/// Replay of `recipe` restricted to the entry at `key`.
pub(crate) fn replay_for(key: &CacheKey, recipe: &Recipe) -> Replay {
    let key = key.clone();
    let recipe = Arc::clone(recipe);
    Arc::new(move |data: &mut Value| {
        let mut draft = Draft::detached(&key, data.clone());
        recipe(&mut draft);
        if let Some(working) = draft.into_working(&key) {
            *data = working;
        }
    })
}

// ============================================================================
// Ledger
// ============================================================================

/// Re-applies one mutation's optimistic edit to an entry's data.
pub type Replay = Arc<dyn Fn(&mut Value) + Send + Sync>;

/// Rollback record for one entry touched by one mutation invocation.
#[derive(Clone)]
pub struct PendingPatch {
    pub mutation: MutationId,
    pub key: CacheKey,
    pub changes: Vec<PathChange>,
    pub replay: Replay,
}

impl fmt::Debug for PendingPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPatch")
            .field("mutation", &self.mutation)
            .field("key", &self.key)
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

/// Result of reverting one patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevertOutcome {
    /// Paths back at their pre-patch value.
    pub restored: usize,
    /// Paths now carried by a later pending patch on an overlapping location.
    pub rebased: usize,
    /// Paths held by a confirmed patch applied after this one.
    pub conflicts: usize,
    /// The entry's data differs from what it was before the revert.
    pub changed: bool,
    /// The patch was no longer pending (confirmed write or eviction).
    pub superseded: bool,
}

impl RevertOutcome {
    pub fn superseded() -> Self {
        Self {
            superseded: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct LedgerEntry {
    /// Data the entry held before its oldest live patch.
    base: Value,
    /// Live patches in application order.
    patches: Vec<LivePatch>,
}

#[derive(Debug)]
struct LivePatch {
    patch: PendingPatch,
    committed: bool,
}

impl LedgerEntry {
    fn has_pending(&self) -> bool {
        self.patches.iter().any(|live| !live.committed)
    }

    fn rebuild(&self) -> Value {
        let mut data = self.base.clone();
        for live in &self.patches {
            (live.patch.replay)(&mut data);
        }
        data
    }

    fn overlaps(&self, path: &[PathSegment], committed: bool) -> bool {
        self.patches
            .iter()
            .filter(|live| live.committed == committed)
            .flat_map(|live| &live.patch.changes)
            .any(|change| paths_overlap(&change.path, path))
    }
}

/// One path is the other or one of its ancestors.
fn paths_overlap(a: &[PathSegment], b: &[PathSegment]) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Optimistic patches per entry, with the data they were applied on top of.
///
/// Reverting a patch rebuilds the entry from its base by replaying every
/// other live patch in order, so overlapping edits unwind correctly whether
/// they touch the same path, a parent or a child. Committed patches stay in
/// the replay until no pending patch is left on the entry.
#[derive(Debug, Default)]
pub struct PatchLedger {
    by_key: HashMap<CacheKey, LedgerEntry>,
}

impl PatchLedger {
    /// Record `patch`. `base` is the entry's data before the patch; it is kept
    /// only when no earlier patch is live on the entry.
    pub fn record(&mut self, patch: PendingPatch, base: &Value) {
        self.by_key
            .entry(patch.key.clone())
            .or_insert_with(|| LedgerEntry {
                base: base.clone(),
                patches: Vec::new(),
            })
            .patches
            .push(LivePatch {
                patch,
                committed: false,
            });
    }

    /// Mark every patch of `mutation` as confirmed. Returns the keys it had
    /// patched.
    pub fn commit(&mut self, mutation: MutationId) -> Vec<CacheKey> {
        let mut committed = Vec::new();
        self.by_key.retain(|key, entry| {
            let mut touched = false;
            for live in &mut entry.patches {
                if live.patch.mutation == mutation && !live.committed {
                    live.committed = true;
                    touched = true;
                }
            }
            if touched {
                committed.push(key.clone());
            }
            entry.has_pending()
        });
        committed
    }

    /// Drop every live patch on `key`. Called when a server-confirmed value
    /// replaces the entry or the entry is evicted; later reverts become no-ops.
    /// Returns the mutations that were still pending.
    pub fn supersede(&mut self, key: &CacheKey) -> Vec<MutationId> {
        self.by_key
            .remove(key)
            .map(|entry| {
                entry
                    .patches
                    .into_iter()
                    .filter(|live| !live.committed)
                    .map(|live| live.patch.mutation)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Undo `mutation`'s patch on `key`, rewriting `data` to the entry's base
    /// with every other live patch replayed on top.
    pub fn revert(&mut self, mutation: MutationId, key: &CacheKey, data: &mut Value) -> RevertOutcome {
        let Some(entry) = self.by_key.get_mut(key) else {
            return RevertOutcome::superseded();
        };
        let Some(position) = entry
            .patches
            .iter()
            .position(|live| live.patch.mutation == mutation && !live.committed)
        else {
            return RevertOutcome::superseded();
        };

        let reverted = entry.patches.remove(position).patch;
        let rebuilt = entry.rebuild();
        let mut outcome = RevertOutcome::default();

        for change in &reverted.changes {
            if value_at(&rebuilt, &change.path) == change.before.as_ref() {
                outcome.restored += 1;
            } else if entry.overlaps(&change.path, false) {
                outcome.rebased += 1;
            } else if entry.overlaps(&change.path, true) {
                outcome.conflicts += 1;
            } else {
                // Taken back along with an ancestor an earlier revert removed.
                outcome.restored += 1;
            }
        }

        if !entry.has_pending() {
            self.by_key.remove(key);
        }
        outcome.changed = rebuilt != *data;
        *data = rebuilt;
        outcome
    }
}
