//! Client-side query/mutation cache.
//!
//! Keeps marketplace views consistent with the server:
//!
//! - **Queries** are cached per endpoint + parameters. Concurrent identical
//!   reads share one request.
//! - **Mutations** may patch cached data optimistically. A rejected mutation
//!   reverts exactly the paths its own patch changed; an accepted one
//!   invalidates the tags it names, which refetches every subscribed read
//!   that provided them.
//! - **Subscriptions** keep entries alive and receive a snapshot on every
//!   change. Entries are evicted once the last subscriber leaves.
//!
//! ## Configuration
//!
//! Behavior is controlled by the `[sync]` table of `marketsync.toml`:
//!
//! ```toml
//! [sync]
//! keep_unused_data_for_ms = 0
//! refetch_on_invalidate = true
//! event_journal_limit = 256
//! ```

mod client;
mod config;
mod endpoint;
mod error;
mod events;
mod keys;
pub(crate) mod lock;
mod mutation;
mod notifier;
mod patch;
mod planner;
mod query;
mod registry;
mod store;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use endpoint::{
    ApiFuture, EndpointRegistry, MutationEndpoint, MutationHandle, MutationInfo, QueryEndpoint,
    QueryHandle,
};
pub use error::{ApiError, SyncError};
pub use events::{ConflictReason, Epoch, EventJournal, EventKind, SyncEvent};
pub use keys::{CacheKey, Tag, TagKind, canonical_params};
pub use mutation::{MutationRecord, MutationStatus};
pub use notifier::{SubscriberCallback, SubscriberId, Subscription};
pub use patch::{Draft, MutationId, PathChange, PathSegment, diff};
pub use planner::InvalidationPlan;
pub use store::{EntrySnapshot, QueryStatus};
