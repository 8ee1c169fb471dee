//! Client-side synchronization layer for a marketplace storefront.
//!
//! [`sync`] holds the query/mutation cache. [`marketplace`] registers the
//! storefront endpoints against it and ships an in-memory backend used by the
//! demo binary and tests.

pub mod config;
pub mod infra;
pub mod marketplace;
pub mod sync;
