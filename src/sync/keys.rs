//! Cache key and tag definitions.
//!
//! `CacheKey` identifies one cached read; `Tag` labels the data a read depends
//! on so that writes can find the reads they affect.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource families a cached read can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagKind {
    Cart,
    Wishlist,
    Orders,
    Notifications,
    Products,
    Services,
    Reviews,
    /// Aggregated counters shown on account dashboards.
    Dashboard,
}

impl TagKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TagKind::Cart => "Cart",
            TagKind::Wishlist => "Wishlist",
            TagKind::Orders => "Orders",
            TagKind::Notifications => "Notifications",
            TagKind::Products => "Products",
            TagKind::Services => "Services",
            TagKind::Reviews => "Reviews",
            TagKind::Dashboard => "Dashboard",
        }
    }
}

/// Dependency label connecting mutations to the reads they can invalidate.
///
/// A tag without an id stands for the whole resource family. When used for
/// invalidation it matches every provided tag of the same kind; a tag with an
/// id matches only the identical provided tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub kind: TagKind,
    pub id: Option<String>,
}

impl Tag {
    pub fn kind(kind: TagKind) -> Self {
        Self { kind, id: None }
    }

    pub fn with_id(kind: TagKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
        }
    }

    /// Whether invalidating `self` affects an entry that provided `provided`.
    pub fn matches(&self, provided: &Tag) -> bool {
        self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
    }
}

impl From<TagKind> for Tag {
    fn from(kind: TagKind) -> Self {
        Tag::kind(kind)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// Identity of one cached read: endpoint name plus serialized parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: Arc<str>,
    params: Arc<str>,
}

impl CacheKey {
    pub fn new(endpoint: &str, params: impl Into<String>) -> Self {
        Self {
            endpoint: Arc::from(endpoint),
            params: Arc::from(params.into()),
        }
    }

    /// Derive a key from JSON parameters using the canonical encoding.
    pub fn from_params(endpoint: &str, params: &Value) -> Self {
        Self::new(endpoint, canonical_params(params))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &str {
        &self.params
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.endpoint, self.params)
    }
}

/// Canonical text form of query parameters.
///
/// Object keys are emitted in sorted order regardless of how the map was
/// built. `null` (unit parameters) encodes as the empty string and a bare
/// string encodes without quotes.
pub fn canonical_params(params: &Value) -> String {
    match params {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
