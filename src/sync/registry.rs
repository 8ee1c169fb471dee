//! Bidirectional tag index.
//!
//! Tracks tag → cache keys and cache key → tags so that invalidation can find
//! every entry a write affects, and eviction can drop an entry's tags cheaply.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::keys::{CacheKey, Tag};

#[derive(Debug, Default)]
pub struct TagIndex {
    /// Provided tag to every entry that provided it.
    tag_to_keys: HashMap<Tag, HashSet<CacheKey>>,
    /// Entry to the tags fixed at its first resolution.
    key_to_tags: HashMap<CacheKey, BTreeSet<Tag>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tags an entry provides. Replaces any earlier registration.
    pub fn register(&mut self, key: CacheKey, tags: BTreeSet<Tag>) {
        self.unregister(&key);
        if tags.is_empty() {
            return;
        }
        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.key_to_tags.insert(key, tags);
    }

    /// Entries affected by invalidating `tag`.
    ///
    /// A tag without an id reaches every entry that provided a tag of the same
    /// kind, with or without id.
    pub fn lookup(&self, tag: &Tag) -> BTreeSet<CacheKey> {
        if tag.id.is_some() {
            return self
                .tag_to_keys
                .get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default();
        }

        self.tag_to_keys
            .iter()
            .filter(|(provided, _)| tag.matches(provided))
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Deduplicated union of `lookup` over all tags.
    pub fn fan_out(&self, tags: &[Tag]) -> BTreeSet<CacheKey> {
        tags.iter().flat_map(|tag| self.lookup(tag)).collect()
    }

    pub fn tags_for_key(&self, key: &CacheKey) -> BTreeSet<Tag> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    /// Remove an entry and clean up its tag mappings.
    pub fn unregister(&mut self, key: &CacheKey) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::keys::TagKind;

    fn tags(items: &[Tag]) -> BTreeSet<Tag> {
        items.iter().cloned().collect()
    }

    #[test]
    fn register_and_lookup() {
        let mut index = TagIndex::new();
        let key = CacheKey::new("cart", "");
        index.register(key.clone(), tags(&[Tag::kind(TagKind::Cart)]));

        assert!(index.lookup(&Tag::kind(TagKind::Cart)).contains(&key));
        assert!(index.tags_for_key(&key).contains(&Tag::kind(TagKind::Cart)));
    }

    #[test]
    fn family_tag_reaches_id_tags() {
        let mut index = TagIndex::new();
        let list = CacheKey::new("orders", "");
        let detail = CacheKey::new("order", "ord-1");
        index.register(list.clone(), tags(&[Tag::kind(TagKind::Orders)]));
        index.register(detail.clone(), tags(&[Tag::with_id(TagKind::Orders, "ord-1")]));

        let affected = index.lookup(&Tag::kind(TagKind::Orders));
        assert_eq!(affected.len(), 2);

        let only_detail = index.lookup(&Tag::with_id(TagKind::Orders, "ord-1"));
        assert_eq!(only_detail.into_iter().collect::<Vec<_>>(), vec![detail]);

        assert!(index.lookup(&Tag::with_id(TagKind::Orders, "ord-2")).is_empty());
    }

    #[test]
    fn fan_out_deduplicates() {
        let mut index = TagIndex::new();
        let dashboard = CacheKey::new("dashboard", "");
        index.register(
            dashboard.clone(),
            tags(&[Tag::kind(TagKind::Orders), Tag::kind(TagKind::Dashboard)]),
        );

        let affected = index.fan_out(&[Tag::kind(TagKind::Orders), Tag::kind(TagKind::Dashboard)]);
        assert_eq!(affected.len(), 1);
        assert!(affected.contains(&dashboard));
    }

    #[test]
    fn unregister_cleans_up_mappings() {
        let mut index = TagIndex::new();
        let key = CacheKey::new("wishlist", "");
        index.register(key.clone(), tags(&[Tag::kind(TagKind::Wishlist)]));
        assert_eq!(index.key_count(), 1);
        assert_eq!(index.tag_count(), 1);

        index.unregister(&key);
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
        assert!(index.lookup(&Tag::kind(TagKind::Wishlist)).is_empty());
    }

    #[test]
    fn shared_tag_survives_partial_unregister() {
        let mut index = TagIndex::new();
        let first = CacheKey::new("products", "page=1");
        let second = CacheKey::new("products", "page=2");
        index.register(first.clone(), tags(&[Tag::kind(TagKind::Products)]));
        index.register(second.clone(), tags(&[Tag::kind(TagKind::Products)]));

        index.unregister(&first);
        let remaining = index.lookup(&Tag::kind(TagKind::Products));
        assert_eq!(remaining.into_iter().collect::<Vec<_>>(), vec![second]);
    }

    #[test]
    fn clear_removes_all_mappings() {
        let mut index = TagIndex::new();
        index.register(CacheKey::new("cart", ""), tags(&[Tag::kind(TagKind::Cart)]));
        index.clear();
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
    }
}
