//! Concurrent map from correlation key to live aggregation group.
//!
//! Backed by a sharded `DashMap`, so get-or-create for one key never
//! serializes behind work on an unrelated key.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::group::AggregationGroup;

/// Live aggregation groups keyed by correlation key.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DashMap<String, Arc<AggregationGroup>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    /// Return the group for `key`, creating it with `make` if absent.
    ///
    /// Atomic per key: concurrent callers for the same key all observe the
    /// same group and exactly one of them sees `created == true`. `make`
    /// runs while the key's shard is locked and must not touch the registry.
    pub fn get_or_create<F>(&self, key: &str, make: F) -> (Arc<AggregationGroup>, bool)
    where
        F: FnOnce() -> AggregationGroup,
    {
        if let Some(existing) = self.groups.get(key) {
            return (existing.value().clone(), false);
        }

        match self.groups.entry(key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let group = Arc::new(make());
                e.insert(group.clone());
                (group, true)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<AggregationGroup>> {
        self.groups.get(key).map(|g| g.value().clone())
    }

    /// Evict `key` only if it still maps to the group with `group_id`.
    ///
    /// A newer group that reused the key is left in place.
    pub fn remove(&self, key: &str, group_id: u64) -> bool {
        self.groups
            .remove_if(key, |_, group| group.id() == group_id)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    pub fn groups(&self) -> Vec<Arc<AggregationGroup>> {
        self.groups.iter().map(|e| e.value().clone()).collect()
    }
}
