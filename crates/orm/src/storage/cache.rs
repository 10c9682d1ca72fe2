// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
}

/// Concurrent get-or-compute cache owned by one storage node
///
/// Entries are never evicted implicitly; they live until removed or the
/// node is dropped.
#[derive(Debug)]
pub struct NodeCache<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
    stats: CacheStats,
}

impl<K: Eq + Hash, V: Clone> NodeCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.entries.get(key).map(|entry| entry.value().clone());
        if found.is_some() {
            _ = self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            _ = self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Cached value, or the one produced by `create`
    ///
    /// `create` runs without holding the shard lock. When two callers race,
    /// the first value inserted wins and both observe it.
    pub fn get_or_try_add<F>(&self, key: K, create: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = create()?;
        let entry = self.entries.entry(key).or_insert_with(|| {
            _ = self.stats.inserts.fetch_add(1, Ordering::Relaxed);
            value
        });
        Ok(entry.value().clone())
    }

    /// Insert `add()` when absent, otherwise apply `update` in place
    pub fn add_or_update<A, U>(&self, key: K, add: A, update: U) -> V
    where
        A: FnOnce() -> V,
        U: FnOnce(&mut V),
    {
        let mut entry = self.entries.entry(key).or_insert_with(|| {
            _ = self.stats.inserts.fetch_add(1, Ordering::Relaxed);
            add()
        });
        update(entry.value_mut());
        entry.value().clone()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            _ = self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Keep only entries matching `keep`, returning how many were removed
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, value| keep(key, value));
        let removed = before.saturating_sub(self.entries.len());
        _ = self
            .stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let removed = self.entries.len();
        self.entries.clear();
        _ = self
            .stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl<K: Eq + Hash, V: Clone> Default for NodeCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
