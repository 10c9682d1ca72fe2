// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{OrmError, Result};
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key of a compiled query
///
/// `node_id` is `None` when compiled queries are shared by all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledQueryKey {
    pub query: String,
    pub node_id: Option<String>,
}

impl CompiledQueryKey {
    pub fn new(query: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            query: query.into(),
            node_id,
        }
    }
}

/// Domain-wide cache of translated queries, shared by every node
#[derive(Debug, Default)]
pub struct CompiledQueryCache {
    entries: DashMap<CompiledQueryKey, Arc<dyn Any + Send + Sync>>,
    key_scans: AtomicU64,
}

impl CompiledQueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry for `key`, or the one produced by `create`
    pub fn get_or_add<T, F>(&self, key: CompiledQueryKey, create: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        let query = key.query.clone();
        let entry = match self.entries.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                let created: Arc<dyn Any + Send + Sync> = Arc::new(create()?);
                self.entries.entry(key).or_insert(created).value().clone()
            }
        };
        entry
            .downcast::<T>()
            .map_err(|_| OrmError::QueryCacheTypeMismatch(query))
    }

    /// Drop every entry compiled for `node_id`, returning how many were removed
    pub fn remove_node_entries(&self, node_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            _ = self.key_scans.fetch_add(1, Ordering::Relaxed);
            key.node_id.as_deref() != Some(node_id)
        });
        let removed = before.saturating_sub(self.entries.len());
        diagnostics::debug!("Purged {removed} compiled queries for node '{node_id}'");
        removed
    }

    /// Keys inspected by purges so far
    #[must_use]
    pub fn key_scans(&self) -> u64 {
        self.key_scans.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
