// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::OperationOutcome;
use crate::key::Key;
use crate::session::Session;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Keys collected while preparing operations for execution
#[derive(Debug, Default)]
pub struct PrepareContext {
    keys_to_prefetch: BTreeSet<Key>,
    new_keys: BTreeSet<Key>,
}

impl PrepareContext {
    /// Key of an entity that must exist before execution
    ///
    /// Placeholder keys and keys created by earlier operations never reach
    /// storage, so they are not prefetched.
    pub fn register_key_to_prefetch(&mut self, key: &Key) {
        if key.is_temporary() || self.new_keys.contains(key) {
            return;
        }
        _ = self.keys_to_prefetch.insert(key.clone());
    }

    pub fn register_new_key(&mut self, key: &Key) {
        _ = self.keys_to_prefetch.remove(key);
        _ = self.new_keys.insert(key.clone());
    }

    #[must_use]
    pub fn keys_to_prefetch(&self) -> Vec<Key> {
        self.keys_to_prefetch.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_new_key(&self, key: &Key) -> bool {
        self.new_keys.contains(key)
    }
}

/// State threaded through the execution of a log
pub struct ExecutionContext<'a> {
    session: &'a Session,
    key_map: BTreeMap<Key, Key>,
}

impl<'a> ExecutionContext<'a> {
    #[must_use]
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            key_map: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn session(&self) -> &'a Session {
        self.session
    }

    #[must_use]
    pub fn mapped_key(&self, key: &Key) -> Option<Key> {
        self.key_map.get(key).cloned()
    }

    #[must_use]
    pub fn remap_key(&self, key: &Key) -> Key {
        self.mapped_key(key).unwrap_or_else(|| key.clone())
    }

    #[must_use]
    pub fn remap_value(&self, value: &Value) -> Value {
        value.map_keys(&|key| self.remap_key(key))
    }

    /// Record that `recorded` now resolves to `assigned`
    pub fn identify(&mut self, recorded: &Key, assigned: Key, outcome: &mut OperationOutcome) {
        _ = outcome
            .identified_entities
            .insert(recorded.to_string(), assigned.clone());
        _ = self.key_map.insert(recorded.clone(), assigned);
    }
}
