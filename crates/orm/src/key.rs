// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Entity identity, replay key mapping and optimistic-concurrency versions

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an entity
///
/// Temporary keys are session-local placeholders (for example keys handed
/// out while working disconnected); replaying an operation log maps them to
/// storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    entity_type: String,
    id: i64,
    #[serde(default)]
    temporary: bool,
}

impl Key {
    pub fn new(entity_type: impl Into<String>, id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            temporary: false,
        }
    }

    pub fn temporary(entity_type: impl Into<String>, id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            temporary: true,
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.temporary {
            write!(f, "{}(~{})", self.entity_type, self.id)
        } else {
            write!(f, "{}({})", self.entity_type, self.id)
        }
    }
}

/// Correlation of placeholder keys to the storage keys assigned on replay
///
/// Serialized as a list of `[from, to]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(Key, Key)>", into = "Vec<(Key, Key)>")]
pub struct KeyMapping {
    map: BTreeMap<Key, Key>,
}

impl From<Vec<(Key, Key)>> for KeyMapping {
    fn from(pairs: Vec<(Key, Key)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }
}

impl From<KeyMapping> for Vec<(Key, Key)> {
    fn from(mapping: KeyMapping) -> Self {
        mapping.map.into_iter().collect()
    }
}

impl KeyMapping {
    #[must_use]
    pub fn new(map: BTreeMap<Key, Key>) -> Self {
        Self { map }
    }

    /// Mapped key, or `key` itself when it is not in the mapping
    #[must_use]
    pub fn try_remap_key(&self, key: &Key) -> Key {
        self.map.get(key).cloned().unwrap_or_else(|| key.clone())
    }

    /// Remap every key inside `value`
    #[must_use]
    pub fn remap_value(&self, value: &Value) -> Value {
        value.map_keys(&|key| self.try_remap_key(key))
    }

    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Key> {
        self.map.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Key)> {
        self.map.iter()
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Version of an entity used for optimistic concurrency checks
///
/// An empty version is void and never conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo(Vec<Value>);

impl VersionInfo {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn void() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Whether the two versions describe different entity states
    ///
    /// A different number of version fields is always a conflict.
    #[must_use]
    pub fn conflicts_with(&self, other: &VersionInfo) -> bool {
        if self.is_void() || other.is_void() {
            return false;
        }
        if self.0.len() != other.0.len() {
            return true;
        }
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a != b)
    }
}
