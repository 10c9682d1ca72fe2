// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Cached entity state and the changes flushed by persist

use crate::error::{OrmError, Result};
use crate::key::{Key, VersionInfo};
use crate::parameters::Parameter;
use crate::value::{FromValue, Tuple, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static KEYS_PARAMETER: LazyLock<Parameter> = LazyLock::new(|| Parameter::new("keys"));

/// Parameter bound to a tuple of keys by entity fetch tasks
#[must_use]
pub fn keys_parameter() -> &'static Parameter {
    &KEYS_PARAMETER
}

/// In-memory image of one entity
///
/// Fetch queries produce rows of the form `[key, (version...), (name, value, ...)]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    key: Key,
    version: VersionInfo,
    fields: BTreeMap<String, Value>,
    removed: bool,
}

impl EntityState {
    /// Fresh entity with no stored version
    #[must_use]
    pub fn new(key: Key) -> Self {
        Self {
            key,
            version: VersionInfo::void(),
            fields: BTreeMap::new(),
            removed: false,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        _ = self.fields.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn set_version(&mut self, version: VersionInfo) {
        self.version = version;
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Set a field, returning the previous value
    pub fn set_field(&mut self, name: &str, value: Value) -> Option<Value> {
        self.fields.insert(name.to_string(), value)
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    #[must_use]
    pub fn to_row(&self) -> Tuple {
        let fields = self
            .fields
            .iter()
            .flat_map(|(name, value)| [Value::Text(name.clone()), value.clone()])
            .collect();
        vec![
            Value::Key(self.key.clone()),
            Value::Tuple(self.version.values().to_vec()),
            Value::Tuple(fields),
        ]
    }

    pub fn from_row(row: &Tuple) -> Result<Self> {
        let [key, version, fields] = row.as_slice() else {
            return Err(OrmError::ValueConversion {
                expected: "entity row",
                found: format!("row of {} values", row.len()),
            });
        };
        let key = Key::from_value(key)?;
        let (Value::Tuple(version), Value::Tuple(fields)) = (version, fields) else {
            return Err(OrmError::ValueConversion {
                expected: "entity row",
                found: "non-tuple version or fields".to_string(),
            });
        };

        let mut state = EntityState::new(key).with_version(VersionInfo::new(version.clone()));
        for pair in fields.chunks(2) {
            let [name, value] = pair else {
                return Err(OrmError::ValueConversion {
                    expected: "field pair",
                    found: "odd number of field values".to_string(),
                });
            };
            let name = String::from_value(name)?;
            _ = state.set_field(&name, value.clone());
        }
        Ok(state)
    }
}

/// Entities known to a session
#[derive(Debug, Default)]
pub struct EntityCache {
    entities: HashMap<Key, EntityState>,
}

impl EntityCache {
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&EntityState> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut EntityState> {
        self.entities.get_mut(key)
    }

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.entities.contains_key(key)
    }

    pub fn insert(&mut self, state: EntityState) {
        _ = self.entities.insert(state.key().clone(), state);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Remove,
}

/// One pending modification, in the order it was made
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Insert(EntityState),
    Update { key: Key, field: String, value: Value },
    Remove(Key),
}

impl EntityChange {
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            EntityChange::Insert(state) => state.key(),
            EntityChange::Update { key, .. } | EntityChange::Remove(key) => key,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            EntityChange::Insert(_) => ChangeKind::Insert,
            EntityChange::Update { .. } => ChangeKind::Update,
            EntityChange::Remove(_) => ChangeKind::Remove,
        }
    }
}
