// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Replayable records of entity mutations
//!
//! An [`Operation`] is a tree: preceding operations, the operation itself and
//! following operations are always visited in that order, both when
//! preparing (collecting keys to prefetch) and when executing. Every
//! mutation also records the operations that undo it.

mod context;
mod log;

pub use context::{ExecutionContext, PrepareContext};
pub use log::{OperationLog, OperationLogType};

use crate::error::Result;
use crate::key::{Key, VersionInfo};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Verifies state without changing it
    Precondition,
    Mutation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    KeyGenerate { key: Key },
    EntityCreate { key: Key },
    EntityFieldSet { key: Key, field: String, value: Value },
    EntityRemove { key: Key },
    VersionCheck { key: Key, version: VersionInfo },
}

impl OperationKind {
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            OperationKind::KeyGenerate { key }
            | OperationKind::EntityCreate { key }
            | OperationKind::EntityFieldSet { key, .. }
            | OperationKind::EntityRemove { key }
            | OperationKind::VersionCheck { key, .. } => key,
        }
    }
}

/// Child operations of one node
///
/// Most operations have no children, so the empty case carries no
/// allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub enum OperationList {
    #[default]
    Empty,
    Items(Arc<[Operation]>),
}

impl OperationList {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Operation] {
        match self {
            OperationList::Empty => &[],
            OperationList::Items(items) => &items[..],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.as_slice().iter()
    }
}

impl From<Vec<Operation>> for OperationList {
    fn from(items: Vec<Operation>) -> Self {
        if items.is_empty() {
            OperationList::Empty
        } else {
            OperationList::Items(Arc::from(items))
        }
    }
}

impl From<OperationList> for Vec<Operation> {
    fn from(list: OperationList) -> Self {
        list.as_slice().to_vec()
    }
}

/// Identifiers assigned while executing one operation tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutcome {
    /// Identifier to the key assigned by this execution
    pub identified_entities: BTreeMap<String, Key>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    kind: OperationKind,
    #[serde(default, skip_serializing_if = "OperationList::is_empty")]
    preceding: OperationList,
    #[serde(default, skip_serializing_if = "OperationList::is_empty")]
    following: OperationList,
    #[serde(default, skip_serializing_if = "OperationList::is_empty")]
    undo: OperationList,
    /// Identifier to the key it named when the operation was recorded
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    identified_entities: BTreeMap<String, Key>,
}

impl Operation {
    #[must_use]
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            preceding: OperationList::Empty,
            following: OperationList::Empty,
            undo: OperationList::Empty,
            identified_entities: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_preceding(mut self, operations: Vec<Operation>) -> Self {
        self.preceding = operations.into();
        self
    }

    #[must_use]
    pub fn with_following(mut self, operations: Vec<Operation>) -> Self {
        self.following = operations.into();
        self
    }

    #[must_use]
    pub fn with_undo(mut self, operations: Vec<Operation>) -> Self {
        self.undo = operations.into();
        self
    }

    /// Record that `key` is known to the log under its own identifier
    #[must_use]
    pub fn identifying(mut self, key: &Key) -> Self {
        _ = self
            .identified_entities
            .insert(key.to_string(), key.clone());
        self
    }

    #[must_use]
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    #[must_use]
    pub fn preceding(&self) -> &OperationList {
        &self.preceding
    }

    #[must_use]
    pub fn following(&self) -> &OperationList {
        &self.following
    }

    #[must_use]
    pub fn undo(&self) -> &OperationList {
        &self.undo
    }

    #[must_use]
    pub fn identified_entities(&self) -> &BTreeMap<String, Key> {
        &self.identified_entities
    }

    /// Identified entities of this operation and of every preceding and
    /// following operation in its tree
    #[must_use]
    pub fn tree_identified_entities(&self) -> BTreeMap<String, Key> {
        let mut entities = BTreeMap::new();
        self.collect_identified_entities(&mut entities);
        entities
    }

    fn collect_identified_entities(&self, into: &mut BTreeMap<String, Key>) {
        for operation in self.preceding.iter() {
            operation.collect_identified_entities(into);
        }
        into.extend(
            self.identified_entities
                .iter()
                .map(|(identifier, key)| (identifier.clone(), key.clone())),
        );
        for operation in self.following.iter() {
            operation.collect_identified_entities(into);
        }
    }

    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::VersionCheck { .. } => OperationType::Precondition,
            _ => OperationType::Mutation,
        }
    }

    #[must_use]
    pub fn title(&self) -> &'static str {
        match self.kind {
            OperationKind::KeyGenerate { .. } => "Generate key",
            OperationKind::EntityCreate { .. } => "Create entity",
            OperationKind::EntityFieldSet { .. } => "Set field",
            OperationKind::EntityRemove { .. } => "Remove entity",
            OperationKind::VersionCheck { .. } => "Check version",
        }
    }

    #[must_use]
    pub fn description(&self) -> String {
        match &self.kind {
            OperationKind::EntityFieldSet { key, field, value } => {
                format!("{}: {key}.{field} = {value}", self.title())
            }
            kind => format!("{}: {}", self.title(), kind.key()),
        }
    }

    /// Identity shared by semantically equal unique operations
    #[must_use]
    pub fn unique_identifier(&self) -> Option<String> {
        match &self.kind {
            OperationKind::KeyGenerate { key } => Some(format!("KeyGenerate:{key}")),
            OperationKind::EntityCreate { key } => Some(format!("EntityCreate:{key}")),
            OperationKind::VersionCheck { key, .. } => Some(format!("VersionCheck:{key}")),
            OperationKind::EntityFieldSet { .. } | OperationKind::EntityRemove { .. } => None,
        }
    }

    /// A duplicate of this unique operation is dropped instead of rejected
    #[must_use]
    pub fn ignores_duplicates(&self) -> bool {
        matches!(self.kind, OperationKind::VersionCheck { .. })
    }

    /// Copy of the operation keeping only precondition preceding operations
    #[must_use]
    pub fn duplicate(&self, with_identified_entities: bool) -> Operation {
        let preceding = self
            .preceding
            .iter()
            .filter(|op| op.operation_type() == OperationType::Precondition)
            .cloned()
            .collect::<Vec<_>>();
        Operation {
            kind: self.kind.clone(),
            preceding: preceding.into(),
            following: self.following.clone(),
            undo: self.undo.clone(),
            identified_entities: if with_identified_entities {
                self.identified_entities.clone()
            } else {
                BTreeMap::new()
            },
        }
    }

    pub fn prepare(&self, context: &mut PrepareContext) {
        for operation in self.preceding.iter() {
            operation.prepare(context);
        }
        match &self.kind {
            OperationKind::KeyGenerate { key } | OperationKind::EntityCreate { key } => {
                context.register_new_key(key);
            }
            OperationKind::EntityFieldSet { key, .. }
            | OperationKind::EntityRemove { key }
            | OperationKind::VersionCheck { key, .. } => context.register_key_to_prefetch(key),
        }
        for operation in self.following.iter() {
            operation.prepare(context);
        }
    }

    pub fn execute(&self, context: &mut ExecutionContext<'_>) -> Result<OperationOutcome> {
        let mut outcome = OperationOutcome::default();
        self.execute_tree(context, &mut outcome)?;
        Ok(outcome)
    }

    fn execute_tree(
        &self,
        context: &mut ExecutionContext<'_>,
        outcome: &mut OperationOutcome,
    ) -> Result<()> {
        for operation in self.preceding.iter() {
            operation.execute_tree(context, outcome)?;
        }
        self.execute_self(context, outcome)?;
        for operation in self.following.iter() {
            operation.execute_tree(context, outcome)?;
        }
        Ok(())
    }

    fn execute_self(
        &self,
        context: &mut ExecutionContext<'_>,
        outcome: &mut OperationOutcome,
    ) -> Result<()> {
        let session = context.session();
        match &self.kind {
            OperationKind::KeyGenerate { key } => {
                let generated = session.generate_key(key.entity_type())?;
                context.identify(key, generated, outcome);
            }
            OperationKind::EntityCreate { key } => {
                let target = match context.mapped_key(key) {
                    Some(mapped) => mapped,
                    None if key.is_temporary() => {
                        let generated = session.generate_key(key.entity_type())?;
                        context.identify(key, generated.clone(), outcome);
                        generated
                    }
                    None => key.clone(),
                };
                session.create_entity(target)?;
            }
            OperationKind::EntityFieldSet { key, field, value } => {
                let key = context.remap_key(key);
                let value = context.remap_value(value);
                session.set_field(&key, field, value)?;
            }
            OperationKind::EntityRemove { key } => {
                session.remove_entity(&context.remap_key(key))?;
            }
            OperationKind::VersionCheck { key, version } => {
                session.verify_version(&context.remap_key(key), version)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}
