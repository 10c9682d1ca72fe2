// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::{ExecutionContext, Operation, PrepareContext};
use crate::error::{OrmError, Result};
use crate::key::KeyMapping;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationLogType {
    /// Replayed with user hooks and validation suppressed
    System,
    Outermost,
    Undo,
}

impl fmt::Display for OperationLogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize)]
struct OperationLogData {
    log_type: OperationLogType,
    operations: Vec<Operation>,
}

/// Ordered, replayable sequence of operations
///
/// Unique operations are de-duplicated when logged: a second copy is either
/// ignored or rejected, depending on the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "OperationLogData", into = "OperationLogData")]
pub struct OperationLog {
    log_type: OperationLogType,
    operations: Vec<Operation>,
    unique: HashSet<String>,
}

impl OperationLog {
    #[must_use]
    pub fn new(log_type: OperationLogType) -> Self {
        Self {
            log_type,
            operations: Vec::new(),
            unique: HashSet::new(),
        }
    }

    #[must_use]
    pub fn log_type(&self) -> OperationLogType {
        self.log_type
    }

    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append an operation
    ///
    /// Fails with [`OrmError::DuplicateUniqueOperation`] when an equal unique
    /// operation is already logged, leaving the log unchanged.
    pub fn log(&mut self, operation: Operation) -> Result<()> {
        if let Some(identifier) = operation.unique_identifier() {
            if self.unique.contains(&identifier) {
                if operation.ignores_duplicates() {
                    diagnostics::debug!("Ignoring duplicate operation {identifier}");
                    return Ok(());
                }
                return Err(OrmError::DuplicateUniqueOperation { identifier });
            }
            _ = self.unique.insert(identifier);
        }
        self.operations.push(operation);
        Ok(())
    }

    /// Append copies of every operation in `other`
    pub fn log_all(&mut self, other: &OperationLog) -> Result<()> {
        for operation in &other.operations {
            self.log(operation.duplicate(true))?;
        }
        Ok(())
    }

    /// Log reverting this one: undo operations in reverse order
    pub fn undo_log(&self) -> Result<OperationLog> {
        let mut undo = OperationLog::new(OperationLogType::Undo);
        for operation in self.operations.iter().rev() {
            for step in operation.undo().iter() {
                undo.log(step.clone())?;
            }
        }
        Ok(undo)
    }

    /// Execute the log in a new transaction of `session`
    ///
    /// Every operation is prepared first and the keys they need are fetched
    /// in one batch. Returns the storage keys assigned to the placeholder
    /// keys identified by the log. On failure the transaction is rolled back
    /// and the log can be replayed again.
    pub fn replay(&self, session: &Session) -> Result<KeyMapping> {
        if session.is_registering_operation() {
            return Err(OrmError::replay(
                "cannot replay while another operation is being registered",
            ));
        }
        let _system = (self.log_type == OperationLogType::System)
            .then(|| session.system_logic_only());

        let count = self.operations.len();
        let log_type = self.log_type.to_string();
        diagnostics::info!("Replaying {count} operations from {log_type} log");

        let scope = session.open_transaction()?;
        match self.replay_operations(session) {
            Ok(mapping) => {
                scope
                    .commit()
                    .map_err(|err| OrmError::replay(format!("commit failed: {err}")))?;
                let mapped = mapping.len();
                diagnostics::info!("Replay finished, {mapped} keys mapped");
                Ok(mapping)
            }
            Err(err) => {
                if let Err(rollback) = scope.rollback() {
                    let message = rollback.to_string();
                    diagnostics::warn!("Rollback after failed replay failed: {message}");
                }
                Err(err)
            }
        }
    }

    fn replay_operations(&self, session: &Session) -> Result<KeyMapping> {
        let mut prepare = PrepareContext::default();
        for operation in &self.operations {
            operation.prepare(&mut prepare);
        }
        session.prefetch(&prepare.keys_to_prefetch())?;

        let mut context = ExecutionContext::new(session);
        let mut mapping = BTreeMap::new();
        for operation in &self.operations {
            let outcome = operation.execute(&mut context)?;
            let identified = operation.tree_identified_entities();
            for (identifier, assigned) in outcome.identified_entities {
                if let Some(recorded) = identified.get(&identifier) {
                    _ = mapping.insert(recorded.clone(), assigned);
                }
            }
        }
        Ok(KeyMapping::new(mapping))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl TryFrom<OperationLogData> for OperationLog {
    type Error = OrmError;

    fn try_from(data: OperationLogData) -> Result<Self> {
        let mut log = OperationLog::new(data.log_type);
        for operation in data.operations {
            log.log(operation)?;
        }
        Ok(log)
    }
}

impl From<OperationLog> for OperationLogData {
    fn from(log: OperationLog) -> Self {
        Self {
            log_type: log.log_type,
            operations: log.operations,
        }
    }
}
