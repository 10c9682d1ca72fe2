// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

// Error types for session, query and replay operations
use crate::key::Key;
use crate::query_result::ResultAccessMethod;
use txstate::StateError;

pub type Result<T> = std::result::Result<T, OrmError>;

#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("{method} expected {expectation} but the sequence {found}")]
    Cardinality {
        method: ResultAccessMethod,
        expectation: &'static str,
        found: &'static str,
    },

    #[error("Query is not scalar: {0}")]
    NotScalar(ResultAccessMethod),

    #[error("Duplicate unique operation: {identifier}")]
    DuplicateUniqueOperation { identifier: String },

    #[error("Replay error: {reason}")]
    ReplayState { reason: String },

    #[error("Query task has no result")]
    ResultNotAvailable,

    #[error("Query task result is already assigned")]
    ResultAlreadyAssigned,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Parameter not bound: {name}")]
    ParameterNotBound { name: String },

    #[error("Value conversion error: expected {expected}, found {found}")]
    ValueConversion { expected: &'static str, found: String },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction {id} is not the innermost transaction of the session")]
    TransactionNotInnermost { id: u64 },

    #[error("Entity not found: {0}")]
    EntityNotFound(Key),

    #[error("Entity already exists: {0}")]
    EntityAlreadyExists(Key),

    #[error("Version conflict for {0}")]
    VersionConflict(Key),

    #[error("Validation failed for {key}: {message}")]
    Validation { key: Key, message: String },

    #[error("Storage node not found: '{0}'")]
    NodeNotFound(String),

    #[error("Operation capture is already active")]
    OperationCaptureActive,

    #[error("Compiled query '{0}' is cached with a different result type")]
    QueryCacheTypeMismatch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl OrmError {
    pub fn execution(message: impl Into<String>) -> Self {
        OrmError::Execution {
            message: message.into(),
        }
    }

    pub fn replay(reason: impl Into<String>) -> Self {
        OrmError::ReplayState {
            reason: reason.into(),
        }
    }

    /// Whether the error reports access to an expired transaction-scoped handle
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, OrmError::State(StateError::Expired))
    }
}
