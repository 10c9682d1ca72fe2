// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! ORM runtime core: delayed query batching, transactional sessions,
//! replayable operation logs and storage node partitioning
//!
//! Queries created through a [`Session`] are not executed right away. Each
//! one registers a [`QueryTask`] on the session's queue and the whole queue
//! runs in one handler round-trip the first time any result is needed.

pub mod command;
pub mod config;
pub mod delayed;
pub mod domain;
pub mod entity;
pub mod error;
pub mod handler;
pub mod key;
pub mod materializer;
pub mod memory;
pub mod operations;
pub mod parameters;
pub mod query_result;
pub mod query_task;
pub mod scope;
pub mod session;
pub mod storage;
pub mod value;

pub use command::{CommandProcessorContext, CommandProcessorContextProvider};
pub use config::{
    DEFAULT_NODE_ID, DomainConfiguration, NodeConfiguration, SessionConfiguration, load_config,
};
pub use delayed::{DelayedQuery, DelayedScalarQuery};
pub use domain::Domain;
pub use entity::{ChangeKind, EntityChange, EntityState};
pub use error::{OrmError, Result};
pub use handler::{PersistReason, SessionHandler};
pub use key::{Key, KeyMapping, VersionInfo};
pub use materializer::{Materializer, TranslatedQuery};
pub use memory::{MemoryDataSource, MemoryHandler};
pub use operations::{
    Operation, OperationKind, OperationLog, OperationLogType, OperationOutcome, OperationType,
};
pub use parameters::{Parameter, ParameterContext};
pub use query_result::{AsyncQueryResult, QueryResult, RecordSetReader, ResultAccessMethod};
pub use query_task::{DataSource, QueryTask};
pub use scope::SessionStack;
pub use session::{QueryQueue, Session, TransactionScope};
pub use storage::{CompiledQueryCache, NodeBuilder, StorageNode, StorageNodeManager};
pub use value::{FromValue, Tuple, Value};

pub use tokio_util::sync::CancellationToken;
pub use txstate::{StateError, StateLifetimeToken, Transaction};
