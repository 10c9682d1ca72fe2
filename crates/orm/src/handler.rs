// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Boundary between a session and the storage provider executing its work

use crate::entity::EntityChange;
use crate::error::Result;
use crate::query_task::{DataSource, QueryTask};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Why pending changes are being flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistReason {
    /// Explicit request from application code
    Manual,
    /// Before a user-defined query batch
    Query,
    /// Before a nested transaction starts
    NestedTransaction,
    /// Before commit
    Commit,
    /// Any other internal flush, including internal query batches
    Other,
}

impl fmt::Display for PersistReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Storage provider behind a session
///
/// The session drives everything through this trait: flushing changes,
/// executing query task batches and transaction notifications. The async
/// methods default to their synchronous counterparts.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Flush `changes` to storage
    fn persist(&self, changes: &[EntityChange], reason: PersistReason) -> Result<()>;

    /// Execute `tasks` in one round-trip, assigning every task's result
    ///
    /// With `allow_partial_execution` a failing task may be left without a
    /// result instead of failing the batch. Without it any failure fails the
    /// whole batch.
    fn execute_query_tasks(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> Result<()>;

    /// Compiled query fetching entities of `entity_type` by key
    ///
    /// The task parameter context binds
    /// [`keys_parameter`](crate::entity::keys_parameter) to a tuple of keys;
    /// each row is an [`EntityState`](crate::entity::EntityState) row.
    fn build_entity_fetch_query(&self, entity_type: &str) -> Result<Arc<dyn DataSource>>;

    /// Reserve `count` consecutive ids for `entity_type`, returning the first
    fn allocate_keys(&self, entity_type: &str, count: u32) -> Result<i64>;

    fn begin_transaction(&self, _nested: bool) -> Result<()> {
        Ok(())
    }

    fn commit_transaction(&self, _nested: bool) -> Result<()> {
        Ok(())
    }

    fn rollback_transaction(&self, _nested: bool) -> Result<()> {
        Ok(())
    }

    async fn persist_async(&self, changes: &[EntityChange], reason: PersistReason) -> Result<()> {
        self.persist(changes, reason)
    }

    async fn execute_query_tasks_async(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> Result<()> {
        self.execute_query_tasks(tasks, allow_partial_execution)
    }
}
