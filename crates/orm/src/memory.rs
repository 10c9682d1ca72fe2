// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory storage provider for tests and disconnected use
//!
//! [`MemoryHandler`] keeps entity tables in memory and counts every
//! round-trip a session makes, so batching behavior can be asserted.

use crate::command::CommandProcessorContextProvider;
use crate::entity::{EntityChange, EntityState, keys_parameter};
use crate::error::{OrmError, Result};
use crate::handler::{PersistReason, SessionHandler};
use crate::key::{Key, VersionInfo};
use crate::parameters::ParameterContext;
use crate::query_task::{DataSource, QueryTask};
use crate::value::{Tuple, Value};
use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Queries understood by [`MemoryHandler`]
#[derive(Debug, Clone)]
pub enum MemoryDataSource {
    /// Fixed rows
    Rows(Vec<Tuple>),
    /// Entities of a type whose keys are bound to
    /// [`keys_parameter`](crate::entity::keys_parameter)
    EntityFetch { entity_type: String },
    /// Every stored entity of a type, in key order
    EntityScan { entity_type: String },
    /// Fails when executed
    Failing(String),
}

impl MemoryDataSource {
    #[must_use]
    pub fn rows(rows: Vec<Tuple>) -> Self {
        MemoryDataSource::Rows(rows)
    }

    pub fn entity_fetch(entity_type: impl Into<String>) -> Self {
        MemoryDataSource::EntityFetch {
            entity_type: entity_type.into(),
        }
    }

    pub fn entity_scan(entity_type: impl Into<String>) -> Self {
        MemoryDataSource::EntityScan {
            entity_type: entity_type.into(),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        MemoryDataSource::Failing(message.into())
    }
}

impl DataSource for MemoryDataSource {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Table = BTreeMap<Key, EntityState>;

#[derive(Debug, Default)]
struct State {
    entities: Table,
    next_ids: HashMap<String, i64>,
    /// Entity tables as they were when each open transaction began
    snapshots: Vec<Table>,

    key_allocations: usize,
    batch_sizes: Vec<usize>,
    persist_log: Vec<(PersistReason, usize)>,
    persisted: Vec<EntityChange>,
    commits: usize,
    rollbacks: usize,
    fetch_query_builds: usize,
    fail_next_batch: bool,
    fail_next_persist: bool,
    fail_next_begin: bool,
}

impl State {
    fn apply(&mut self, changes: &[EntityChange]) -> Result<()> {
        let mut entities = self.entities.clone();
        for change in changes {
            match change {
                EntityChange::Insert(state) => {
                    if entities.contains_key(state.key()) {
                        return Err(OrmError::EntityAlreadyExists(state.key().clone()));
                    }
                    let stored = state
                        .clone()
                        .with_version(VersionInfo::new(vec![Value::Int(1)]));
                    _ = entities.insert(state.key().clone(), stored);
                }
                EntityChange::Update { key, field, value } => {
                    let stored = entities
                        .get_mut(key)
                        .ok_or_else(|| OrmError::EntityNotFound(key.clone()))?;
                    _ = stored.set_field(field, value.clone());
                    let version = next_version(stored.version());
                    stored.set_version(version);
                }
                EntityChange::Remove(key) => {
                    if entities.remove(key).is_none() {
                        return Err(OrmError::EntityNotFound(key.clone()));
                    }
                }
            }
        }
        self.entities = entities;
        Ok(())
    }

    fn evaluate(&self, source: &MemoryDataSource, context: &ParameterContext) -> Result<Vec<Tuple>> {
        match source {
            MemoryDataSource::Rows(rows) => Ok(rows.clone()),
            MemoryDataSource::EntityFetch { entity_type } => {
                let Value::Tuple(keys) = context.get_value(keys_parameter())? else {
                    return Err(OrmError::execution("keys parameter must be a tuple"));
                };
                let mut rows = Vec::with_capacity(keys.len());
                for value in keys {
                    let Value::Key(key) = value else {
                        return Err(OrmError::execution(format!("not a key: {value}")));
                    };
                    if key.entity_type() != entity_type {
                        continue;
                    }
                    if let Some(state) = self.entities.get(key) {
                        rows.push(state.to_row());
                    }
                }
                Ok(rows)
            }
            MemoryDataSource::EntityScan { entity_type } => Ok(self
                .entities
                .values()
                .filter(|state| state.key().entity_type() == entity_type)
                .map(EntityState::to_row)
                .collect()),
            MemoryDataSource::Failing(message) => Err(OrmError::execution(message.clone())),
        }
    }
}

fn next_version(version: &VersionInfo) -> VersionInfo {
    match version.values() {
        [Value::Int(n)] => VersionInfo::new(vec![Value::Int(n + 1)]),
        _ => VersionInfo::new(vec![Value::Int(1)]),
    }
}

/// [`SessionHandler`] over in-memory entity tables
///
/// Persisted changes are applied atomically per call. Transactions snapshot
/// the tables when they begin; rolling back restores the snapshot. Reserved
/// key ranges are never returned.
#[derive(Debug, Default)]
pub struct MemoryHandler {
    state: Mutex<State>,
    contexts: CommandProcessorContextProvider,
}

impl MemoryHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entity directly, bypassing sessions
    pub fn insert_entity(&self, state: EntityState) {
        _ = self.lock().entities.insert(state.key().clone(), state);
    }

    #[must_use]
    pub fn entity(&self, key: &Key) -> Option<EntityState> {
        self.lock().entities.get(key).cloned()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    /// Number of `allocate_keys` round-trips
    #[must_use]
    pub fn key_allocations(&self) -> usize {
        self.lock().key_allocations
    }

    /// Task count of every executed batch, in order
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.lock().batch_sizes.len()
    }

    /// Reason and change count of every persist call
    #[must_use]
    pub fn persist_log(&self) -> Vec<(PersistReason, usize)> {
        self.lock().persist_log.clone()
    }

    /// Every change applied by persist, in order
    #[must_use]
    pub fn persisted_changes(&self) -> Vec<EntityChange> {
        self.lock().persisted.clone()
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    #[must_use]
    pub fn fetch_query_builds(&self) -> usize {
        self.lock().fetch_query_builds
    }

    /// Command processor contexts currently held by running batches
    #[must_use]
    pub fn active_contexts(&self) -> usize {
        self.contexts.active_count()
    }

    /// Make the next batch fail before any task executes
    pub fn fail_next_batch(&self) {
        self.lock().fail_next_batch = true;
    }

    /// Make the next persist call fail without applying anything
    pub fn fail_next_persist(&self) {
        self.lock().fail_next_persist = true;
    }

    /// Make the next transaction begin fail before taking a snapshot
    pub fn fail_next_begin(&self) {
        self.lock().fail_next_begin = true;
    }

    /// Transactions begun and not yet committed or rolled back
    #[must_use]
    pub fn open_snapshots(&self) -> usize {
        self.lock().snapshots.len()
    }
}

#[async_trait]
impl SessionHandler for MemoryHandler {
    fn persist(&self, changes: &[EntityChange], reason: PersistReason) -> Result<()> {
        let mut state = self.lock();
        state.persist_log.push((reason, changes.len()));
        if std::mem::take(&mut state.fail_next_persist) {
            return Err(OrmError::execution("injected persist failure"));
        }
        state.apply(changes)?;
        state.persisted.extend_from_slice(changes);
        Ok(())
    }

    fn execute_query_tasks(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> Result<()> {
        let context = self.contexts.provide(allow_partial_execution);
        let mut state = self.lock();
        state.batch_sizes.push(tasks.len());
        if std::mem::take(&mut state.fail_next_batch) {
            return Err(OrmError::execution("injected batch failure"));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = match task.data_source().as_any().downcast_ref::<MemoryDataSource>() {
                Some(source) => state.evaluate(source, task.parameter_context()),
                None => Err(OrmError::execution("unsupported data source")),
            };
            results.push(result);
        }
        drop(state);

        if !context.allow_partial_execution() {
            if let Some(Err(err)) = results.iter().find(|result| result.is_err()) {
                let message = err.to_string();
                return Err(OrmError::execution(message));
            }
        }
        let mut failed = 0usize;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(rows) => task.set_result(rows)?,
                Err(_) => failed += 1,
            }
        }
        if failed > 0 {
            let context_id = context.id();
            diagnostics::warn!("Batch {context_id} completed partially, {failed} tasks failed");
        }
        Ok(())
    }

    fn build_entity_fetch_query(&self, entity_type: &str) -> Result<Arc<dyn DataSource>> {
        self.lock().fetch_query_builds += 1;
        Ok(Arc::new(MemoryDataSource::entity_fetch(entity_type)))
    }

    fn allocate_keys(&self, entity_type: &str, count: u32) -> Result<i64> {
        let mut state = self.lock();
        state.key_allocations += 1;
        let next = state.next_ids.entry(entity_type.to_string()).or_insert(1);
        let first = *next;
        *next += i64::from(count);
        Ok(first)
    }

    fn begin_transaction(&self, _nested: bool) -> Result<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_begin) {
            return Err(OrmError::execution("injected begin failure"));
        }
        let snapshot = state.entities.clone();
        state.snapshots.push(snapshot);
        Ok(())
    }

    fn commit_transaction(&self, _nested: bool) -> Result<()> {
        let mut state = self.lock();
        if state.snapshots.pop().is_none() {
            return Err(OrmError::execution("commit without transaction"));
        }
        state.commits += 1;
        Ok(())
    }

    fn rollback_transaction(&self, _nested: bool) -> Result<()> {
        let mut state = self.lock();
        let Some(snapshot) = state.snapshots.pop() else {
            return Err(OrmError::execution("rollback without transaction"));
        };
        state.entities = snapshot;
        state.rollbacks += 1;
        Ok(())
    }

    async fn persist_async(&self, changes: &[EntityChange], reason: PersistReason) -> Result<()> {
        tokio::task::yield_now().await;
        self.persist(changes, reason)
    }

    async fn execute_query_tasks_async(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        self.execute_query_tasks(tasks, allow_partial_execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txstate::StateLifetimeToken;

    fn task(source: MemoryDataSource, context: Arc<ParameterContext>) -> Arc<QueryTask> {
        Arc::new(QueryTask::new(
            Arc::new(source),
            StateLifetimeToken::new(),
            context,
        ))
    }

    #[test]
    fn test_failed_task_fails_whole_batch() {
        let handler = MemoryHandler::new();
        let ok = task(MemoryDataSource::rows(vec![vec![Value::Int(1)]]), ParameterContext::empty());
        let bad = task(MemoryDataSource::failing("boom"), ParameterContext::empty());

        assert!(handler.execute_query_tasks(&[ok.clone(), bad.clone()], false).is_err());
        assert!(!ok.has_result());
        assert!(!bad.has_result());
        assert_eq!(handler.active_contexts(), 0);
    }

    #[test]
    fn test_partial_execution_keeps_successes() {
        let handler = MemoryHandler::new();
        let ok = task(MemoryDataSource::rows(vec![vec![Value::Int(1)]]), ParameterContext::empty());
        let bad = task(MemoryDataSource::failing("boom"), ParameterContext::empty());

        handler
            .execute_query_tasks(&[ok.clone(), bad.clone()], true)
            .expect("partial");
        assert!(ok.has_result());
        assert!(!bad.has_result());
    }

    #[test]
    fn test_entity_fetch_reads_bound_keys() {
        let handler = MemoryHandler::new();
        handler.insert_entity(EntityState::new(Key::new("Order", 1)));
        handler.insert_entity(EntityState::new(Key::new("Order", 2)));

        let context = Arc::new(ParameterContext::default().with_value(
            keys_parameter(),
            Value::Tuple(vec![
                Value::Key(Key::new("Order", 2)),
                Value::Key(Key::new("Order", 3)),
            ]),
        ));
        let fetch = task(MemoryDataSource::entity_fetch("Order"), context);
        handler.execute_query_tasks(&[fetch.clone()], false).expect("fetch");

        let rows = fetch.result().expect("rows");
        assert_eq!(rows.len(), 1);
        let state = EntityState::from_row(&rows[0]).expect("row");
        assert_eq!(state.key(), &Key::new("Order", 2));
    }

    #[test]
    fn test_persist_is_atomic_and_versions_bump() {
        let handler = MemoryHandler::new();
        let key = Key::new("Order", 1);
        handler
            .persist(&[EntityChange::Insert(EntityState::new(key.clone()))], PersistReason::Manual)
            .expect("insert");
        handler
            .persist(
                &[EntityChange::Update {
                    key: key.clone(),
                    field: "total".to_string(),
                    value: Value::Int(2),
                }],
                PersistReason::Manual,
            )
            .expect("update");
        let stored = handler.entity(&key).expect("stored");
        assert_eq!(stored.version(), &VersionInfo::new(vec![Value::Int(2)]));

        let result = handler.persist(
            &[
                EntityChange::Remove(key.clone()),
                EntityChange::Remove(Key::new("Order", 9)),
            ],
            PersistReason::Manual,
        );
        assert!(matches!(result, Err(OrmError::EntityNotFound(_))));
        assert!(handler.entity(&key).is_some());
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let handler = MemoryHandler::new();
        handler.begin_transaction(false).expect("begin");
        handler
            .persist(
                &[EntityChange::Insert(EntityState::new(Key::new("Order", 1)))],
                PersistReason::Commit,
            )
            .expect("persist");
        handler.rollback_transaction(false).expect("rollback");
        assert_eq!(handler.entity_count(), 0);
        assert_eq!(handler.rollbacks(), 1);
    }
}
