// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::{ChangeHook, Session, SessionState, Validator};
use crate::entity::{EntityCache, EntityChange, EntityState, keys_parameter};
use crate::error::{OrmError, Result};
use crate::key::{Key, VersionInfo};
use crate::operations::{Operation, OperationKind, OperationLog, OperationLogType};
use crate::parameters::ParameterContext;
use crate::query_task::QueryTask;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

impl Session {
    fn with_entities_mut<R>(&self, f: impl FnOnce(&mut EntityCache) -> Result<R>) -> Result<R> {
        let mut guard = self.lock();
        let SessionState {
            transaction,
            entities,
            ..
        } = &mut *guard;
        let transaction = transaction.as_ref().ok_or(OrmError::NoActiveTransaction)?;
        f(entities.state_mut(Some(transaction))?)
    }

    fn cached_entity(&self, key: &Key) -> Result<Option<EntityState>> {
        let mut guard = self.lock();
        let SessionState {
            transaction,
            entities,
            ..
        } = &mut *guard;
        let transaction = transaction.as_ref().ok_or(OrmError::NoActiveTransaction)?;
        Ok(entities.state(Some(transaction))?.get(key).cloned())
    }

    /// Number of entities cached for the current transaction
    pub fn cached_entity_count(&self) -> Result<usize> {
        self.with_entities_mut(|cache| Ok(cache.len()))
    }

    /// New key for an entity of `entity_type`
    ///
    /// Placeholder keys are handed out when the session generates temporary
    /// keys; otherwise ids come from the node's key sequence.
    pub fn generate_key(&self, entity_type: &str) -> Result<Key> {
        self.inner.lifetime_token.ensure_active()?;
        let registration = self.begin_operation_registration();
        let key = if self.inner.configuration.generate_temporary_keys {
            let mut state = self.lock();
            state.next_local_id += 1;
            Key::temporary(entity_type, state.next_local_id)
        } else {
            let sequence = self.inner.node.key_sequence(entity_type);
            let id = sequence.next_id(
                self.inner.handler.as_ref(),
                self.inner.configuration.key_cache_size,
            )?;
            Key::new(entity_type, id)
        };
        if registration.is_outermost() {
            self.log_operation(
                Operation::new(OperationKind::KeyGenerate { key: key.clone() }).identifying(&key),
            )?;
        }
        Ok(key)
    }

    /// Generate a key and create an entity with it
    pub fn new_entity(&self, entity_type: &str) -> Result<Key> {
        let key = self.generate_key(entity_type)?;
        self.create_entity(key.clone())?;
        Ok(key)
    }

    pub fn create_entity(&self, key: Key) -> Result<()> {
        let registration = self.begin_operation_registration();
        let state = EntityState::new(key.clone());
        self.with_entities_mut(|cache| {
            if cache.get(&key).is_some_and(|existing| !existing.is_removed()) {
                return Err(OrmError::EntityAlreadyExists(key.clone()));
            }
            cache.insert(state.clone());
            Ok(())
        })?;
        self.record_change(EntityChange::Insert(state));

        if registration.is_outermost() {
            let mut operation = Operation::new(OperationKind::EntityCreate { key: key.clone() })
                .with_undo(vec![Operation::new(OperationKind::EntityRemove {
                    key: key.clone(),
                })]);
            if key.is_temporary() {
                operation = operation.identifying(&key);
            }
            self.log_operation(operation)?;
        }
        Ok(())
    }

    pub fn set_field(&self, key: &Key, field: &str, value: Value) -> Result<()> {
        let registration = self.begin_operation_registration();
        let entity = self.fetch_entity(key)?;
        let previous = self.with_entities_mut(|cache| {
            let state = cache
                .get_mut(key)
                .ok_or_else(|| OrmError::EntityNotFound(key.clone()))?;
            Ok(state.set_field(field, value.clone()))
        })?;
        self.record_change(EntityChange::Update {
            key: key.clone(),
            field: field.to_string(),
            value: value.clone(),
        });

        if registration.is_outermost() {
            let undo = Operation::new(OperationKind::EntityFieldSet {
                key: key.clone(),
                field: field.to_string(),
                value: previous.unwrap_or_default(),
            });
            let operation = Operation::new(OperationKind::EntityFieldSet {
                key: key.clone(),
                field: field.to_string(),
                value,
            })
            .with_preceding(version_precondition(&entity))
            .with_undo(vec![undo]);
            self.log_operation(operation)?;
        }
        Ok(())
    }

    pub fn remove_entity(&self, key: &Key) -> Result<()> {
        let registration = self.begin_operation_registration();
        let entity = self.fetch_entity(key)?;
        self.with_entities_mut(|cache| {
            if let Some(state) = cache.get_mut(key) {
                state.mark_removed();
            }
            Ok(())
        })?;
        self.record_change(EntityChange::Remove(key.clone()));

        if registration.is_outermost() {
            let restore_fields = entity
                .fields()
                .iter()
                .map(|(field, value)| {
                    Operation::new(OperationKind::EntityFieldSet {
                        key: key.clone(),
                        field: field.clone(),
                        value: value.clone(),
                    })
                })
                .collect();
            let undo = Operation::new(OperationKind::EntityCreate { key: key.clone() })
                .with_following(restore_fields);
            let operation = Operation::new(OperationKind::EntityRemove { key: key.clone() })
                .with_preceding(version_precondition(&entity))
                .with_undo(vec![undo]);
            self.log_operation(operation)?;
        }
        Ok(())
    }

    /// Record that replaying the captured operations requires `key` to still
    /// have the version seen now
    pub fn check_version(&self, key: &Key) -> Result<()> {
        let registration = self.begin_operation_registration();
        let entity = self.fetch_entity(key)?;
        if registration.is_outermost() {
            for operation in version_precondition(&entity) {
                self.log_operation(operation)?;
            }
        }
        Ok(())
    }

    /// Fail with [`OrmError::VersionConflict`] when `key` no longer has `expected`
    pub fn verify_version(&self, key: &Key, expected: &VersionInfo) -> Result<()> {
        let entity = self.fetch_entity(key)?;
        if entity.version().conflicts_with(expected) {
            return Err(OrmError::VersionConflict(key.clone()));
        }
        Ok(())
    }

    /// Entity state, fetched from storage when not cached
    ///
    /// Removed entities and unknown placeholder keys yield `None`.
    pub fn get_entity(&self, key: &Key) -> Result<Option<EntityState>> {
        if let Some(state) = self.cached_entity(key)? {
            return Ok((!state.is_removed()).then_some(state));
        }
        if key.is_temporary() {
            return Ok(None);
        }
        self.prefetch(std::slice::from_ref(key))?;
        Ok(self
            .cached_entity(key)?
            .filter(|state| !state.is_removed()))
    }

    pub fn fetch_entity(&self, key: &Key) -> Result<EntityState> {
        self.get_entity(key)?
            .ok_or_else(|| OrmError::EntityNotFound(key.clone()))
    }

    /// Load every uncached entity in `keys` with one round-trip
    ///
    /// One fetch task per entity type is queued on the internal queue and the
    /// queue is drained once.
    pub fn prefetch(&self, keys: &[Key]) -> Result<()> {
        let mut missing: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for key in keys {
            if key.is_temporary() || self.cached_entity(key)?.is_some() {
                continue;
            }
            missing
                .entry(key.entity_type())
                .or_default()
                .push(Value::Key(key.clone()));
        }
        if missing.is_empty() {
            return Ok(());
        }

        let token = self.lifetime_token();
        let mut tasks = Vec::with_capacity(missing.len());
        for (entity_type, keys) in missing {
            let data_source = self
                .inner
                .node
                .entity_fetch_queries
                .get_or_try_add(entity_type.to_string(), || {
                    self.inner.handler.build_entity_fetch_query(entity_type)
                })?;
            let context = ParameterContext::new(None).with_value(keys_parameter(), Value::Tuple(keys));
            let task = Arc::new(QueryTask::new(data_source, token.clone(), Arc::new(context)));
            self.register_internal_delayed_query(task.clone());
            tasks.push(task);
        }
        _ = self.execute_internal_delayed_queries(false)?;

        let mut loaded = Vec::new();
        for task in &tasks {
            let rows = task.result().ok_or(OrmError::ResultNotAvailable)?;
            for row in rows.iter() {
                loaded.push(EntityState::from_row(row)?);
            }
        }
        let count = loaded.len();
        diagnostics::debug!("Prefetched {count} entities");
        self.with_entities_mut(|cache| {
            for state in loaded {
                if !cache.contains(state.key()) {
                    cache.insert(state);
                }
            }
            Ok(())
        })
    }

    /// Call `hook` after every entity change made outside system logic
    pub fn add_change_hook<F>(&self, hook: F)
    where
        F: Fn(&EntityChange) + Send + Sync + 'static,
    {
        let hook: ChangeHook = Arc::new(hook);
        self.lock().hooks.push(hook);
    }

    /// Check entities changed in the transaction when the outermost
    /// transaction commits
    pub fn add_validator<F>(&self, validator: F)
    where
        F: Fn(&EntityState) -> Result<()> + Send + Sync + 'static,
    {
        let validator: Validator = Arc::new(validator);
        self.lock().validators.push(validator);
    }

    /// Run validators over the entities changed so far
    ///
    /// Does nothing inside a system-logic-only region.
    pub fn validate(&self) -> Result<()> {
        let (validators, keys) = {
            let state = self.lock();
            if state.system_logic > 0 || state.validators.is_empty() {
                return Ok(());
            }
            (
                state.validators.clone(),
                state.changed_keys.iter().cloned().collect::<Vec<_>>(),
            )
        };
        for key in keys {
            let Some(entity) = self.cached_entity(&key)? else {
                continue;
            };
            if entity.is_removed() {
                continue;
            }
            for validator in &validators {
                validator(&entity)?;
            }
        }
        Ok(())
    }

    fn record_change(&self, change: EntityChange) {
        let hooks = {
            let mut state = self.lock();
            _ = state.changed_keys.insert(change.key().clone());
            state.pending.push(change.clone());
            if state.system_logic > 0 {
                Vec::new()
            } else {
                state.hooks.clone()
            }
        };
        for hook in hooks {
            hook(&change);
        }
    }

    /// Start recording operations produced by this session into a new log
    pub fn begin_operation_capture(&self, log_type: OperationLogType) -> Result<()> {
        let mut state = self.lock();
        if state.capture.is_some() {
            return Err(OrmError::OperationCaptureActive);
        }
        state.capture = Some(OperationLog::new(log_type));
        Ok(())
    }

    /// Stop recording and return the captured log
    pub fn end_operation_capture(&self) -> Option<OperationLog> {
        self.lock().capture.take()
    }

    #[must_use]
    pub fn is_capturing_operations(&self) -> bool {
        self.lock().capture.is_some()
    }

    fn log_operation(&self, operation: Operation) -> Result<()> {
        match self.lock().capture.as_mut() {
            Some(log) => log.log(operation),
            None => Ok(()),
        }
    }
}

fn version_precondition(entity: &EntityState) -> Vec<Operation> {
    if entity.version().is_void() {
        return Vec::new();
    }
    vec![Operation::new(OperationKind::VersionCheck {
        key: entity.key().clone(),
        version: entity.version().clone(),
    })]
}
