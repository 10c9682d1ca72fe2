// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Sessions: the unit of work owning query queues, transactions and cached
//! entities
//!
//! A session is meant to be driven by one logical thread of control. Async
//! methods must be awaited one at a time; the session does not serialize
//! concurrent calls beyond keeping its own state consistent.

mod entities;
mod queries;
mod transaction;

pub use queries::QueryQueue;
pub use transaction::TransactionScope;

use crate::config::SessionConfiguration;
use crate::entity::{EntityCache, EntityChange, EntityState};
use crate::error::Result;
use crate::handler::SessionHandler;
use crate::key::Key;
use crate::operations::OperationLog;
use crate::query_result::ReaderLease;
use crate::query_task::QueryTask;
use crate::storage::{CompiledQueryCache, StorageNode};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use txstate::{StateLifetimeToken, Transaction, TransactionalStateContainer};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type ChangeHook = Arc<dyn Fn(&EntityChange) + Send + Sync>;
type Validator = Arc<dyn Fn(&EntityState) -> Result<()> + Send + Sync>;

/// Handle to a session; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    configuration: SessionConfiguration,
    handler: Arc<dyn SessionHandler>,
    node: Arc<StorageNode>,
    query_cache: Arc<CompiledQueryCache>,
    /// Node partition of compiled query cache keys
    query_cache_node: Option<String>,
    lifetime_token: StateLifetimeToken,
    active_readers: Arc<AtomicUsize>,
    state: Mutex<SessionState>,
}

struct SessionState {
    /// Innermost open transaction
    transaction: Option<Transaction>,
    user_queue: Vec<Arc<QueryTask>>,
    internal_queue: Vec<Arc<QueryTask>>,
    entities: TransactionalStateContainer<EntityCache>,
    pending: Vec<EntityChange>,
    /// Entities changed in the current outermost transaction
    changed_keys: BTreeSet<Key>,
    next_local_id: i64,
    registering: usize,
    system_logic: usize,
    capture: Option<OperationLog>,
    hooks: Vec<ChangeHook>,
    validators: Vec<Validator>,
}

impl Session {
    pub(crate) fn new(
        configuration: SessionConfiguration,
        handler: Arc<dyn SessionHandler>,
        node: Arc<StorageNode>,
        query_cache: Arc<CompiledQueryCache>,
        query_cache_node: Option<String>,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let lifetime_token = StateLifetimeToken::new();
        let name = configuration.name.clone();
        let node_id = node.id().to_string();
        diagnostics::info!("Session {id} ({name}) opened on node '{node_id}'");

        Self {
            inner: Arc::new(SessionInner {
                id,
                configuration,
                handler,
                node,
                query_cache,
                query_cache_node,
                active_readers: Arc::new(AtomicUsize::new(0)),
                state: Mutex::new(SessionState {
                    transaction: None,
                    user_queue: Vec::new(),
                    internal_queue: Vec::new(),
                    entities: TransactionalStateContainer::with_default(lifetime_token.clone()),
                    pending: Vec::new(),
                    changed_keys: BTreeSet::new(),
                    next_local_id: 0,
                    registering: 0,
                    system_logic: 0,
                    capture: None,
                    hooks: Vec::new(),
                    validators: Vec::new(),
                }),
                lifetime_token,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn configuration(&self) -> &SessionConfiguration {
        &self.inner.configuration
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn SessionHandler> {
        &self.inner.handler
    }

    #[must_use]
    pub fn storage_node(&self) -> &Arc<StorageNode> {
        &self.inner.node
    }

    /// Token of the innermost open transaction, or of the session itself
    /// outside transactions
    #[must_use]
    pub fn lifetime_token(&self) -> StateLifetimeToken {
        match &self.lock().transaction {
            Some(transaction) => transaction.lifetime_token().clone(),
            None => self.inner.lifetime_token.clone(),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.inner.lifetime_token.is_active()
    }

    /// Roll back open transactions, drop queued work and expire the session
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let outermost = self
            .lock()
            .transaction
            .as_ref()
            .map(|transaction| transaction.outermost().clone());
        if let Some(transaction) = outermost {
            self.rollback_transaction(&transaction)?;
        }
        {
            let mut state = self.lock();
            state.user_queue.clear();
            state.internal_queue.clear();
            state.pending.clear();
            state.capture = None;
        }
        self.inner.lifetime_token.expire();
        let id = self.inner.id;
        diagnostics::info!("Session {id} closed");
        Ok(())
    }

    /// Number of materialized results still holding a reader
    #[must_use]
    pub fn active_readers(&self) -> usize {
        self.inner.active_readers.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_reader_lease(&self) -> ReaderLease {
        ReaderLease::acquire(self.inner.active_readers.clone())
    }

    /// Mark the start of an operation registration
    ///
    /// Operations are logged only by the outermost registration; anything
    /// the operation does internally is part of it.
    #[must_use]
    pub fn begin_operation_registration(&self) -> OperationRegistration<'_> {
        let mut state = self.lock();
        state.registering += 1;
        OperationRegistration {
            session: self,
            outermost: state.registering == 1,
        }
    }

    #[must_use]
    pub fn is_registering_operation(&self) -> bool {
        self.lock().registering > 0
    }

    /// Suppress change hooks and validation until the guard is dropped
    #[must_use]
    pub fn system_logic_only(&self) -> SystemLogicGuard<'_> {
        self.lock().system_logic += 1;
        SystemLogicGuard { session: self }
    }

    #[must_use]
    pub fn is_system_logic_only(&self) -> bool {
        self.lock().system_logic > 0
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.configuration.name)
            .field("node", &self.inner.node.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Guard returned by [`Session::begin_operation_registration`]
pub struct OperationRegistration<'a> {
    session: &'a Session,
    outermost: bool,
}

impl OperationRegistration<'_> {
    #[must_use]
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl Drop for OperationRegistration<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.registering = state.registering.saturating_sub(1);
    }
}

/// Guard returned by [`Session::system_logic_only`]
pub struct SystemLogicGuard<'a> {
    session: &'a Session,
}

impl Drop for SystemLogicGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.system_logic = state.system_logic.saturating_sub(1);
    }
}
