// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::Session;
use crate::entity::EntityChange;
use crate::error::{OrmError, Result};
use crate::handler::PersistReason;
use txstate::{StateLifetimeToken, Transaction};

/// Open transaction of a session
///
/// Must be finished with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). Dropping an unfinished scope rolls the
/// transaction back.
pub struct TransactionScope {
    session: Session,
    transaction: Transaction,
    completed: bool,
}

impl TransactionScope {
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    #[must_use]
    pub fn lifetime_token(&self) -> &StateLifetimeToken {
        self.transaction.lifetime_token()
    }

    /// Persist, validate and commit
    ///
    /// A failed commit rolls the transaction back.
    pub fn commit(mut self) -> Result<()> {
        self.completed = true;
        self.session.commit_transaction(&self.transaction)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.session.rollback_transaction(&self.transaction)
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.completed || !self.transaction.is_active() {
            return;
        }
        let id = self.transaction.id();
        diagnostics::warn!("Transaction {id} dropped without commit, rolling back");
        if let Err(err) = self.session.rollback_transaction(&self.transaction) {
            let message = err.to_string();
            diagnostics::error!("Rollback of transaction {id} failed: {message}");
        }
    }
}

impl Session {
    /// Current innermost transaction, if any
    #[must_use]
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.lock().transaction.clone()
    }

    /// Open a transaction, nested in the current one if there is one
    ///
    /// Pending changes are persisted before a nested transaction starts.
    pub fn open_transaction(&self) -> Result<TransactionScope> {
        self.inner.lifetime_token.ensure_active()?;
        let transaction = match self.current_transaction() {
            Some(outer) => {
                outer.ensure_active()?;
                self.persist(PersistReason::NestedTransaction)?;
                let nested = outer.begin_nested()?;
                if let Err(err) = self.inner.handler.begin_transaction(true) {
                    if let Err(rollback) = nested.rollback() {
                        let id = nested.id();
                        let message = rollback.to_string();
                        diagnostics::error!("Rollback of transaction {id} failed: {message}");
                    }
                    return Err(err);
                }
                nested
            }
            None => {
                self.inner.handler.begin_transaction(false)?;
                Transaction::begin()
            }
        };
        self.lock().transaction = Some(transaction.clone());

        let id = transaction.id();
        let nested = transaction.is_nested();
        diagnostics::info!("Transaction {id} opened (nested: {nested})");
        Ok(TransactionScope {
            session: self.clone(),
            transaction,
            completed: false,
        })
    }

    fn ensure_innermost(&self, transaction: &Transaction) -> Result<()> {
        match &self.lock().transaction {
            Some(current) if current.same_as(transaction) => Ok(()),
            _ => Err(OrmError::TransactionNotInnermost {
                id: transaction.id(),
            }),
        }
    }

    pub(crate) fn commit_transaction(&self, transaction: &Transaction) -> Result<()> {
        let result = self.try_commit(transaction);
        if let Err(err) = &result {
            let id = transaction.id();
            let message = err.to_string();
            diagnostics::warn!("Commit of transaction {id} failed: {message}");
            if transaction.is_active() && self.ensure_innermost(transaction).is_ok() {
                if let Err(rollback) = self.rollback_transaction(transaction) {
                    let message = rollback.to_string();
                    diagnostics::error!("Rollback of transaction {id} failed: {message}");
                }
            }
        }
        result
    }

    fn try_commit(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_innermost(transaction)?;
        transaction.ensure_active()?;
        let nested = transaction.is_nested();

        self.persist(if nested {
            PersistReason::NestedTransaction
        } else {
            PersistReason::Commit
        })?;
        if !nested {
            self.validate()?;
        }
        self.inner.handler.commit_transaction(nested)?;
        transaction.commit()?;

        {
            let mut state = self.lock();
            state.transaction = transaction.outer().cloned();
            if !nested {
                state.changed_keys.clear();
            }
        }
        let id = transaction.id();
        diagnostics::info!("Transaction {id} committed");
        Ok(())
    }

    /// Roll back `transaction` and every transaction nested in it
    ///
    /// Unpersisted changes are discarded. Rolling back a transaction that is
    /// no longer active does nothing.
    pub(crate) fn rollback_transaction(&self, transaction: &Transaction) -> Result<()> {
        if !transaction.is_active() {
            return Ok(());
        }
        if !self.is_open_transaction(transaction) {
            return Err(OrmError::TransactionNotInnermost {
                id: transaction.id(),
            });
        }
        while let Some(current) = self.current_transaction() {
            let nested = current.is_nested();
            self.lock().pending.clear();
            let notified = self.inner.handler.rollback_transaction(nested);
            current.rollback()?;
            {
                let mut state = self.lock();
                state.transaction = current.outer().cloned();
                if !nested {
                    state.changed_keys.clear();
                }
            }
            let id = current.id();
            diagnostics::info!("Transaction {id} rolled back");
            notified?;
            if current.same_as(transaction) {
                break;
            }
        }
        Ok(())
    }

    /// Whether `transaction` is the innermost transaction or one of its outers
    fn is_open_transaction(&self, transaction: &Transaction) -> bool {
        let mut current = self.current_transaction();
        while let Some(candidate) = current {
            if candidate.same_as(transaction) {
                return true;
            }
            current = candidate.outer().cloned();
        }
        false
    }

    /// Flush pending changes to the handler
    ///
    /// Nothing is sent when there are no changes. On failure the changes stay
    /// pending.
    pub fn persist(&self, reason: PersistReason) -> Result<()> {
        let changes = self.take_pending();
        if changes.is_empty() {
            return Ok(());
        }
        self.log_persist(&changes, reason);
        let result = self.inner.handler.persist(&changes, reason);
        if result.is_err() {
            self.restore_pending(changes);
        }
        result
    }

    pub async fn persist_async(&self, reason: PersistReason) -> Result<()> {
        let changes = self.take_pending();
        if changes.is_empty() {
            return Ok(());
        }
        self.log_persist(&changes, reason);
        let result = self.inner.handler.persist_async(&changes, reason).await;
        if result.is_err() {
            self.restore_pending(changes);
        }
        result
    }

    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.lock().pending.len()
    }

    fn take_pending(&self) -> Vec<EntityChange> {
        std::mem::take(&mut self.lock().pending)
    }

    fn restore_pending(&self, mut changes: Vec<EntityChange>) {
        let mut state = self.lock();
        changes.append(&mut state.pending);
        state.pending = changes;
    }

    fn log_persist(&self, changes: &[EntityChange], reason: PersistReason) {
        let count = changes.len();
        let reason = reason.to_string();
        diagnostics::debug!("Persisting {count} changes ({reason})");
    }
}
