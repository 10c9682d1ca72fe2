// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Transaction nesting, completion and the visibility relation

use crate::{Result, StateError, StateLifetimeToken};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    #[must_use]
    pub fn is_active(self) -> bool {
        self == TransactionState::Active
    }

    fn name(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        }
    }
}

/// A transaction, possibly nested inside an outer one
///
/// Handles are cheap clones of one shared transaction. Each transaction owns
/// a [`StateLifetimeToken`]:
/// - committing a nested transaction hands its token (and the tokens it
///   inherited) to the outer transaction, so state created inside stays
///   valid until the outer transaction ends
/// - committing the outermost transaction, or rolling back any transaction,
///   expires its own and inherited tokens
#[derive(Debug, Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

#[derive(Debug)]
struct TransactionInner {
    id: u64,
    outer: Option<Transaction>,
    state: Mutex<TransactionState>,
    lifetime_token: StateLifetimeToken,
    inherited_tokens: Mutex<Vec<StateLifetimeToken>>,
    active_nested: AtomicUsize,
}

impl Transaction {
    /// Begin a new outermost transaction
    #[must_use]
    pub fn begin() -> Self {
        Self::with_outer(None)
    }

    /// Begin a transaction nested in this one
    pub fn begin_nested(&self) -> Result<Transaction> {
        self.ensure_active()?;
        _ = self.inner.active_nested.fetch_add(1, Ordering::AcqRel);
        Ok(Self::with_outer(Some(self.clone())))
    }

    fn with_outer(outer: Option<Transaction>) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        let nested = outer.is_some();
        diagnostics::debug!("Transaction {id} started (nested: {nested})");
        Self {
            inner: Arc::new(TransactionInner {
                id,
                outer,
                state: Mutex::new(TransactionState::Active),
                lifetime_token: StateLifetimeToken::new(),
                inherited_tokens: Mutex::new(Vec::new()),
                active_nested: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.inner.outer.is_some()
    }

    #[must_use]
    pub fn outer(&self) -> Option<&Transaction> {
        self.inner.outer.as_ref()
    }

    #[must_use]
    pub fn outermost(&self) -> &Transaction {
        let mut current = self;
        while let Some(outer) = current.outer() {
            current = outer;
        }
        current
    }

    #[must_use]
    pub fn lifetime_token(&self) -> &StateLifetimeToken {
        &self.inner.lifetime_token
    }

    /// Whether both handles refer to the same transaction
    #[must_use]
    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether changes made in this transaction are visible to `other`
    ///
    /// Walks outwards from `self` through committed transactions until
    /// reaching `other` or the first uncommitted transaction; the changes are
    /// visible when that transaction is still active. Transactions in
    /// different outermost transactions never see each other's changes.
    #[must_use]
    pub fn are_changes_visible_to(&self, other: &Transaction) -> bool {
        if !self.outermost().same_as(other.outermost()) {
            return false;
        }
        let mut current = self;
        while !current.same_as(other) && current.state() == TransactionState::Committed {
            match current.outer() {
                Some(outer) => current = outer,
                None => break,
            }
        }
        current.is_active()
    }

    pub fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(StateError::TransactionNotActive {
                id: self.id(),
                state: state.name(),
            })
        }
    }

    /// Commit the transaction
    pub fn commit(&self) -> Result<()> {
        self.complete(TransactionState::Committed)?;

        let mut tokens = self.take_tokens();
        match self.outer() {
            Some(outer) => outer
                .inner
                .inherited_tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .append(&mut tokens),
            None => tokens.iter().for_each(StateLifetimeToken::expire),
        }
        let id = self.id();
        diagnostics::debug!("Transaction {id} committed");
        Ok(())
    }

    /// Roll the transaction back, expiring everything bound to it
    pub fn rollback(&self) -> Result<()> {
        self.complete(TransactionState::RolledBack)?;
        self.take_tokens().iter().for_each(StateLifetimeToken::expire);
        let id = self.id();
        diagnostics::debug!("Transaction {id} rolled back");
        Ok(())
    }

    fn complete(&self, target: TransactionState) -> Result<()> {
        if self.inner.active_nested.load(Ordering::Acquire) > 0 {
            return Err(StateError::NestedTransactionActive { id: self.id() });
        }
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.is_active() {
                return Err(StateError::TransactionNotActive {
                    id: self.id(),
                    state: state.name(),
                });
            }
            *state = target;
        }
        if let Some(outer) = self.outer() {
            _ = outer.inner.active_nested.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn take_tokens(&self) -> Vec<StateLifetimeToken> {
        let mut tokens = std::mem::take(
            &mut *self
                .inner
                .inherited_tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tokens.push(self.inner.lifetime_token.clone());
        tokens
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Transaction {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outermost_commit_expires_token() {
        let tx = Transaction::begin();
        let token = tx.lifetime_token().clone();
        assert!(token.is_active());

        tx.commit().expect("commit");
        assert!(!token.is_active());
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_nested_commit_hands_token_to_outer() {
        let outer = Transaction::begin();
        let nested = outer.begin_nested().expect("nested");
        let token = nested.lifetime_token().clone();

        nested.commit().expect("commit nested");
        assert!(token.is_active(), "inherited by the outer transaction");

        outer.commit().expect("commit outer");
        assert!(!token.is_active());
    }

    #[test]
    fn test_nested_rollback_expires_token() {
        let outer = Transaction::begin();
        let nested = outer.begin_nested().expect("nested");
        let inner = nested.begin_nested().expect("inner");
        let inner_token = inner.lifetime_token().clone();

        inner.commit().expect("commit inner");
        nested.rollback().expect("rollback nested");

        assert!(!inner_token.is_active());
        assert!(outer.lifetime_token().is_active());
    }

    #[test]
    fn test_cannot_complete_with_active_nested() {
        let outer = Transaction::begin();
        let _nested = outer.begin_nested().expect("nested");
        assert_eq!(
            outer.commit(),
            Err(StateError::NestedTransactionActive { id: outer.id() })
        );
        assert!(outer.is_active());
    }

    #[test]
    fn test_completed_transaction_rejects_completion() {
        let tx = Transaction::begin();
        tx.rollback().expect("rollback");
        assert!(matches!(
            tx.commit(),
            Err(StateError::TransactionNotActive { .. })
        ));
        assert!(tx.begin_nested().is_err());
    }

    #[test]
    fn test_visibility() {
        let outer = Transaction::begin();
        let nested = outer.begin_nested().expect("nested");

        assert!(outer.are_changes_visible_to(&outer));
        assert!(nested.are_changes_visible_to(&nested));
        // the walk stops at the still-active nested transaction
        assert!(nested.are_changes_visible_to(&outer));

        nested.commit().expect("commit");
        assert!(nested.are_changes_visible_to(&outer));

        let second = outer.begin_nested().expect("second");
        second.rollback().expect("rollback");
        assert!(!second.are_changes_visible_to(&outer));

        let unrelated = Transaction::begin();
        assert!(!outer.are_changes_visible_to(&unrelated));

        outer.commit().expect("commit outer");
        assert!(!outer.are_changes_visible_to(&outer));
    }
}
