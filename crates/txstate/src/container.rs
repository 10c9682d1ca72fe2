// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, StateLifetimeToken, Transaction};

type Refresh<S> = Box<dyn Fn() -> S + Send + Sync>;

/// Per-transaction cache cell
///
/// The state is actual only while it is bound to a transaction whose changes
/// are visible to the currently active transaction. Reading stale state runs
/// the refresh callback first; writing rebinds the cell to the current
/// transaction. Outside of any transaction nothing is considered actual.
pub struct TransactionalStateContainer<S> {
    lifetime_token: StateLifetimeToken,
    state: Option<S>,
    bound_to: Option<Transaction>,
    refresh: Refresh<S>,
    refreshes: u64,
}

impl<S> TransactionalStateContainer<S> {
    pub fn new<F>(lifetime_token: StateLifetimeToken, refresh: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            lifetime_token,
            state: None,
            bound_to: None,
            refresh: Box::new(refresh),
            refreshes: 0,
        }
    }

    #[must_use]
    pub fn lifetime_token(&self) -> &StateLifetimeToken {
        &self.lifetime_token
    }

    /// Transaction the current state was produced in
    #[must_use]
    pub fn bound_transaction(&self) -> Option<&Transaction> {
        self.bound_to.as_ref()
    }

    /// Number of times the refresh callback ran
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    #[must_use]
    pub fn is_actual(&self, current: Option<&Transaction>) -> bool {
        match (&self.state, &self.bound_to, current) {
            (Some(_), Some(bound), Some(current)) => bound.are_changes_visible_to(current),
            _ => false,
        }
    }

    /// Current state, refreshed first when stale
    pub fn state(&mut self, current: Option<&Transaction>) -> Result<&S> {
        self.refresh_if_stale(current)?;
        Ok(self.slot())
    }

    /// Mutable access; the state is rebound to `current` like a write
    pub fn state_mut(&mut self, current: Option<&Transaction>) -> Result<&mut S> {
        self.refresh_if_stale(current)?;
        self.bound_to = current.cloned();
        Ok(self.slot())
    }

    /// Replace the state, binding it to `current` unconditionally
    pub fn set_state(&mut self, state: S, current: Option<&Transaction>) -> Result<()> {
        self.lifetime_token.ensure_active()?;
        self.state = Some(state);
        self.bound_to = current.cloned();
        Ok(())
    }

    /// Drop the state so the next read refreshes
    pub fn invalidate(&mut self) {
        self.state = None;
        self.bound_to = None;
    }

    fn refresh_if_stale(&mut self, current: Option<&Transaction>) -> Result<()> {
        self.lifetime_token.ensure_active()?;
        if !self.is_actual(current) {
            self.state = Some((self.refresh)());
            self.bound_to = current.cloned();
            self.refreshes += 1;
        }
        Ok(())
    }

    fn slot(&mut self) -> &mut S {
        self.state.get_or_insert_with(|| (self.refresh)())
    }
}

impl<S: Default + 'static> TransactionalStateContainer<S> {
    /// Container whose refresh resets to `S::default()`
    pub fn with_default(lifetime_token: StateLifetimeToken) -> Self {
        Self::new(lifetime_token, S::default)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for TransactionalStateContainer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalStateContainer")
            .field("state", &self.state)
            .field("bound_to", &self.bound_to.as_ref().map(Transaction::id))
            .field("refreshes", &self.refreshes)
            .finish()
    }
}

/// A value calculated at most once per visible transaction
pub struct TransactionalValue<T> {
    container: TransactionalStateContainer<T>,
}

impl<T> TransactionalValue<T> {
    pub fn new<F>(lifetime_token: StateLifetimeToken, calculator: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            container: TransactionalStateContainer::new(lifetime_token, calculator),
        }
    }

    pub fn value(&mut self, current: Option<&Transaction>) -> Result<&T> {
        self.container.state(current)
    }

    #[must_use]
    pub fn calculation_count(&self) -> u64 {
        self.container.refresh_count()
    }

    pub fn invalidate(&mut self) {
        self.container.invalidate();
    }
}
