// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Transaction-scoped state for the ORM runtime
//!
//! Everything created inside a transactional scope holds a
//! [`StateLifetimeToken`] captured at construction. When the scope ends the
//! token expires and every holder starts failing with [`StateError::Expired`].
//! [`TransactionalStateContainer`] memoizes a value per transaction and
//! refreshes it whenever the producing transaction's changes are not visible
//! to the current one.

mod container;
mod error;
mod lifetime;
mod transaction;

pub use container::{TransactionalStateContainer, TransactionalValue};
pub use error::{Result, StateError};
pub use lifetime::StateLifetimeToken;
pub use transaction::{Transaction, TransactionState};
