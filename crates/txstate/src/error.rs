// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("This instance is expired due to transaction boundaries")]
    Expired,

    #[error("Transaction {id} is not active ({state})")]
    TransactionNotActive { id: u64, state: &'static str },

    #[error("Transaction {id} has an active nested transaction")]
    NestedTransactionActive { id: u64 },
}
