// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, StateError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness flag shared by everything created inside one transactional scope
///
/// Clones share the same flag. The only transition is Active -> Inactive;
/// an expired token is never reactivated.
#[derive(Debug, Clone)]
pub struct StateLifetimeToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    id: u64,
    active: AtomicBool,
}

impl StateLifetimeToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                active: AtomicBool::new(true),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Expire the token. Idempotent.
    pub fn expire(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            let token = self.inner.id;
            diagnostics::debug!("Lifetime token {token} expired");
        }
    }

    /// Fail with [`StateError::Expired`] once the token is inactive
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StateError::Expired)
        }
    }

    /// Whether both handles refer to the same token
    #[must_use]
    pub fn same_as(&self, other: &StateLifetimeToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for StateLifetimeToken {
    fn default() -> Self {
        Self::new()
    }
}
