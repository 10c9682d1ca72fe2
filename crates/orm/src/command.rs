// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Tracking of command processor contexts handed out to batch executions

use dashmap::DashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out command processor contexts and tracks the live ones
///
/// A context is registered when provided and removed when it is dropped, so
/// an execution that fails or unwinds still unregisters its context.
#[derive(Debug, Default)]
pub struct CommandProcessorContextProvider {
    active: Arc<DashSet<u64>>,
    next_id: AtomicU64,
}

impl CommandProcessorContextProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provide(&self, allow_partial_execution: bool) -> CommandProcessorContext {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        _ = self.active.insert(id);
        CommandProcessorContext {
            id,
            allow_partial_execution,
            active: self.active.clone(),
        }
    }

    /// Number of contexts provided and not yet dropped
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// One batch execution's context
#[derive(Debug)]
pub struct CommandProcessorContext {
    id: u64,
    allow_partial_execution: bool,
    active: Arc<DashSet<u64>>,
}

impl CommandProcessorContext {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn allow_partial_execution(&self) -> bool {
        self.allow_partial_execution
    }
}

impl Drop for CommandProcessorContext {
    fn drop(&mut self) {
        _ = self.active.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_unregister_on_drop() {
        let provider = CommandProcessorContextProvider::new();
        let first = provider.provide(false);
        let second = provider.provide(true);
        assert_ne!(first.id(), second.id());
        assert!(second.allow_partial_execution());
        assert_eq!(provider.active_count(), 2);

        drop(first);
        assert_eq!(provider.active_count(), 1);
        drop(second);
        assert_eq!(provider.active_count(), 0);
    }

    #[test]
    fn test_context_released_on_unwind() {
        let provider = CommandProcessorContextProvider::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _context = provider.provide(false);
            panic!("batch failed");
        }));
        assert!(result.is_err());
        assert_eq!(provider.active_count(), 0);
    }
}
