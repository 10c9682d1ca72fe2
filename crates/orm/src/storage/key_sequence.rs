// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use crate::handler::SessionHandler;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct KeyRange {
    next: i64,
    end: i64,
}

/// Range-cached id generator for one entity type
///
/// Ids are reserved from storage `cache_size` at a time; the remaining ids of
/// a range are handed out without further round-trips.
#[derive(Debug)]
pub struct KeySequence {
    entity_type: String,
    range: Mutex<KeyRange>,
}

impl KeySequence {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            range: Mutex::new(KeyRange::default()),
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn next_id(&self, handler: &dyn SessionHandler, cache_size: u32) -> Result<i64> {
        let mut range = self.range.lock().unwrap_or_else(PoisonError::into_inner);
        if range.next >= range.end {
            let first = handler.allocate_keys(&self.entity_type, cache_size)?;
            let entity_type = self.entity_type.as_str();
            diagnostics::debug!("Reserved {cache_size} keys for {entity_type} starting at {first}");
            range.next = first;
            range.end = first + i64::from(cache_size);
        }
        let id = range.next;
        range.next += 1;
        Ok(id)
    }

    /// Ids left in the reserved range
    #[must_use]
    pub fn remaining(&self) -> i64 {
        let range = self.range.lock().unwrap_or_else(PoisonError::into_inner);
        range.end - range.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHandler;

    #[test]
    fn test_reserves_ranges() {
        let handler = MemoryHandler::new();
        let sequence = KeySequence::new("Order");

        let ids: Vec<i64> = (0..5)
            .map(|_| sequence.next_id(&handler, 2).expect("id"))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(handler.key_allocations(), 3);
        assert_eq!(sequence.remaining(), 1);
    }
}
