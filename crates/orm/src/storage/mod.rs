// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Storage nodes and the caches partitioned by them

mod cache;
mod key_sequence;
mod manager;
mod node;
mod query_cache;

pub use cache::{CacheCounters, NodeCache};
pub use key_sequence::KeySequence;
pub use manager::{DefaultNodeBuilder, NodeBuilder, StorageNodeManager};
pub use node::{
    AssociationKey, EntitySetTypeState, LockBehavior, LockKey, LockMode, PersistPlanKey,
    StorageMapping, StorageNode, TypeIdRegistry,
};
pub use query_cache::{CompiledQueryCache, CompiledQueryKey};
