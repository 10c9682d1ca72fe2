// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::cache::NodeCache;
use super::key_sequence::KeySequence;
use crate::config::NodeConfiguration;
use crate::entity::ChangeKind;
use crate::query_task::DataSource;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockBehavior {
    Wait,
    ThrowIfLocked,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub entity_type: String,
    pub mode: LockMode,
    pub behavior: LockBehavior,
}

/// Owner type and field of an association
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    pub owner_type: String,
    pub field: String,
}

impl AssociationKey {
    pub fn new(owner_type: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistPlanKey {
    pub entity_type: String,
    pub kind: ChangeKind,
}

/// Shape of an entity set, shared by every owner of the association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySetTypeState {
    pub item_type: String,
    /// Items loaded eagerly with the owner
    pub prefetch_limit: usize,
}

/// Where logical names resolve to on this node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageMapping {
    default_schema: Option<String>,
    schemas: Vec<(String, String)>,
    databases: Vec<(String, String)>,
}

impl StorageMapping {
    #[must_use]
    pub fn from_configuration(configuration: &NodeConfiguration) -> Self {
        Self {
            default_schema: configuration.default_schema.clone(),
            schemas: configuration
                .schema_mapping
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            databases: configuration
                .database_mapping
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Physical schema for `logical`, defaulting to the name itself
    #[must_use]
    pub fn schema<'a>(&'a self, logical: &'a str) -> &'a str {
        self.schemas
            .iter()
            .find(|(from, _)| from == logical)
            .map_or(logical, |(_, to)| to.as_str())
    }

    #[must_use]
    pub fn database<'a>(&'a self, logical: &'a str) -> &'a str {
        self.databases
            .iter()
            .find(|(from, _)| from == logical)
            .map_or(logical, |(_, to)| to.as_str())
    }

    #[must_use]
    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }
}

/// Type ids assigned on first use, stable for the node's lifetime
#[derive(Debug, Default)]
pub struct TypeIdRegistry {
    ids: DashMap<String, i32>,
    next: AtomicI32,
}

impl TypeIdRegistry {
    pub fn type_id(&self, entity_type: &str) -> i32 {
        if let Some(id) = self.ids.get(entity_type) {
            return *id;
        }
        *self
            .ids
            .entry(entity_type.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One logical tenant: its configuration and the compiled artifacts cached
/// for it
///
/// Sessions opened on the same node share these caches; nothing here is
/// visible to other nodes.
#[derive(Debug)]
pub struct StorageNode {
    id: String,
    configuration: NodeConfiguration,
    mapping: StorageMapping,
    type_ids: TypeIdRegistry,

    pub entity_lock_providers: NodeCache<LockKey, Arc<dyn DataSource>>,
    pub entity_fetch_queries: NodeCache<String, Arc<dyn DataSource>>,
    pub entity_set_fetch_queries: NodeCache<AssociationKey, Arc<dyn DataSource>>,
    pub entity_set_type_states: NodeCache<AssociationKey, EntitySetTypeState>,
    pub ref_to_entity_queries: NodeCache<AssociationKey, Arc<dyn DataSource>>,
    pub key_sequences: NodeCache<String, Arc<KeySequence>>,
    pub persist_request_plans: NodeCache<PersistPlanKey, Arc<dyn DataSource>>,
}

impl StorageNode {
    #[must_use]
    pub fn new(configuration: NodeConfiguration) -> Self {
        Self {
            id: configuration.node_id.clone(),
            mapping: StorageMapping::from_configuration(&configuration),
            configuration,
            type_ids: TypeIdRegistry::default(),
            entity_lock_providers: NodeCache::new(),
            entity_fetch_queries: NodeCache::new(),
            entity_set_fetch_queries: NodeCache::new(),
            entity_set_type_states: NodeCache::new(),
            ref_to_entity_queries: NodeCache::new(),
            key_sequences: NodeCache::new(),
            persist_request_plans: NodeCache::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn configuration(&self) -> &NodeConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn mapping(&self) -> &StorageMapping {
        &self.mapping
    }

    #[must_use]
    pub fn type_ids(&self) -> &TypeIdRegistry {
        &self.type_ids
    }

    /// Key sequence for `entity_type`, created on first use
    #[must_use]
    pub fn key_sequence(&self, entity_type: &str) -> Arc<KeySequence> {
        self.key_sequences.add_or_update(
            entity_type.to_string(),
            || Arc::new(KeySequence::new(entity_type)),
            |_| {},
        )
    }

    /// Entries across every cache of the node
    #[must_use]
    pub fn cached_entry_count(&self) -> usize {
        self.entity_lock_providers.len()
            + self.entity_fetch_queries.len()
            + self.entity_set_fetch_queries.len()
            + self.entity_set_type_states.len()
            + self.ref_to_entity_queries.len()
            + self.key_sequences.len()
            + self.persist_request_plans.len()
    }

    pub fn clear_caches(&self) {
        self.entity_lock_providers.clear();
        self.entity_fetch_queries.clear();
        self.entity_set_fetch_queries.clear();
        self.entity_set_type_states.clear();
        self.ref_to_entity_queries.clear();
        self.key_sequences.clear();
        self.persist_request_plans.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDataSource;

    #[test]
    fn test_caches_are_per_node() {
        let a = StorageNode::new(NodeConfiguration::new("a"));
        let b = StorageNode::new(NodeConfiguration::new("b"));

        let lock = LockKey {
            entity_type: "Order".to_string(),
            mode: LockMode::Exclusive,
            behavior: LockBehavior::Wait,
        };
        let source: Arc<dyn DataSource> = Arc::new(MemoryDataSource::entity_scan("Order"));
        _ = a
            .entity_lock_providers
            .get_or_try_add(lock.clone(), || Ok(source.clone()))
            .expect("add");
        _ = a.entity_set_type_states.add_or_update(
            AssociationKey::new("Order", "lines"),
            || EntitySetTypeState {
                item_type: "OrderLine".to_string(),
                prefetch_limit: 32,
            },
            |_| {},
        );

        assert!(a.entity_lock_providers.get(&lock).is_some());
        assert!(b.entity_lock_providers.get(&lock).is_none());
        assert_eq!(a.cached_entry_count(), 2);

        a.clear_caches();
        assert_eq!(a.cached_entry_count(), 0);
    }

    #[test]
    fn test_key_sequence_is_shared() {
        let node = StorageNode::new(NodeConfiguration::new("a"));
        let first = node.key_sequence("Order");
        let second = node.key_sequence("Order");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(node.key_sequences.len(), 1);
    }

    #[test]
    fn test_mapping_and_type_ids() {
        let mut configuration = NodeConfiguration::new("tenant");
        configuration.default_schema = Some("dbo".to_string());
        _ = configuration
            .schema_mapping
            .insert("main".to_string(), "tenant_main".to_string());
        let node = StorageNode::new(configuration);

        assert_eq!(node.mapping().schema("main"), "tenant_main");
        assert_eq!(node.mapping().schema("other"), "other");
        assert_eq!(node.mapping().default_schema(), Some("dbo"));

        let order = node.type_ids().type_id("Order");
        let customer = node.type_ids().type_id("Customer");
        assert_ne!(order, customer);
        assert_eq!(node.type_ids().type_id("Order"), order);
        assert_eq!(node.type_ids().len(), 2);
    }
}
