// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::node::StorageNode;
use super::query_cache::CompiledQueryCache;
use crate::config::{DEFAULT_NODE_ID, DomainConfiguration, NodeConfiguration};
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Builds a storage node, preparing its storage first if needed
pub trait NodeBuilder: Send + Sync {
    fn build_node(&self, configuration: &NodeConfiguration) -> Result<StorageNode>;
}

/// Builder that only constructs the node
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNodeBuilder;

impl NodeBuilder for DefaultNodeBuilder {
    fn build_node(&self, configuration: &NodeConfiguration) -> Result<StorageNode> {
        Ok(StorageNode::new(configuration.clone()))
    }
}

/// Registry of the storage nodes of a domain
pub struct StorageNodeManager {
    configuration: Arc<DomainConfiguration>,
    builder: Arc<dyn NodeBuilder>,
    nodes: DashMap<String, Arc<StorageNode>>,
    query_cache: Arc<CompiledQueryCache>,
}

impl StorageNodeManager {
    pub fn new(
        configuration: Arc<DomainConfiguration>,
        builder: Arc<dyn NodeBuilder>,
        query_cache: Arc<CompiledQueryCache>,
    ) -> Self {
        Self {
            configuration,
            builder,
            nodes: DashMap::new(),
            query_cache,
        }
    }

    /// Build and register a node
    ///
    /// Returns `false` without building anything when the id is taken.
    pub fn add_node(&self, configuration: NodeConfiguration) -> Result<bool> {
        if self.nodes.contains_key(&configuration.node_id) {
            return Ok(false);
        }
        let node = Arc::new(self.builder.build_node(&configuration)?);
        match self.nodes.entry(configuration.node_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let node_id = node.id().to_string();
                _ = vacant.insert(node);
                diagnostics::info!("Storage node '{node_id}' added");
                Ok(true)
            }
        }
    }

    #[must_use]
    pub fn get_node(&self, node_id: &str) -> Option<Arc<StorageNode>> {
        self.nodes.get(node_id).map(|node| node.value().clone())
    }

    /// Unregister a node
    ///
    /// With `clear_query_cache`, compiled queries tagged with the node are
    /// purged as well, unless the cache is not partitioned by node in the
    /// first place. The default node cannot be removed.
    pub fn remove_node(&self, node_id: &str, clear_query_cache: bool) -> bool {
        if node_id == DEFAULT_NODE_ID {
            return false;
        }
        let Some((_, node)) = self.nodes.remove(node_id) else {
            return false;
        };
        if clear_query_cache && !self.configuration.shares_compiled_queries() {
            _ = self.query_cache.remove_node_entries(node_id);
        }
        node.clear_caches();
        diagnostics::info!("Storage node '{node_id}' removed");
        true
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|node| node.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn query_cache(&self) -> &Arc<CompiledQueryCache> {
        &self.query_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrmError;
    use crate::storage::CompiledQueryKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBuilder {
        built: AtomicUsize,
    }

    impl NodeBuilder for CountingBuilder {
        fn build_node(&self, configuration: &NodeConfiguration) -> Result<StorageNode> {
            if configuration.node_id == "broken" {
                return Err(OrmError::execution("upgrade failed"));
            }
            _ = self.built.fetch_add(1, Ordering::SeqCst);
            Ok(StorageNode::new(configuration.clone()))
        }
    }

    fn manager(configuration: DomainConfiguration) -> (StorageNodeManager, Arc<CountingBuilder>) {
        let builder = Arc::new(CountingBuilder {
            built: AtomicUsize::new(0),
        });
        let manager = StorageNodeManager::new(
            Arc::new(configuration),
            builder.clone(),
            Arc::new(CompiledQueryCache::new()),
        );
        (manager, builder)
    }

    #[test]
    fn test_add_get_remove() {
        let (manager, builder) = manager(DomainConfiguration::default());

        assert!(manager.add_node(NodeConfiguration::new("a")).expect("add"));
        assert!(!manager.add_node(NodeConfiguration::new("a")).expect("duplicate"));
        assert_eq!(builder.built.load(Ordering::SeqCst), 1);

        assert_eq!(manager.get_node("a").expect("node").id(), "a");
        assert!(manager.get_node("missing").is_none());

        assert!(manager.remove_node("a", false));
        assert!(!manager.remove_node("a", false));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_build_failure_registers_nothing() {
        let (manager, _) = manager(DomainConfiguration::default());
        assert!(manager.add_node(NodeConfiguration::new("broken")).is_err());
        assert!(manager.get_node("broken").is_none());
    }

    #[test]
    fn test_default_node_is_permanent() {
        let (manager, _) = manager(DomainConfiguration::default());
        assert!(manager.add_node(NodeConfiguration::new(DEFAULT_NODE_ID)).expect("add"));
        assert!(!manager.remove_node(DEFAULT_NODE_ID, true));
        assert!(manager.get_node(DEFAULT_NODE_ID).is_some());
    }

    #[test]
    fn test_remove_purges_partitioned_query_cache() {
        let (manager, _) = manager(DomainConfiguration::default());
        assert!(manager.add_node(NodeConfiguration::new("a")).expect("add"));
        let cache = manager.query_cache();
        let _: Arc<u8> = cache
            .get_or_add(CompiledQueryKey::new("q", Some("a".to_string())), || Ok(1))
            .expect("cache");

        assert!(manager.remove_node("a", true));
        assert!(cache.is_empty());
        assert_eq!(cache.key_scans(), 1);
    }
}
