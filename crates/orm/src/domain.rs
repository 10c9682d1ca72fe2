// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Entry point: storage nodes of a configuration and the sessions opened on
//! them

use crate::config::{DEFAULT_NODE_ID, DomainConfiguration, NodeConfiguration, validate_config};
use crate::error::{OrmError, Result};
use crate::handler::SessionHandler;
use crate::session::Session;
use crate::storage::{CompiledQueryCache, DefaultNodeBuilder, NodeBuilder, StorageNodeManager};
use std::sync::Arc;

pub struct Domain {
    configuration: Arc<DomainConfiguration>,
    nodes: StorageNodeManager,
    query_cache: Arc<CompiledQueryCache>,
}

impl Domain {
    /// Validate `configuration` and build its nodes
    ///
    /// The default node is always present, configured or not.
    pub fn build(configuration: DomainConfiguration, builder: Arc<dyn NodeBuilder>) -> Result<Self> {
        validate_config(&configuration)?;
        let configuration = Arc::new(configuration);
        let query_cache = Arc::new(CompiledQueryCache::new());
        let nodes = StorageNodeManager::new(configuration.clone(), builder, query_cache.clone());

        _ = nodes.add_node(NodeConfiguration::new(DEFAULT_NODE_ID))?;
        for node in &configuration.nodes {
            _ = nodes.add_node(node.clone())?;
        }

        let count = nodes.len();
        let shared = configuration.shares_compiled_queries();
        diagnostics::info!("Domain built with {count} storage nodes (shared compiled queries: {shared})");
        Ok(Self {
            configuration,
            nodes,
            query_cache,
        })
    }

    pub fn open(configuration: DomainConfiguration) -> Result<Self> {
        Self::build(configuration, Arc::new(DefaultNodeBuilder))
    }

    #[must_use]
    pub fn configuration(&self) -> &DomainConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn nodes(&self) -> &StorageNodeManager {
        &self.nodes
    }

    #[must_use]
    pub fn query_cache(&self) -> &Arc<CompiledQueryCache> {
        &self.query_cache
    }

    /// Open a session on `node_id` backed by `handler`
    pub fn open_session(&self, node_id: &str, handler: Arc<dyn SessionHandler>) -> Result<Session> {
        let node = self
            .nodes
            .get_node(node_id)
            .ok_or_else(|| OrmError::NodeNotFound(node_id.to_string()))?;
        let query_cache_node =
            (!self.configuration.shares_compiled_queries()).then(|| node_id.to_string());
        Ok(Session::new(
            self.configuration.session.clone(),
            handler,
            node,
            self.query_cache.clone(),
            query_cache_node,
        ))
    }
}
