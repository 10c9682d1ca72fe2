// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::{OrmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Id of the node every domain starts with
pub const DEFAULT_NODE_ID: &str = "";

fn default_key_cache_size() -> u32 {
    128
}

fn default_session_name() -> String {
    "Default".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainConfiguration {
    /// All nodes share one physical schema layout
    #[serde(default)]
    pub share_storage_schema_over_nodes: bool,

    /// Type ids are passed as query parameters instead of literals
    #[serde(default)]
    pub type_ids_as_query_parameters: bool,

    #[serde(default)]
    pub session: SessionConfiguration,

    /// Nodes registered in addition to the default node
    #[serde(default)]
    pub nodes: Vec<NodeConfiguration>,
}

impl DomainConfiguration {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DomainConfiguration = serde_yaml_ng::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Compiled queries can be shared between nodes, so the query cache is
    /// not partitioned by node id
    #[must_use]
    pub fn shares_compiled_queries(&self) -> bool {
        self.share_storage_schema_over_nodes && self.type_ids_as_query_parameters
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    #[serde(default = "default_session_name")]
    pub name: String,

    /// Ids reserved per key allocation round-trip
    #[serde(default = "default_key_cache_size")]
    pub key_cache_size: u32,

    /// Hand out session-local placeholder keys, resolved later by replay
    #[serde(default)]
    pub generate_temporary_keys: bool,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            name: default_session_name(),
            key_cache_size: default_key_cache_size(),
            generate_temporary_keys: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub node_id: String,

    #[serde(default)]
    pub default_schema: Option<String>,

    /// Logical schema name to physical schema name
    #[serde(default)]
    pub schema_mapping: BTreeMap<String, String>,

    /// Logical database name to physical database name
    #[serde(default)]
    pub database_mapping: BTreeMap<String, String>,
}

impl NodeConfiguration {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

/// Load configuration from YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DomainConfiguration> {
    let content = std::fs::read_to_string(&path)?;
    DomainConfiguration::from_yaml_str(&content)
}

/// Validate configuration
pub(crate) fn validate_config(config: &DomainConfiguration) -> Result<()> {
    if config.session.key_cache_size == 0 {
        return Err(OrmError::Configuration(
            "key_cache_size must be greater than 0".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if node.node_id.is_empty() {
            return Err(OrmError::Configuration(
                "node_id cannot be empty for additional nodes".to_string(),
            ));
        }
        if !seen.insert(node.node_id.as_str()) {
            return Err(OrmError::Configuration(format!(
                "duplicate node_id '{}'",
                node.node_id
            )));
        }
    }

    Ok(())
}
