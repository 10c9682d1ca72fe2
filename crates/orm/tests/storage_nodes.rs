// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use orm::materializer::column;
use orm::{
    Domain, DomainConfiguration, MemoryDataSource, MemoryHandler, NodeConfiguration, Session,
    TranslatedQuery, Value,
};
use std::sync::Arc;

fn domain(shared: bool) -> Result<Domain> {
    let mut configuration = DomainConfiguration {
        share_storage_schema_over_nodes: shared,
        type_ids_as_query_parameters: shared,
        ..DomainConfiguration::default()
    };
    configuration.nodes.push(NodeConfiguration::new("nodeA"));
    configuration.nodes.push(NodeConfiguration::new("nodeB"));
    Ok(Domain::open(configuration)?)
}

fn compile_on(session: &Session, query_key: &str) -> Result<()> {
    let query = session.cached_delayed_query(
        query_key,
        || {
            Ok(TranslatedQuery::new(
                Arc::new(MemoryDataSource::rows(vec![vec![Value::Int(1)]])),
                column::<i64>(0),
            ))
        },
        None,
    )?;
    assert_eq!(query.to_vec()?, vec![1]);
    Ok(())
}

#[tokio::test]
async fn test_remove_node_purges_partitioned_cache() -> Result<()> {
    let domain = domain(false)?;
    let handler = Arc::new(MemoryHandler::new());
    let a = domain.open_session("nodeA", handler.clone())?;
    let b = domain.open_session("nodeB", handler)?;

    compile_on(&a, "orders")?;
    compile_on(&a, "customers")?;
    compile_on(&b, "orders")?;
    assert_eq!(domain.query_cache().len(), 3);

    assert!(domain.nodes().remove_node("nodeA", true));
    assert_eq!(domain.query_cache().key_scans(), 3);
    assert_eq!(domain.query_cache().len(), 1);
    assert!(domain.nodes().get_node("nodeA").is_none());
    assert!(domain.nodes().get_node("nodeB").is_some());
    Ok(())
}

#[tokio::test]
async fn test_remove_node_skips_scan_when_queries_are_shared() -> Result<()> {
    let domain = domain(true)?;
    let handler = Arc::new(MemoryHandler::new());
    let a = domain.open_session("nodeA", handler.clone())?;
    let b = domain.open_session("nodeB", handler)?;

    compile_on(&a, "orders")?;
    compile_on(&b, "orders")?;
    assert_eq!(domain.query_cache().len(), 1);

    assert!(domain.nodes().remove_node("nodeA", true));
    assert_eq!(domain.query_cache().key_scans(), 0);
    assert_eq!(domain.query_cache().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_node_lookup_and_default_node() -> Result<()> {
    let domain = domain(false)?;
    assert_eq!(
        domain.nodes().node_ids(),
        vec![String::new(), "nodeA".to_string(), "nodeB".to_string()]
    );

    assert!(!domain.nodes().remove_node("", true));
    assert!(!domain.nodes().remove_node("missing", true));
    assert!(!domain.nodes().add_node(NodeConfiguration::new("nodeA"))?);
    assert!(domain.nodes().add_node(NodeConfiguration::new("nodeC"))?);
    assert_eq!(domain.nodes().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_node_caches_are_isolated() -> Result<()> {
    let domain = domain(false)?;
    let handler = Arc::new(MemoryHandler::new());
    let a = domain.open_session("nodeA", handler.clone())?;
    let b = domain.open_session("nodeB", handler.clone())?;

    let scope = a.open_transaction()?;
    let key = a.new_entity("Order")?;
    scope.commit()?;

    assert_eq!(a.storage_node().key_sequences.len(), 1);
    assert_eq!(b.storage_node().key_sequences.len(), 0);
    assert!(a.storage_node().key_sequence("Order").remaining() > 0);
    assert!(handler.entity(&key).is_some());
    Ok(())
}
