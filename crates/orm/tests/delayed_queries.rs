// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use orm::materializer::{column, map_rows};
use orm::{
    CancellationToken, DataSource, Domain, DomainConfiguration, EntityChange, EntityState,
    FromValue, Key, MemoryDataSource, MemoryHandler, OrmError, Parameter, PersistReason,
    QueryQueue, QueryTask, ResultAccessMethod, Session, SessionHandler, TranslatedQuery, Tuple,
    Value,
};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Persist,
    Batch,
}

/// Memory handler whose async call at `stage` waits until released
struct SuspendingHandler {
    inner: MemoryHandler,
    stage: Stage,
    entered: Notify,
    release: Notify,
}

impl SuspendingHandler {
    fn new(stage: Stage) -> Self {
        Self {
            inner: MemoryHandler::new(),
            stage,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    async fn suspend(&self, stage: Stage) {
        if self.stage == stage {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl SessionHandler for SuspendingHandler {
    fn persist(&self, changes: &[EntityChange], reason: PersistReason) -> orm::Result<()> {
        self.inner.persist(changes, reason)
    }

    fn execute_query_tasks(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> orm::Result<()> {
        self.inner.execute_query_tasks(tasks, allow_partial_execution)
    }

    fn build_entity_fetch_query(&self, entity_type: &str) -> orm::Result<Arc<dyn DataSource>> {
        self.inner.build_entity_fetch_query(entity_type)
    }

    fn allocate_keys(&self, entity_type: &str, count: u32) -> orm::Result<i64> {
        self.inner.allocate_keys(entity_type, count)
    }

    fn begin_transaction(&self, nested: bool) -> orm::Result<()> {
        self.inner.begin_transaction(nested)
    }

    fn commit_transaction(&self, nested: bool) -> orm::Result<()> {
        self.inner.commit_transaction(nested)
    }

    fn rollback_transaction(&self, nested: bool) -> orm::Result<()> {
        self.inner.rollback_transaction(nested)
    }

    async fn persist_async(
        &self,
        changes: &[EntityChange],
        reason: PersistReason,
    ) -> orm::Result<()> {
        self.suspend(Stage::Persist).await;
        self.inner.persist(changes, reason)
    }

    async fn execute_query_tasks_async(
        &self,
        tasks: &[Arc<QueryTask>],
        allow_partial_execution: bool,
    ) -> orm::Result<()> {
        self.suspend(Stage::Batch).await;
        self.inner.execute_query_tasks(tasks, allow_partial_execution)
    }
}

fn open_suspending_session(stage: Stage) -> Result<(Session, Arc<SuspendingHandler>)> {
    let domain = Domain::open(DomainConfiguration::default())?;
    let handler = Arc::new(SuspendingHandler::new(stage));
    let session = domain.open_session("", handler.clone())?;
    Ok((session, handler))
}

fn open_session() -> Result<(Session, Arc<MemoryHandler>)> {
    diagnostics::init_diagnostics();
    let domain = Domain::open(DomainConfiguration::default())?;
    let handler = Arc::new(MemoryHandler::new());
    let session = domain.open_session("", handler.clone())?;
    Ok((session, handler))
}

fn int_rows(values: &[i64]) -> TranslatedQuery<i64> {
    let rows: Vec<Tuple> = values.iter().map(|v| vec![Value::Int(*v)]).collect();
    TranslatedQuery::new(Arc::new(MemoryDataSource::rows(rows)), column(0))
}

#[tokio::test]
async fn test_n_queries_execute_in_one_batch() -> Result<()> {
    let (session, handler) = open_session()?;
    let scope = session.open_transaction()?;

    let queries = (0..5)
        .map(|i| session.create_delayed_query(&int_rows(&[i]), None))
        .collect::<orm::Result<Vec<_>>>()?;
    assert_eq!(session.pending_queries(QueryQueue::UserDefined), 5);

    let last = queries.last().map(|q| q.to_vec()).transpose()?;
    assert_eq!(last, Some(vec![4]));
    assert_eq!(handler.batch_sizes(), vec![5]);

    for (i, query) in queries.iter().enumerate() {
        assert!(query.is_executed());
        assert_eq!(query.to_vec()?, vec![i as i64]);
    }
    assert_eq!(handler.batch_count(), 1);

    scope.commit()?;
    Ok(())
}

#[tokio::test]
async fn test_expired_query_fails_and_task_stays_empty() -> Result<()> {
    let (session, handler) = open_session()?;

    let scope = session.open_transaction()?;
    let pending = session.create_delayed_query(&int_rows(&[1]), None)?;
    scope.rollback()?;

    let err = pending.execute().expect_err("transaction ended");
    assert!(err.is_expired());
    assert!(!pending.task().has_result());

    // The next drain skips the expired task.
    let fresh = session.create_delayed_query(&int_rows(&[2]), None)?;
    assert_eq!(fresh.to_vec()?, vec![2]);
    assert_eq!(handler.batch_sizes(), vec![1]);
    assert!(!pending.task().has_result());
    Ok(())
}

#[tokio::test]
async fn test_executed_query_still_expires() -> Result<()> {
    let (session, _) = open_session()?;

    let scope = session.open_transaction()?;
    let pending = session.create_delayed_query(&int_rows(&[1]), None)?;
    assert_eq!(pending.to_vec()?, vec![1]);
    scope.commit()?;

    assert!(pending.task().has_result());
    assert!(pending.execute().expect_err("expired").is_expired());
    Ok(())
}

#[tokio::test]
async fn test_query_reads_pending_writes() -> Result<()> {
    let (session, handler) = open_session()?;
    let scope = session.open_transaction()?;
    let key = session.new_entity("Order")?;
    session.set_field(&key, "total", Value::Int(12))?;

    let orders = TranslatedQuery::new(
        Arc::new(MemoryDataSource::entity_scan("Order")),
        map_rows(|row: &Tuple| EntityState::from_row(row)),
    );
    let found = session.create_delayed_query(&orders, None)?.to_vec()?;

    assert_eq!(handler.persist_log(), vec![(PersistReason::Query, 2)]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].field("total"), Some(&Value::Int(12)));
    scope.commit()?;
    Ok(())
}

#[tokio::test]
async fn test_scalar_reductions() -> Result<()> {
    let (session, _) = open_session()?;

    let value = |values: &[i64], access| -> orm::Result<Option<i64>> {
        session
            .create_delayed_scalar_query(&int_rows(values), None, access)?
            .value()
    };

    assert!(matches!(
        value(&[], ResultAccessMethod::First),
        Err(OrmError::Cardinality { .. })
    ));
    assert_eq!(value(&[7], ResultAccessMethod::First)?, Some(7));
    assert_eq!(value(&[7, 8], ResultAccessMethod::First)?, Some(7));
    assert_eq!(value(&[], ResultAccessMethod::FirstOrDefault)?, None);

    assert_eq!(value(&[3], ResultAccessMethod::Single)?, Some(3));
    assert!(value(&[], ResultAccessMethod::Single).is_err());
    assert!(value(&[3, 4], ResultAccessMethod::Single).is_err());
    assert_eq!(value(&[], ResultAccessMethod::SingleOrDefault)?, None);
    assert!(value(&[3, 4], ResultAccessMethod::SingleOrDefault).is_err());
    Ok(())
}

#[tokio::test]
async fn test_cached_translation_runs_once() -> Result<()> {
    let (session, _) = open_session()?;
    let status = Parameter::new("status");
    let mut translations = 0;

    for _ in 0..3 {
        let query = session.cached_delayed_query(
            "orders-by-status",
            || {
                translations += 1;
                Ok(int_rows(&[1, 2]).with_binding(&status, Value::from("open")))
            },
            None,
        )?;
        assert_eq!(
            query.parameter_context().get_value(&status)?,
            &Value::from("open")
        );
        assert_eq!(query.to_vec()?, vec![1, 2]);
    }
    assert_eq!(translations, 1);
    Ok(())
}

#[tokio::test]
async fn test_async_result_stream() -> Result<()> {
    let (session, handler) = open_session()?;
    let first = session.create_delayed_query(&int_rows(&[1, 2, 3]), None)?;
    let second = session.create_delayed_query(&int_rows(&[9]), None)?;

    let cancel = CancellationToken::new();
    let stream = first.into_async_result(cancel.clone()).into_stream(cancel);
    let items: Vec<i64> = stream
        .map(|item| item.map_err(anyhow::Error::from))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_>>()?;
    assert_eq!(items, vec![1, 2, 3]);
    assert_eq!(second.to_vec()?, vec![9]);
    assert_eq!(handler.batch_count(), 1);
    assert_eq!(session.active_readers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_async_value() -> Result<()> {
    let (session, handler) = open_session()?;
    let query = session.create_delayed_scalar_query(
        &int_rows(&[1]),
        None,
        ResultAccessMethod::Single,
    )?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        query.value_async(&cancel).await,
        Err(OrmError::Cancelled)
    ));
    assert!(!query.delayed_query().is_executed());
    assert_eq!(handler.batch_count(), 0);

    let value = query.value_async(&CancellationToken::new()).await?;
    assert_eq!(value, Some(1));
    Ok(())
}

#[tokio::test]
async fn test_partial_internal_batch() -> Result<()> {
    let (session, _) = open_session()?;
    let token = session.lifetime_token();
    let ok = Arc::new(orm::QueryTask::new(
        Arc::new(MemoryDataSource::rows(vec![vec![Value::Int(1)]])),
        token.clone(),
        orm::ParameterContext::empty(),
    ));
    let failing = Arc::new(orm::QueryTask::new(
        Arc::new(MemoryDataSource::failing("unavailable")),
        token,
        orm::ParameterContext::empty(),
    ));
    session.register_internal_delayed_query(ok.clone());
    session.register_internal_delayed_query(failing.clone());

    assert!(session.execute_delayed_queries(QueryQueue::Internal, true, true)?);
    assert!(ok.has_result());
    assert!(!failing.has_result());
    assert_eq!(session.pending_queries(QueryQueue::Internal), 0);
    assert_eq!(i64::from_value(&ok.result().expect("rows")[0][0])?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_partial_batch_clears_internal_queue() -> Result<()> {
    let (session, handler) = open_session()?;
    let token = session.lifetime_token();
    let task = Arc::new(orm::QueryTask::new(
        Arc::new(MemoryDataSource::rows(vec![vec![Value::Int(1)]])),
        token,
        orm::ParameterContext::empty(),
    ));
    session.register_internal_delayed_query(task.clone());
    handler.fail_next_batch();

    assert!(
        session
            .execute_delayed_queries(QueryQueue::Internal, true, true)
            .is_err()
    );
    assert_eq!(session.pending_queries(QueryQueue::Internal), 0);
    assert!(!task.has_result());
    assert_eq!(handler.active_contexts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_query_expiring_during_batch_fails() -> Result<()> {
    let (session, handler) = open_suspending_session(Stage::Batch)?;
    let scope = session.open_transaction()?;
    let pending = session.create_delayed_query(&int_rows(&[1]), None)?;
    let cancel = CancellationToken::new();

    let (result, rolled_back) = tokio::join!(pending.execute_async(&cancel), async {
        handler.entered.notified().await;
        let rolled_back = scope.rollback();
        handler.release.notify_one();
        rolled_back
    });
    rolled_back?;

    let err = result.expect_err("transaction ended while the batch ran");
    assert!(err.is_expired());
    assert!(pending.task().has_result());
    assert_eq!(handler.inner.batch_count(), 1);
    assert_eq!(session.active_readers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_between_persist_and_batch() -> Result<()> {
    let (session, handler) = open_suspending_session(Stage::Persist)?;
    let scope = session.open_transaction()?;
    _ = session.new_entity("Order")?;
    let pending = session.create_delayed_query(&int_rows(&[1]), None)?;
    let cancel = CancellationToken::new();

    let (drained, ()) = tokio::join!(
        session.execute_user_defined_delayed_queries_async(false, &cancel),
        async {
            handler.entered.notified().await;
            cancel.cancel();
            handler.release.notify_one();
        }
    );

    assert!(matches!(drained, Err(OrmError::Cancelled)));
    assert_eq!(handler.inner.persist_log(), vec![(PersistReason::Query, 1)]);
    assert_eq!(session.pending_changes(), 0);
    assert_eq!(handler.inner.batch_count(), 0);
    assert_eq!(session.pending_queries(QueryQueue::UserDefined), 1);
    assert!(!pending.is_executed());

    assert_eq!(pending.to_vec()?, vec![1]);
    assert_eq!(handler.inner.batch_count(), 1);
    scope.commit()?;
    Ok(())
}

#[tokio::test]
async fn test_prefetch_uses_internal_queue() -> Result<()> {
    let (session, handler) = open_session()?;
    handler.insert_entity(EntityState::new(Key::new("Customer", 1)).with_field("name", Value::from("Ada")));

    let scope = session.open_transaction()?;
    let customer = session.fetch_entity(&Key::new("Customer", 1))?;
    assert_eq!(customer.field("name"), Some(&Value::from("Ada")));
    assert_eq!(session.pending_queries(QueryQueue::Internal), 0);
    assert_eq!(handler.fetch_query_builds(), 1);
    assert!(matches!(
        session.fetch_entity(&Key::new("Customer", 2)),
        Err(OrmError::EntityNotFound(_))
    ));
    assert_eq!(handler.fetch_query_builds(), 1);
    scope.commit()?;
    Ok(())
}
