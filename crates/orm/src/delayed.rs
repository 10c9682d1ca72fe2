// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Queries registered now and executed with the next batch

use crate::error::{OrmError, Result};
use crate::materializer::{Materializer, TranslatedQuery};
use crate::parameters::ParameterContext;
use crate::query_result::{AsyncQueryResult, QueryResult, RecordSetReader, ResultAccessMethod};
use crate::query_task::QueryTask;
use crate::session::Session;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use txstate::StateLifetimeToken;

/// Query whose execution is deferred until its result is first needed
///
/// Creating the query registers its task on the session's user-defined
/// queue; asking for the result drains that queue, so every delayed query
/// created in the meantime runs in the same round-trip. The query is bound to
/// the transaction that was current at creation and fails with an expired
/// state error once that transaction ends.
pub struct DelayedQuery<T> {
    session: Session,
    lifetime_token: StateLifetimeToken,
    task: Arc<QueryTask>,
    materializer: Materializer<T>,
    parameter_context: Arc<ParameterContext>,
}

impl<T: Send + 'static> DelayedQuery<T> {
    pub fn new(
        session: &Session,
        query: &TranslatedQuery<T>,
        outer: Option<Arc<ParameterContext>>,
    ) -> Result<Self> {
        let lifetime_token = session.lifetime_token();
        lifetime_token.ensure_active()?;
        let parameter_context = query.parameter_context(outer);
        let task = Arc::new(QueryTask::new(
            query.data_source().clone(),
            lifetime_token.clone(),
            parameter_context.clone(),
        ));
        session.register_user_defined_delayed_query(task.clone());

        Ok(Self {
            session: session.clone(),
            lifetime_token,
            task,
            materializer: query.materializer().clone(),
            parameter_context,
        })
    }

    #[must_use]
    pub fn task(&self) -> &Arc<QueryTask> {
        &self.task
    }

    #[must_use]
    pub fn lifetime_token(&self) -> &StateLifetimeToken {
        &self.lifetime_token
    }

    #[must_use]
    pub fn parameter_context(&self) -> &Arc<ParameterContext> {
        &self.parameter_context
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.task.has_result()
    }

    /// Items of the query, executing the pending batch first if needed
    ///
    /// Each call materializes again from the task's rows.
    pub fn execute(&self) -> Result<QueryResult<T>> {
        self.lifetime_token.ensure_active()?;
        if !self.task.has_result() {
            _ = self.session.execute_user_defined_delayed_queries(false)?;
        }
        self.materialize()
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.execute()?.into_vec()
    }

    /// Async [`execute`](Self::execute)
    ///
    /// Items are buffered before returning so no reader outlives the await.
    pub async fn execute_async(&self, cancel: &CancellationToken) -> Result<QueryResult<T>> {
        self.lifetime_token.ensure_active()?;
        if !self.task.has_result() {
            _ = self
                .session
                .execute_user_defined_delayed_queries_async(false, cancel)
                .await?;
            self.lifetime_token.ensure_active()?;
        }
        let items = self.materialize()?.into_vec()?;
        Ok(QueryResult::from_vec(items))
    }

    /// Execution as an [`AsyncQueryResult`] that can be streamed
    #[must_use]
    pub fn into_async_result(self, cancel: CancellationToken) -> AsyncQueryResult<T> {
        AsyncQueryResult::new(async move { self.execute_async(&cancel).await })
    }

    fn materialize(&self) -> Result<QueryResult<T>> {
        let rows = self.task.result().ok_or(OrmError::ResultNotAvailable)?;
        let reader = RecordSetReader::new(rows);
        let result = (self.materializer)(reader, &self.session, &self.parameter_context)?;
        Ok(result.with_lease(self.session.acquire_reader_lease()))
    }
}

impl<T> Clone for DelayedQuery<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            lifetime_token: self.lifetime_token.clone(),
            task: self.task.clone(),
            materializer: self.materializer.clone(),
            parameter_context: self.parameter_context.clone(),
        }
    }
}

impl<T> fmt::Debug for DelayedQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedQuery")
            .field("session", &self.session.id())
            .field("task", &self.task)
            .finish()
    }
}

/// Delayed query reduced to a single value
pub struct DelayedScalarQuery<T> {
    query: DelayedQuery<T>,
    access: ResultAccessMethod,
}

impl<T: Send + 'static> DelayedScalarQuery<T> {
    /// Fails with [`OrmError::NotScalar`] for [`ResultAccessMethod::All`]
    /// before anything is registered
    pub fn new(
        session: &Session,
        query: &TranslatedQuery<T>,
        outer: Option<Arc<ParameterContext>>,
        access: ResultAccessMethod,
    ) -> Result<Self> {
        if access == ResultAccessMethod::All {
            return Err(OrmError::NotScalar(access));
        }
        Ok(Self {
            query: DelayedQuery::new(session, query, outer)?,
            access,
        })
    }

    #[must_use]
    pub fn access_method(&self) -> ResultAccessMethod {
        self.access
    }

    #[must_use]
    pub fn delayed_query(&self) -> &DelayedQuery<T> {
        &self.query
    }

    /// The value; `None` only for the `...OrDefault` access methods
    pub fn value(&self) -> Result<Option<T>> {
        self.query.execute()?.to_scalar(self.access)
    }

    pub async fn value_async(&self, cancel: &CancellationToken) -> Result<Option<T>> {
        self.query.execute_async(cancel).await?.to_scalar(self.access)
    }
}

impl<T> Clone for DelayedScalarQuery<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            access: self.access,
        }
    }
}

impl<T> fmt::Debug for DelayedScalarQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedScalarQuery")
            .field("access", &self.access)
            .field("query", &self.query)
            .finish()
    }
}
