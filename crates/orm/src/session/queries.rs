// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::Session;
use crate::delayed::{DelayedQuery, DelayedScalarQuery};
use crate::error::{OrmError, Result};
use crate::handler::PersistReason;
use crate::materializer::TranslatedQuery;
use crate::parameters::ParameterContext;
use crate::query_result::ResultAccessMethod;
use crate::query_task::QueryTask;
use crate::storage::CompiledQueryKey;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The two task queues of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryQueue {
    /// Tasks queued by the runtime itself, such as entity prefetches
    Internal,
    /// Delayed queries created by application code
    UserDefined,
}

impl QueryQueue {
    fn persist_reason(self) -> PersistReason {
        match self {
            QueryQueue::Internal => PersistReason::Other,
            QueryQueue::UserDefined => PersistReason::Query,
        }
    }

    fn name(self) -> &'static str {
        match self {
            QueryQueue::Internal => "internal",
            QueryQueue::UserDefined => "user-defined",
        }
    }
}

impl Session {
    pub fn register_user_defined_delayed_query(&self, task: Arc<QueryTask>) {
        self.lock().user_queue.push(task);
    }

    pub fn register_internal_delayed_query(&self, task: Arc<QueryTask>) {
        self.lock().internal_queue.push(task);
    }

    #[must_use]
    pub fn pending_queries(&self, queue: QueryQueue) -> usize {
        let state = self.lock();
        match queue {
            QueryQueue::Internal => state.internal_queue.len(),
            QueryQueue::UserDefined => state.user_queue.len(),
        }
    }

    pub fn execute_user_defined_delayed_queries(&self, skip_persist: bool) -> Result<bool> {
        self.execute_delayed_queries(QueryQueue::UserDefined, skip_persist, false)
    }

    pub fn execute_internal_delayed_queries(&self, skip_persist: bool) -> Result<bool> {
        self.execute_delayed_queries(QueryQueue::Internal, skip_persist, false)
    }

    /// Drain `queue` and execute its live tasks in one handler call
    ///
    /// Pending changes are persisted first unless `skip_persist` is set; a
    /// persist failure leaves the queue untouched. Once drained, tasks are
    /// gone whether they executed, were skipped as expired, or their batch
    /// failed. Returns whether a batch was executed.
    pub fn execute_delayed_queries(
        &self,
        queue: QueryQueue,
        skip_persist: bool,
        allow_partial_execution: bool,
    ) -> Result<bool> {
        if !skip_persist {
            self.persist(queue.persist_reason())?;
        }
        let tasks = self.take_live_tasks(queue);
        if tasks.is_empty() {
            return Ok(false);
        }
        self.inner
            .handler
            .execute_query_tasks(&tasks, allow_partial_execution)?;
        Ok(true)
    }

    pub async fn execute_user_defined_delayed_queries_async(
        &self,
        skip_persist: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.execute_delayed_queries_async(QueryQueue::UserDefined, skip_persist, false, cancel)
            .await
    }

    pub async fn execute_internal_delayed_queries_async(
        &self,
        skip_persist: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.execute_delayed_queries_async(QueryQueue::Internal, skip_persist, false, cancel)
            .await
    }

    /// Async [`execute_delayed_queries`](Self::execute_delayed_queries)
    ///
    /// Cancellation is checked before persisting and before the batch is
    /// issued; a batch already issued runs to completion.
    pub async fn execute_delayed_queries_async(
        &self,
        queue: QueryQueue,
        skip_persist: bool,
        allow_partial_execution: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(OrmError::Cancelled);
        }
        if !skip_persist {
            self.persist_async(queue.persist_reason()).await?;
        }
        if cancel.is_cancelled() {
            return Err(OrmError::Cancelled);
        }
        let tasks = self.take_live_tasks(queue);
        if tasks.is_empty() {
            return Ok(false);
        }
        self.inner
            .handler
            .execute_query_tasks_async(&tasks, allow_partial_execution)
            .await?;
        Ok(true)
    }

    /// Snapshot and clear the queue, keeping tasks whose token is active
    fn take_live_tasks(&self, queue: QueryQueue) -> Vec<Arc<QueryTask>> {
        let drained = {
            let mut state = self.lock();
            match queue {
                QueryQueue::Internal => std::mem::take(&mut state.internal_queue),
                QueryQueue::UserDefined => std::mem::take(&mut state.user_queue),
            }
        };
        let total = drained.len();
        let live: Vec<Arc<QueryTask>> = drained
            .into_iter()
            .filter(|task| task.lifetime_token().is_active())
            .collect();
        let expired = total - live.len();
        let queue = queue.name();
        let batch = live.len();
        diagnostics::debug!("Draining {queue} queue: {batch} tasks, {expired} expired");
        live
    }

    pub fn create_delayed_query<T: Send + 'static>(
        &self,
        query: &TranslatedQuery<T>,
        outer: Option<Arc<ParameterContext>>,
    ) -> Result<DelayedQuery<T>> {
        DelayedQuery::new(self, query, outer)
    }

    pub fn create_delayed_scalar_query<T: Send + 'static>(
        &self,
        query: &TranslatedQuery<T>,
        outer: Option<Arc<ParameterContext>>,
        access: ResultAccessMethod,
    ) -> Result<DelayedScalarQuery<T>> {
        DelayedScalarQuery::new(self, query, outer, access)
    }

    /// Delayed query over a translation cached under `query_key`
    ///
    /// `translate` runs only when the cache has no entry for the key in this
    /// session's node partition.
    pub fn cached_delayed_query<T, F>(
        &self,
        query_key: &str,
        translate: F,
        outer: Option<Arc<ParameterContext>>,
    ) -> Result<DelayedQuery<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<TranslatedQuery<T>>,
    {
        let key = CompiledQueryKey::new(query_key, self.inner.query_cache_node.clone());
        let translated = self.inner.query_cache.get_or_add(key, translate)?;
        DelayedQuery::new(self, &translated, outer)
    }
}
