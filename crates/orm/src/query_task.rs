// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Deferred units of query execution

use crate::error::{OrmError, Result};
use crate::parameters::ParameterContext;
use crate::value::Tuple;
use std::any::Any;
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use txstate::StateLifetimeToken;

/// Compiled, provider-specific query
///
/// Opaque to the session; the handler executing the task downcasts it via
/// [`as_any`](DataSource::as_any).
pub trait DataSource: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// One pending query execution
///
/// The result slot is written exactly once, by the handler executing the
/// batch the task was drained into. Tasks whose lifetime token expired before
/// the drain are skipped and keep an empty slot.
#[derive(Debug)]
pub struct QueryTask {
    data_source: Arc<dyn DataSource>,
    lifetime_token: StateLifetimeToken,
    parameter_context: Arc<ParameterContext>,
    result: OnceLock<Arc<[Tuple]>>,
}

impl QueryTask {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        lifetime_token: StateLifetimeToken,
        parameter_context: Arc<ParameterContext>,
    ) -> Self {
        Self {
            data_source,
            lifetime_token,
            parameter_context,
            result: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
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
    pub fn has_result(&self) -> bool {
        self.result.get().is_some()
    }

    #[must_use]
    pub fn result(&self) -> Option<Arc<[Tuple]>> {
        self.result.get().cloned()
    }

    /// Assign the rows produced for this task
    pub fn set_result(&self, rows: Vec<Tuple>) -> Result<()> {
        self.result
            .set(Arc::from(rows))
            .map_err(|_| OrmError::ResultAlreadyAssigned)
    }
}
