// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Translated queries and the functions that turn their rows into items

use crate::error::{OrmError, Result};
use crate::parameters::{Parameter, ParameterContext};
use crate::query_result::{QueryResult, RecordSetReader};
use crate::query_task::DataSource;
use crate::session::Session;
use crate::value::{FromValue, Tuple, Value};
use std::fmt;
use std::sync::Arc;

/// Converts the rows of one task into typed items
///
/// Called once per materialization attempt with the reader over the task's
/// rows, the owning session and the query's parameter context.
pub type Materializer<T> =
    Arc<dyn Fn(RecordSetReader, &Session, &ParameterContext) -> Result<QueryResult<T>> + Send + Sync>;

/// Output of query translation: what to execute and how to read it back
pub struct TranslatedQuery<T> {
    data_source: Arc<dyn DataSource>,
    materializer: Materializer<T>,
    tuple_parameter_bindings: Vec<(Parameter, Value)>,
}

impl<T> TranslatedQuery<T> {
    pub fn new(data_source: Arc<dyn DataSource>, materializer: Materializer<T>) -> Self {
        Self {
            data_source,
            materializer,
            tuple_parameter_bindings: Vec::new(),
        }
    }

    /// Pre-bound value added to every execution of this query
    #[must_use]
    pub fn with_binding(mut self, parameter: &Parameter, value: Value) -> Self {
        self.tuple_parameter_bindings.push((parameter.clone(), value));
        self
    }

    #[must_use]
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    #[must_use]
    pub fn materializer(&self) -> &Materializer<T> {
        &self.materializer
    }

    #[must_use]
    pub fn tuple_parameter_bindings(&self) -> &[(Parameter, Value)] {
        &self.tuple_parameter_bindings
    }

    /// Parameter context for one execution: `outer` extended with the
    /// query's own bindings
    #[must_use]
    pub fn parameter_context(&self, outer: Option<Arc<ParameterContext>>) -> Arc<ParameterContext> {
        let mut context = ParameterContext::new(outer);
        for (parameter, value) in &self.tuple_parameter_bindings {
            context.set_value(parameter, value.clone());
        }
        Arc::new(context)
    }
}

impl<T> Clone for TranslatedQuery<T> {
    fn clone(&self) -> Self {
        Self {
            data_source: self.data_source.clone(),
            materializer: self.materializer.clone(),
            tuple_parameter_bindings: self.tuple_parameter_bindings.clone(),
        }
    }
}

impl<T> fmt::Debug for TranslatedQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatedQuery")
            .field("data_source", &self.data_source)
            .field("bindings", &self.tuple_parameter_bindings.len())
            .finish()
    }
}

/// Materializer mapping every row with `map`
pub fn map_rows<T, F>(map: F) -> Materializer<T>
where
    T: Send + 'static,
    F: Fn(&Tuple) -> Result<T> + Clone + Send + Sync + 'static,
{
    Arc::new(move |reader, _session, _context| Ok(QueryResult::from_reader(reader, map.clone())))
}

/// Materializer reading one column of every row
pub fn column<T>(index: usize) -> Materializer<T>
where
    T: FromValue + Send + 'static,
{
    map_rows(move |row: &Tuple| {
        let value = row.get(index).ok_or_else(|| OrmError::ValueConversion {
            expected: "column",
            found: format!("row of {} values", row.len()),
        })?;
        T::from_value(value)
    })
}
