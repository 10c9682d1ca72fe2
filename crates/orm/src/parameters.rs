// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Parameter bindings threaded through query execution

use crate::error::{OrmError, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAMETER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a query parameter
///
/// Two parameters with the same name are still distinct; identity comes from
/// the id assigned at creation.
#[derive(Clone)]
pub struct Parameter {
    id: u64,
    name: Arc<str>,
}

impl Parameter {
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_PARAMETER_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Parameter {}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}#{}", self.name, self.id)
    }
}

/// Chain of parameter bindings
///
/// Built by extending an outer context; lookups walk from the innermost
/// context outwards. Values are set while assembling the context, after which
/// it is shared behind an `Arc` and no longer mutated.
#[derive(Debug, Default)]
pub struct ParameterContext {
    outer: Option<Arc<ParameterContext>>,
    bindings: HashMap<u64, (Parameter, Value)>,
}

impl ParameterContext {
    #[must_use]
    pub fn new(outer: Option<Arc<ParameterContext>>) -> Self {
        Self {
            outer,
            bindings: HashMap::new(),
        }
    }

    #[must_use]
    pub fn empty() -> Arc<ParameterContext> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn outer(&self) -> Option<&Arc<ParameterContext>> {
        self.outer.as_ref()
    }

    pub fn set_value(&mut self, parameter: &Parameter, value: Value) {
        _ = self
            .bindings
            .insert(parameter.id, (parameter.clone(), value));
    }

    /// Builder-style [`set_value`](Self::set_value)
    #[must_use]
    pub fn with_value(mut self, parameter: &Parameter, value: Value) -> Self {
        self.set_value(parameter, value);
        self
    }

    #[must_use]
    pub fn try_get_value(&self, parameter: &Parameter) -> Option<&Value> {
        let mut context = Some(self);
        while let Some(current) = context {
            if let Some((_, value)) = current.bindings.get(&parameter.id) {
                return Some(value);
            }
            context = current.outer.as_deref();
        }
        None
    }

    pub fn get_value(&self, parameter: &Parameter) -> Result<&Value> {
        self.try_get_value(parameter)
            .ok_or_else(|| OrmError::ParameterNotBound {
                name: parameter.name().to_string(),
            })
    }

    #[must_use]
    pub fn is_bound(&self, parameter: &Parameter) -> bool {
        self.try_get_value(parameter).is_some()
    }

    /// Number of contexts in the chain, including this one
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.outer.as_ref().map_or(0, |outer| outer.depth())
    }
}
