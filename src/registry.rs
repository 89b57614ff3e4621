use std::sync::Arc;

use anyhow::bail;
use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::{backend::Backend, op::Operator};

/// Name -> operator table for one backend, built once at startup
pub struct OpRegistry<B: Backend> {
    ops: FxHashMap<&'static str, Arc<dyn Operator<B>>>,
}

impl<B: Backend> Default for OpRegistry<B> {
    fn default() -> Self {
        Self {
            ops: FxHashMap::default(),
        }
    }
}

impl<B: Backend> OpRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator, replacing any previous one with the same name
    pub fn register(&mut self, op: impl Operator<B> + 'static) -> &mut Self {
        self.ops.insert(op.name(), Arc::new(op));
        self
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Arc<dyn Operator<B>>> {
        match self.ops.get(name) {
            Some(op) => Ok(op.clone()),
            None => bail!(
                "operator `{name}` is not implemented (available: {})",
                self.names().join(", ")
            ),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Registered operator names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.ops.keys().copied().sorted().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
