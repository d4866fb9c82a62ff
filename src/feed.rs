//! Named input bindings for inner steps and outer objectives.
//!
//! A [`Bindings`] value maps input names (minibatch tensors, targets, step
//! counters) to tensors for one evaluation. A [`Feed`] produces bindings either
//! once for every step or as a function of the (virtual) step index.

use std::collections::BTreeMap;
use std::fmt;

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{BilevelError, BilevelResult};

/// Input tensors bound by name for a single evaluation.
#[derive(Debug, Clone)]
pub struct Bindings<R: Runtime> {
    entries: BTreeMap<String, Tensor<R>>,
}

impl<R: Runtime> Default for Bindings<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> Bindings<R> {
    /// Create empty bindings.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Tensor<R>) -> Self {
        self.insert(name, value);
        self
    }

    /// Bind `name`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor<R>) {
        self.entries.insert(name.into(), value);
    }

    /// Look up a binding.
    pub fn get(&self, name: &str) -> Option<&Tensor<R>> {
        self.entries.get(name)
    }

    /// Look up a binding that must be present.
    pub fn require(&self, name: &str) -> BilevelResult<&Tensor<R>> {
        self.get(name).ok_or_else(|| BilevelError::InvalidInput {
            context: format!("missing binding '{}'", name),
        })
    }

    /// Merge `other` into `self`. Entries of `other` win on conflicts.
    pub fn merge(&mut self, other: Bindings<R>) {
        self.entries.extend(other.entries);
    }

    /// Merge two bindings into a new one. Entries of `b` win on conflicts.
    pub fn merged(mut a: Bindings<R>, b: Bindings<R>) -> Bindings<R> {
        a.merge(b);
        a
    }

    /// Iterate over bound names and tensors in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<R>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Bound names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Provider of bindings for a sequence of evaluations.
pub enum Feed<R: Runtime> {
    /// No inputs.
    Empty,
    /// The same bindings for every step.
    Static(Bindings<R>),
    /// Bindings computed from the step index.
    PerStep(Box<dyn Fn(usize) -> Bindings<R>>),
}

impl<R: Runtime> Default for Feed<R> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<R: Runtime> fmt::Debug for Feed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Feed::Empty"),
            Self::Static(b) => f.debug_tuple("Feed::Static").field(b).finish(),
            Self::PerStep(_) => write!(f, "Feed::PerStep(..)"),
        }
    }
}

impl<R: Runtime> Feed<R> {
    /// Feed computed from the step index.
    pub fn per_step<F>(f: F) -> Self
    where
        F: Fn(usize) -> Bindings<R> + 'static,
    {
        Self::PerStep(Box::new(f))
    }

    /// Bindings for step `step`.
    pub fn resolve(&self, step: usize) -> Bindings<R> {
        match self {
            Self::Empty => Bindings::new(),
            Self::Static(b) => b.clone(),
            Self::PerStep(f) => f(step),
        }
    }
}

impl<R: Runtime> From<Bindings<R>> for Feed<R> {
    fn from(bindings: Bindings<R>) -> Self {
        Self::Static(bindings)
    }
}
