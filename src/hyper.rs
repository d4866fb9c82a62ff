//! Hyperparameter registry.
//!
//! Hyperparameters are declared once, by name, in a [`HyperparameterRegistry`] and
//! referred to everywhere else by their [`HyperId`]. The registry is passed by
//! reference to the components that need hyperparameter values, so a set of
//! hyperparameters can be built and tested in isolation.

use std::fmt;
use std::ops::Index;

use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{BilevelError, BilevelResult};

/// Stable identity of a declared hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HyperId(usize);

impl HyperId {
    /// Position of the hyperparameter in declaration order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HyperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named hyperparameter tensor.
#[derive(Debug, Clone)]
pub struct Hyperparameter<R: Runtime> {
    name: String,
    value: Tensor<R>,
}

impl<R: Runtime> Hyperparameter<R> {
    /// Name given at declaration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> &Tensor<R> {
        &self.value
    }
}

/// Registry of the hyperparameters of one bilevel problem.
#[derive(Debug, Clone)]
pub struct HyperparameterRegistry<R: Runtime> {
    entries: Vec<Hyperparameter<R>>,
}

impl<R: Runtime> Default for HyperparameterRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> HyperparameterRegistry<R> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declare a new hyperparameter and return its id.
    pub fn declare(&mut self, name: impl Into<String>, value: Tensor<R>) -> BilevelResult<HyperId> {
        let name = name.into();
        if self.entries.iter().any(|h| h.name == name) {
            return Err(BilevelError::DuplicateHyperparameter { name });
        }
        self.entries.push(Hyperparameter { name, value });
        Ok(HyperId(self.entries.len() - 1))
    }

    /// Look up a hyperparameter id by name.
    pub fn id(&self, name: &str) -> Option<HyperId> {
        self.entries.iter().position(|h| h.name == name).map(HyperId)
    }

    /// Get a declared hyperparameter.
    pub fn get(&self, id: HyperId) -> BilevelResult<&Hyperparameter<R>> {
        self.entries
            .get(id.0)
            .ok_or(BilevelError::UnknownHyperparameter { id })
    }

    /// Name of a declared hyperparameter.
    pub fn name(&self, id: HyperId) -> BilevelResult<&str> {
        self.get(id).map(Hyperparameter::name)
    }

    /// Current value of a declared hyperparameter.
    pub fn value(&self, id: HyperId) -> BilevelResult<&Tensor<R>> {
        self.get(id).map(Hyperparameter::value)
    }

    /// Replace the value of a hyperparameter. The shape must not change.
    pub fn set_value(&mut self, id: HyperId, value: Tensor<R>) -> BilevelResult<()> {
        let entry = self
            .entries
            .get_mut(id.0)
            .ok_or(BilevelError::UnknownHyperparameter { id })?;
        if entry.value.shape() != value.shape() {
            return Err(BilevelError::ShapeMismatch {
                context: format!("set_value('{}')", entry.name),
                expected: entry.value.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        entry.value = value;
        Ok(())
    }

    /// All ids, in declaration order.
    pub fn ids(&self) -> Vec<HyperId> {
        (0..self.entries.len()).map(HyperId).collect()
    }

    /// Check that an id belongs to this registry.
    pub fn contains(&self, id: HyperId) -> bool {
        id.0 < self.entries.len()
    }

    /// Number of declared hyperparameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no hyperparameter is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wrap every hyperparameter value in an autograd leaf.
    pub fn vars(&self, requires_grad: bool) -> HyperVars<R> {
        HyperVars {
            vars: self
                .entries
                .iter()
                .map(|h| Var::new(h.value.clone(), requires_grad))
                .collect(),
        }
    }
}

/// Autograd leaves for all hyperparameters of a registry, indexable by [`HyperId`].
///
/// This is what inner dynamics and outer objectives receive; they pick the
/// hyperparameters they depend on by id.
pub struct HyperVars<R: Runtime> {
    vars: Vec<Var<R>>,
}

impl<R: Runtime> HyperVars<R> {
    /// Leaf for one hyperparameter, if the id is known.
    pub fn get(&self, id: HyperId) -> Option<&Var<R>> {
        self.vars.get(id.0)
    }

    /// Iterate over `(id, leaf)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (HyperId, &Var<R>)> {
        self.vars.iter().enumerate().map(|(i, v)| (HyperId(i), v))
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check if there are no leaves.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<R: Runtime> Index<HyperId> for HyperVars<R> {
    type Output = Var<R>;

    fn index(&self, id: HyperId) -> &Var<R> {
        &self.vars[id.0]
    }
}
