//! Lagrangian multipliers, outer-gradient accumulators and the Lagrangian
//! products they are built from.

use numr::autograd::{Var, VarGradStore, backward, var_add, var_mul, var_sum};
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::error::{BilevelError, BilevelResult};

/// Wrap tensors in autograd leaves.
pub fn leaves<R: Runtime>(tensors: &[Tensor<R>], requires_grad: bool) -> Vec<Var<R>> {
    tensors
        .iter()
        .map(|t| Var::new(t.clone(), requires_grad))
        .collect()
}

/// Build the scalar Σᵢ sum(αᵢ ⊙ exprᵢ).
///
/// With `exprs` the step expressions Φ(s, h) this is the iteration-wise
/// Lagrangian; with the initial-state expressions it is the boundary
/// Lagrangian. Returns `None` when no expression depends on a leaf that
/// requires gradients, i.e. every gradient of the product is undefined.
pub fn lagrangian<R, C>(
    client: &C,
    alphas: &[Tensor<R>],
    exprs: &[Var<R>],
) -> BilevelResult<Option<Var<R>>>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    if alphas.len() != exprs.len() {
        return Err(BilevelError::StateArity {
            expected: alphas.len(),
            actual: exprs.len(),
        });
    }

    let mut total: Option<Var<R>> = None;
    for (i, (alpha, expr)) in alphas.iter().zip(exprs).enumerate() {
        if alpha.shape() != expr.tensor().shape() {
            return Err(BilevelError::ShapeMismatch {
                context: format!("lagrangian term {}", i),
                expected: alpha.shape().to_vec(),
                actual: expr.tensor().shape().to_vec(),
            });
        }
        if !expr.requires_grad() {
            continue;
        }

        let alpha_var = Var::new(alpha.clone(), false);
        let prod = var_mul(expr, &alpha_var, client)?;
        let all_dims: Vec<usize> = (0..prod.tensor().shape().len()).collect();
        let term = if all_dims.is_empty() {
            prod
        } else {
            var_sum(&prod, &all_dims, false, client)?
        };

        total = Some(match total {
            Some(acc) => var_add(&acc, &term, client)?,
            None => term,
        });
    }

    Ok(total)
}

/// Run backward on an optional scalar.
pub fn gradients_of<R, C>(client: &C, scalar: Option<&Var<R>>) -> BilevelResult<Option<VarGradStore<R>>>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
{
    match scalar {
        Some(s) if s.requires_grad() => Ok(Some(backward(s, client)?)),
        _ => Ok(None),
    }
}

/// Gradient w.r.t. `leaf`, if defined.
pub fn defined_grad<'g, R: Runtime>(
    grads: Option<&'g VarGradStore<R>>,
    leaf: &Var<R>,
) -> Option<&'g Tensor<R>> {
    grads.and_then(|g| g.get(leaf.id()))
}

/// Gradient w.r.t. `leaf`, zero when undefined.
pub fn grad_or_zeros<R: Runtime>(grads: Option<&VarGradStore<R>>, leaf: &Var<R>) -> Tensor<R> {
    match defined_grad(grads, leaf) {
        Some(g) => g.clone(),
        None => zeros_like(leaf.tensor()),
    }
}

/// Zero tensor with the shape, dtype and device of `t`.
pub fn zeros_like<R: Runtime>(t: &Tensor<R>) -> Tensor<R> {
    Tensor::<R>::zeros(t.shape(), t.dtype(), t.device())
}

/// Lagrangian multipliers, one per inner-state component.
///
/// Created with zeros when an objective is registered; only the reset
/// operation initializes them, and each backward step overwrites them.
#[derive(Debug, Clone)]
pub struct MultiplierSet<R: Runtime> {
    alphas: Vec<Tensor<R>>,
    initialized: bool,
}

impl<R: Runtime> MultiplierSet<R> {
    /// Declare multipliers shaped like `state`.
    pub fn declare(state: &[Tensor<R>]) -> Self {
        Self {
            alphas: state.iter().map(zeros_like).collect(),
            initialized: false,
        }
    }

    /// Set the multipliers to their terminal values ∂E/∂s_T.
    pub fn initialize(&mut self, values: Vec<Tensor<R>>) -> BilevelResult<()> {
        self.assign(values)?;
        self.initialized = true;
        Ok(())
    }

    /// Overwrite the multipliers with freshly computed adjoints.
    pub fn assign(&mut self, values: Vec<Tensor<R>>) -> BilevelResult<()> {
        if values.len() != self.alphas.len() {
            return Err(BilevelError::StateArity {
                expected: self.alphas.len(),
                actual: values.len(),
            });
        }
        for (old, new) in self.alphas.iter().zip(&values) {
            if old.shape() != new.shape() {
                return Err(BilevelError::ShapeMismatch {
                    context: "lagrangian multiplier".to_string(),
                    expected: old.shape().to_vec(),
                    actual: new.shape().to_vec(),
                });
            }
        }
        self.alphas = values;
        Ok(())
    }

    /// Current multiplier values.
    pub fn values(&self) -> &[Tensor<R>] {
        &self.alphas
    }

    /// Number of multipliers.
    pub fn len(&self) -> usize {
        self.alphas.len()
    }

    /// Check if there are no multipliers.
    pub fn is_empty(&self) -> bool {
        self.alphas.is_empty()
    }

    /// Whether a reset has initialized the multipliers.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// How the outer objective reaches one hyperparameter, with the running
/// values of its hypergradient.
#[derive(Debug, Clone)]
pub enum OuterGradient<R: Runtime> {
    /// Only the initial-state (boundary) Lagrangian depends on the
    /// hyperparameter; no accumulator is kept.
    BoundaryOnly { boundary: Tensor<R> },

    /// The per-step Lagrangian depends on the hyperparameter. `offset` is the
    /// boundary term when the initial state depends on it too.
    Accumulated {
        accumulator: Tensor<R>,
        offset: Option<Tensor<R>>,
    },

    /// No path to the outer objective.
    Detached { zeros: Tensor<R> },
}

impl<R: Runtime> OuterGradient<R> {
    /// Classify a hyperparameter from the definedness of its per-step and
    /// boundary contributions.
    pub fn classify(per_step: bool, boundary: bool, like: &Tensor<R>) -> Self {
        match (per_step, boundary) {
            (true, with_boundary) => Self::Accumulated {
                accumulator: zeros_like(like),
                offset: with_boundary.then(|| zeros_like(like)),
            },
            (false, true) => Self::BoundaryOnly {
                boundary: zeros_like(like),
            },
            (false, false) => Self::Detached {
                zeros: zeros_like(like),
            },
        }
    }

    /// Whether a boundary term contributes.
    pub fn has_boundary(&self) -> bool {
        matches!(
            self,
            Self::BoundaryOnly { .. } | Self::Accumulated { offset: Some(_), .. }
        )
    }

    /// Whether per-step contributions are accumulated.
    pub fn is_accumulated(&self) -> bool {
        matches!(self, Self::Accumulated { .. })
    }

    /// Whether the hyperparameter is detached.
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::Detached { .. })
    }

    /// Current accumulator value, if any.
    pub fn accumulator(&self) -> Option<&Tensor<R>> {
        match self {
            Self::Accumulated { accumulator, .. } => Some(accumulator),
            _ => None,
        }
    }

    /// Current boundary term, if any.
    pub fn boundary(&self) -> Option<&Tensor<R>> {
        match self {
            Self::BoundaryOnly { boundary } => Some(boundary),
            Self::Accumulated { offset, .. } => offset.as_ref(),
            Self::Detached { .. } => None,
        }
    }

    /// Re-initialize the accumulator. No-op for non-accumulated variants.
    pub fn reset_accumulator(&mut self, value: Tensor<R>) {
        if let Self::Accumulated { accumulator, .. } = self {
            *accumulator = value;
        }
    }

    /// Replace the boundary term. No-op when there is none.
    pub fn set_boundary(&mut self, value: Tensor<R>) {
        match self {
            Self::BoundaryOnly { boundary } => *boundary = value,
            Self::Accumulated {
                offset: Some(offset),
                ..
            } => *offset = value,
            _ => {}
        }
    }

    /// Add one step's contribution to the accumulator.
    pub fn accumulate<C>(&mut self, client: &C, contribution: &Tensor<R>) -> BilevelResult<()>
    where
        C: TensorOps<R> + RuntimeClient<R>,
    {
        if let Self::Accumulated { accumulator, .. } = self {
            *accumulator = client.add(accumulator, contribution)?;
        }
        Ok(())
    }

    /// Total hypergradient: accumulator plus boundary term.
    pub fn value<C>(&self, client: &C) -> BilevelResult<Tensor<R>>
    where
        C: TensorOps<R> + RuntimeClient<R>,
    {
        Ok(match self {
            Self::BoundaryOnly { boundary } => boundary.clone(),
            Self::Accumulated {
                accumulator,
                offset: Some(offset),
            } => client.add(accumulator, offset)?,
            Self::Accumulated {
                accumulator,
                offset: None,
            } => accumulator.clone(),
            Self::Detached { zeros } => zeros.clone(),
        })
    }
}
