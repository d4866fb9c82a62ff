//! One-shot reverse hypergradient trait.
//!
//! Defines the interface for computing hypergradients of a bilevel problem in a
//! single call, without keeping the optimizer around.

use numr::runtime::Runtime;

use super::dynamics::{InnerDynamics, OuterObjective};
use super::types::{ApplyOptions, HypergradientResult, ReverseOptions};
use crate::error::BilevelResult;
use crate::hyper::{HyperId, HyperparameterRegistry};

/// Trait for reverse-mode hypergradient algorithms.
///
/// Computes dE/dh for an outer objective E = E(s_T, h), where the inner state
/// follows s_{t+1} = Φ(s_t, h) from s_0 = s_0(h).
///
/// # Mathematical Background
///
/// With multipliers α_t for every state component, the discrete adjoint method
/// computes:
/// 1. Forward pass: run Φ for T steps, storing the visited states
/// 2. Terminal condition: α_T = ∂E/∂s_T, accumulator = ∂E/∂h
/// 3. Backward step t = T-1..0: accumulator += α_{t+1}ᵀ · ∂Φ/∂h(s_t),
///    then α_t = α_{t+1}ᵀ · ∂Φ/∂s(s_t)
/// 4. Boundary term: dE/dh = accumulator + α_0ᵀ · ∂s_0/∂h
///
/// # Memory
///
/// One snapshot per step is stored. With truncation only the last `L` steps are
/// replayed, trading hypergradient accuracy for bounded memory.
pub trait ReverseHypergradientAlgorithms<R: Runtime> {
    /// Compute hypergradients of `objective` through `inner`.
    ///
    /// # Arguments
    ///
    /// * `inner` - Inner dynamics
    /// * `objective` - Scalar outer objective on the final state
    /// * `registry` - Hyperparameter values
    /// * `hypers` - Hyperparameters to differentiate (all registered if `None`)
    /// * `options` - Optimizer options (truncation, detached policy)
    /// * `apply` - Horizon, feeds and callbacks for the pass
    ///
    /// Graph connectivity is probed with the initializer bindings merged with
    /// the inner bindings of step 0.
    ///
    /// # Example
    ///
    /// ```ignore
    /// // x_{t+1} = x_t + h, x_0 = 0, E = x_3², dE/dh = 18h
    /// let result = client.reverse_hypergradient(
    ///     &dynamics, objective, &registry, None, &ReverseOptions::default(),
    ///     ApplyOptions::new(3),
    /// )?;
    /// ```
    fn reverse_hypergradient<D, O>(
        &self,
        inner: &D,
        objective: O,
        registry: &HyperparameterRegistry<R>,
        hypers: Option<&[HyperId]>,
        options: &ReverseOptions,
        apply: ApplyOptions<'_, R, Self>,
    ) -> BilevelResult<HypergradientResult<R>>
    where
        Self: Sized,
        D: InnerDynamics<R, Self>,
        O: OuterObjective<R, Self>;
}
