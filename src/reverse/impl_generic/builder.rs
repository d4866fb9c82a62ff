//! Gradient-graph builder.
//!
//! Registers an outer objective and decides, per hyperparameter, how its
//! hypergradient is formed: accumulated over backward steps, taken from the
//! initial-state (boundary) term, both, or not at all.

use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::{debug, warn};

use super::lagrangian::{MultiplierSet, OuterGradient, defined_grad, gradients_of, lagrangian, leaves};
use super::optimizer::{ObjectiveGraph, ReverseHypergradient, hyper_leaf};
use crate::error::{BilevelError, BilevelResult};
use crate::feed::Bindings;
use crate::hyper::{HyperId, HyperparameterRegistry};
use crate::reverse::traits::{DetachedPolicy, InnerDynamics, OuterObjective};

impl<'a, R, C, D> ReverseHypergradient<'a, R, C, D>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
{
    /// Register an outer objective and classify its hyperparameters.
    ///
    /// # Algorithm
    ///
    /// 1. Evaluate the initial-state expressions s_0(h) with `probe_feed`
    /// 2. Form the boundary Lagrangian Σ sum(α ⊙ s_0) and the iteration-wise
    ///    Lagrangian Σ sum(α ⊙ Φ(s_0, h)) with unit probe multipliers
    /// 3. A hyperparameter with a defined gradient of the iteration-wise
    ///    Lagrangian gets an accumulator; one with a defined gradient of the
    ///    boundary Lagrangian gets a boundary term
    /// 4. A hyperparameter with neither is detached: an error, or a warning
    ///    and a zero hypergradient under [`DetachedPolicy::Warn`]
    ///
    /// Multipliers are declared with zeros; [`reset`](Self::reset) sets them
    /// to ∂E/∂s_T before every backward pass.
    ///
    /// # Arguments
    ///
    /// * `objective` - Scalar outer objective E(s_T, h)
    /// * `registry` - Hyperparameter values
    /// * `hypers` - Hyperparameters to differentiate (all registered if `None`)
    /// * `probe_feed` - Bindings the dynamics need to be evaluated once
    /// * `client` - Runtime client
    ///
    /// # Returns
    ///
    /// The hyperparameters that reach the objective.
    pub fn compute_gradients<O>(
        &mut self,
        objective: O,
        registry: &HyperparameterRegistry<R>,
        hypers: Option<&[HyperId]>,
        probe_feed: &Bindings<R>,
        client: &C,
    ) -> BilevelResult<Vec<HyperId>>
    where
        O: OuterObjective<R, C> + 'a,
    {
        let requested = match hypers {
            Some(ids) => ids.to_vec(),
            None => registry.ids(),
        };
        let mut targets: Vec<HyperId> = Vec::new();
        for id in requested {
            if !registry.contains(id) {
                return Err(BilevelError::UnknownHyperparameter { id });
            }
            if !targets.contains(&id) {
                targets.push(id);
            }
        }

        let hyper_vars = registry.vars(true);

        // Boundary probe: α · s_0(h)
        let s0 = self.inner.initial_state(&hyper_vars, probe_feed, client)?;
        let s0_values: Vec<Tensor<R>> = s0.iter().map(|v| v.tensor().clone()).collect();
        let probe_alphas: Vec<Tensor<R>> = s0_values
            .iter()
            .map(|t| Tensor::<R>::ones(t.shape(), t.dtype(), t.device()))
            .collect();
        let lag0 = lagrangian(client, &probe_alphas, &s0)?;
        let boundary_grads = gradients_of(client, lag0.as_ref())?;

        // Per-step probe: α · Φ(s_0, h)
        let state = leaves(&s0_values, true);
        let phi = self.inner.step(&state, &hyper_vars, probe_feed, client)?;
        if phi.len() != state.len() {
            return Err(BilevelError::StateArity {
                expected: state.len(),
                actual: phi.len(),
            });
        }
        let lag = lagrangian(client, &probe_alphas, &phi)?;
        let step_grads = gradients_of(client, lag.as_ref())?;

        let mut gradients = Vec::with_capacity(targets.len());
        let mut involved = Vec::with_capacity(targets.len());
        for id in targets {
            let leaf = hyper_leaf(&hyper_vars, id)?;
            let per_step = defined_grad(step_grads.as_ref(), leaf).is_some();
            let boundary = defined_grad(boundary_grads.as_ref(), leaf).is_some();
            let gradient = OuterGradient::classify(per_step, boundary, registry.value(id)?);

            if gradient.is_detached() {
                let name = registry.name(id)?.to_string();
                match self.options.detached_policy {
                    DetachedPolicy::Error => {
                        return Err(BilevelError::DetachedHyperparameter { name });
                    }
                    DetachedPolicy::Warn => {
                        warn!(
                            hyper = %name,
                            "hyperparameter appears in no part of the computation; its hypergradient is zero"
                        );
                    }
                }
            } else {
                involved.push(id);
            }

            debug!(hyper = %id, per_step, boundary, "classified hyperparameter");
            gradients.push((id, gradient));
        }

        self.objectives.push(ObjectiveGraph {
            objective: Box::new(objective),
            multipliers: MultiplierSet::declare(&s0_values),
            gradients,
        });

        Ok(involved)
    }
}
