//! Reverse hypergradient optimizer state, reset operation and queries.
//!
//! The graph builder lives in `builder.rs` and the forward/backward drivers in
//! `drivers.rs`; both extend [`ReverseHypergradient`] with further `impl` blocks.

use std::collections::BTreeMap;

use numr::autograd::Var;
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use super::helpers::tensor_to_f64;
use super::history::HistoryBuffer;
use super::lagrangian::{
    MultiplierSet, OuterGradient, grad_or_zeros, gradients_of, lagrangian, leaves,
};
use super::recorder::HypergradRecorder;
use crate::error::{BilevelError, BilevelResult};
use crate::feed::Bindings;
use crate::hyper::{HyperId, HyperVars, HyperparameterRegistry};
use crate::reverse::traits::{InnerDynamics, OuterObjective, ReverseOptions};

/// Per-objective backward state: multipliers and one outer gradient per
/// hyperparameter.
pub(super) struct ObjectiveGraph<'a, R: Runtime, C> {
    pub(super) objective: Box<dyn OuterObjective<R, C> + 'a>,
    pub(super) multipliers: MultiplierSet<R>,
    pub(super) gradients: Vec<(HyperId, OuterGradient<R>)>,
}

/// Reverse-mode hypergradient optimizer.
///
/// Holds the history buffer, the current inner state and, for every outer
/// objective registered with [`compute_gradients`](Self::compute_gradients),
/// its Lagrangian multipliers and outer-gradient accumulators. One instance
/// drives one trajectory at a time.
///
/// # Example
///
/// ```ignore
/// let mut hg = ReverseHypergradient::new(&dynamics, ReverseOptions::default());
/// hg.compute_gradients(objective, &registry, None, &Bindings::new(), &client)?;
/// hg.apply_gradients(&registry, &client, ApplyOptions::new(100))?;
/// let dh = hg.hypergradient(lr, &client)?;
/// ```
pub struct ReverseHypergradient<'a, R: Runtime, C, D> {
    pub(super) inner: &'a D,
    pub(super) options: ReverseOptions,
    pub(super) history: HistoryBuffer<R>,
    pub(super) objectives: Vec<ObjectiveGraph<'a, R, C>>,
    /// Current inner state.
    pub(super) state: Option<Vec<Tensor<R>>>,
    /// Bindings of the last reset, reused for boundary terms.
    pub(super) reverse_feed: Bindings<R>,
    pub(super) realized_steps: usize,
    pub(super) last_step: Option<usize>,
    pub(super) backward_steps: usize,
}

impl<'a, R, C, D> ReverseHypergradient<'a, R, C, D>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
{
    /// Create an optimizer over `inner`.
    pub fn new(inner: &'a D, options: ReverseOptions) -> Self {
        let history = HistoryBuffer::with_truncation(options.truncate_iter);
        Self {
            inner,
            options,
            history,
            objectives: Vec::new(),
            state: None,
            reverse_feed: Bindings::new(),
            realized_steps: 0,
            last_step: None,
            backward_steps: 0,
        }
    }

    /// Set the inner state to its initial value.
    pub fn initialize_state(
        &mut self,
        registry: &HyperparameterRegistry<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> BilevelResult<()> {
        let hypers = registry.vars(false);
        let s0 = self.inner.initial_state(&hypers, feed, client)?;
        self.state = Some(s0.iter().map(|v| v.tensor().clone()).collect());
        Ok(())
    }

    /// Re-initialize multipliers and accumulators on the current (final) state.
    ///
    /// Multipliers become ∂E/∂s_T and accumulators ∂E/∂h, each zero where the
    /// derivative is undefined; boundary terms are recomputed from the new
    /// multipliers. `feed` binds the outer objective and initial-state inputs.
    pub fn reset(
        &mut self,
        registry: &HyperparameterRegistry<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> BilevelResult<()> {
        let state = self.state.as_ref().ok_or_else(|| BilevelError::NotInitialized {
            context: "reset needs an inner state".to_string(),
        })?;

        for graph in &mut self.objectives {
            let hypers = registry.vars(true);
            let s = leaves(state, true);

            let value = graph.objective.evaluate(&s, &hypers, feed, client)?;
            let numel = value.tensor().numel();
            if numel != 1 {
                return Err(BilevelError::NonScalarObjective { numel });
            }

            let grads = gradients_of(client, Some(&value))?;
            let alphas = s.iter().map(|leaf| grad_or_zeros(grads.as_ref(), leaf)).collect();
            graph.multipliers.initialize(alphas)?;

            for (id, gradient) in &mut graph.gradients {
                let leaf = hyper_leaf(&hypers, *id)?;
                gradient.reset_accumulator(grad_or_zeros(grads.as_ref(), leaf));
            }
        }

        self.reverse_feed = feed.clone();
        self.backward_steps = 0;
        refresh_boundaries(self.inner, &mut self.objectives, registry, &self.reverse_feed, client)
    }

    /// Current hypergradient of one hyperparameter, summed over objectives.
    pub fn hypergradient(&self, id: HyperId, client: &C) -> BilevelResult<Tensor<R>> {
        let mut total: Option<Tensor<R>> = None;
        for graph in &self.objectives {
            for (h, gradient) in &graph.gradients {
                if *h != id {
                    continue;
                }
                let value = gradient.value(client)?;
                total = Some(match total {
                    Some(acc) => client.add(&acc, &value)?,
                    None => value,
                });
            }
        }
        total.ok_or(BilevelError::UnknownHyperparameter { id })
    }

    /// Current hypergradients of all registered hyperparameters, in id order.
    pub fn hypergradients(&self, client: &C) -> BilevelResult<Vec<(HyperId, Tensor<R>)>> {
        collect_hypergradients(&self.objectives, client)
    }

    /// All hypergradients concatenated in id order, as f64.
    pub fn flat_hypergradients(&self, client: &C) -> BilevelResult<Vec<f64>> {
        let mut flat = Vec::new();
        for (_, g) in self.hypergradients(client)? {
            flat.extend(tensor_to_f64(&g)?);
        }
        Ok(flat)
    }

    /// Recorder of per-backward-step hypergradients.
    ///
    /// Pass it as the backward callback; it records every registered
    /// hyperparameter, or only `hyper`, optionally concatenated.
    pub fn hypergrad_recorder(
        &self,
        hyper: Option<HyperId>,
        flatten: bool,
    ) -> BilevelResult<HypergradRecorder> {
        if let Some(id) = hyper
            && !self.hyperparameters().contains(&id)
        {
            return Err(BilevelError::UnknownHyperparameter { id });
        }
        Ok(HypergradRecorder::new(hyper, flatten))
    }

    /// Hyperparameters with an outer gradient, in id order.
    pub fn hyperparameters(&self) -> Vec<HyperId> {
        let mut ids: Vec<HyperId> = self
            .objectives
            .iter()
            .flat_map(|g| g.gradients.iter().map(|(id, _)| *id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Options the optimizer was created with.
    pub fn options(&self) -> &ReverseOptions {
        &self.options
    }

    /// Snapshot history of the last pass.
    pub fn history(&self) -> &HistoryBuffer<R> {
        &self.history
    }

    /// Current inner state.
    pub fn state(&self) -> Option<&[Tensor<R>]> {
        self.state.as_deref()
    }

    /// Number of forward steps run by the last pass.
    pub fn realized_steps(&self) -> usize {
        self.realized_steps
    }

    /// Index of the last forward step of the last pass.
    pub fn last_step(&self) -> Option<usize> {
        self.last_step
    }

    /// Number of backward steps replayed since the last reset.
    pub fn backward_steps(&self) -> usize {
        self.backward_steps
    }

    /// Number of registered outer objectives.
    pub fn objective_count(&self) -> usize {
        self.objectives.len()
    }

    /// Lagrangian multipliers of one objective.
    pub fn multipliers(&self, objective: usize) -> Option<&[Tensor<R>]> {
        self.objectives
            .get(objective)
            .map(|g| g.multipliers.values())
    }

    /// Outer gradient of one hyperparameter for one objective.
    pub fn outer_gradient(&self, objective: usize, id: HyperId) -> Option<&OuterGradient<R>> {
        self.objectives.get(objective).and_then(|g| {
            g.gradients
                .iter()
                .find(|(h, _)| *h == id)
                .map(|(_, gradient)| gradient)
        })
    }
}

/// Leaf of `id`, or an error if the registry does not know it.
pub(super) fn hyper_leaf<R: Runtime>(
    hypers: &HyperVars<R>,
    id: HyperId,
) -> BilevelResult<&Var<R>> {
    hypers
        .get(id)
        .ok_or(BilevelError::UnknownHyperparameter { id })
}

/// Recompute the boundary terms α_0ᵀ · ∂s_0/∂h from the current multipliers.
pub(super) fn refresh_boundaries<R, C, D>(
    inner: &D,
    objectives: &mut [ObjectiveGraph<'_, R, C>],
    registry: &HyperparameterRegistry<R>,
    feed: &Bindings<R>,
    client: &C,
) -> BilevelResult<()>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
{
    for graph in objectives {
        if !graph.gradients.iter().any(|(_, g)| g.has_boundary()) {
            continue;
        }

        let hypers = registry.vars(true);
        let s0 = inner.initial_state(&hypers, feed, client)?;
        let lag0 = lagrangian(client, graph.multipliers.values(), &s0)?;
        let grads = gradients_of(client, lag0.as_ref())?;

        for (id, gradient) in &mut graph.gradients {
            if gradient.has_boundary() {
                let leaf = hyper_leaf(&hypers, *id)?;
                gradient.set_boundary(grad_or_zeros(grads.as_ref(), leaf));
            }
        }
    }
    Ok(())
}

/// Sum outer gradients over objectives, per hyperparameter.
pub(super) fn collect_hypergradients<R, C>(
    objectives: &[ObjectiveGraph<'_, R, C>],
    client: &C,
) -> BilevelResult<Vec<(HyperId, Tensor<R>)>>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
{
    let mut totals: BTreeMap<HyperId, Tensor<R>> = BTreeMap::new();
    for graph in objectives {
        for (id, gradient) in &graph.gradients {
            let value = gradient.value(client)?;
            let total = match totals.remove(id) {
                Some(acc) => client.add(&acc, &value)?,
                None => value,
            };
            totals.insert(*id, total);
        }
    }
    Ok(totals.into_iter().collect())
}
