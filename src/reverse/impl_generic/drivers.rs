//! Forward and backward drivers.
//!
//! The forward driver runs the inner steps and fills the history; the
//! backward driver replays it newest-first, accumulating hypergradients and
//! updating the Lagrangian multipliers one step at a time.

use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::{debug, trace, warn};

use super::helpers::step_counter;
use super::lagrangian::{defined_grad, grad_or_zeros, gradients_of, lagrangian, leaves};
use super::optimizer::{
    ObjectiveGraph, ReverseHypergradient, collect_hypergradients, hyper_leaf, refresh_boundaries,
};
use crate::error::{BilevelError, BilevelResult};
use crate::feed::Bindings;
use crate::hyper::HyperparameterRegistry;
use crate::reverse::traits::{ApplyOptions, InnerDynamics, InnerMethod, StepInfo};

impl<'a, R, C, D> ReverseHypergradient<'a, R, C, D>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
{
    /// Run the inner optimization and accumulate hypergradients.
    ///
    /// # Algorithm
    ///
    /// 1. Clear the history; record the initial state (re-initialized unless
    ///    running online)
    /// 2. **Forward pass**: run every step of the horizon, recording the
    ///    state after each step
    /// 3. **Reset**: multipliers ← ∂E/∂s_T, accumulators ← ∂E/∂h, using the
    ///    outer bindings merged with the initializer bindings
    /// 4. Drop the final snapshot, which only served the objective
    /// 5. **Backward pass**: for each remaining snapshot, newest first,
    ///    accumulate αᵀ · ∂Φ/∂h and then set α ← αᵀ · ∂Φ/∂s
    ///
    /// After the call the hypergradients are available through
    /// [`hypergradient`](Self::hypergradient) and friends.
    pub fn apply_gradients(
        &mut self,
        registry: &HyperparameterRegistry<R>,
        client: &C,
        mut apply: ApplyOptions<'_, R, C>,
    ) -> BilevelResult<()> {
        if self.objectives.is_empty() {
            return Err(BilevelError::NoObjectives);
        }

        let global_step = apply.global_step.unwrap_or(0);
        let offset = if apply.online {
            let n = apply
                .horizon
                .fixed_len()
                .ok_or(BilevelError::OnlineRequiresFixedHorizon)?;
            n.checked_mul(global_step)
                .ok_or_else(|| step_overflow(global_step))?
        } else {
            0
        };
        let adjust = |t: usize| t.checked_add(offset).ok_or_else(|| step_overflow(global_step));

        self.history.clear();
        let init_bindings = apply.init_feed.resolve(global_step);
        if !apply.online || self.state.is_none() {
            self.initialize_state(registry, &init_bindings, client)?;
        }
        let initial = self.state.clone().ok_or_else(|| BilevelError::NotInitialized {
            context: "inner state".to_string(),
        })?;
        self.history.record(None, initial);

        self.forward(registry, client, &mut apply, &adjust)?;

        let reverse_feed = Bindings::merged(apply.outer_feed.resolve(global_step), init_bindings);
        self.reset(registry, &reverse_feed, client)?;

        self.backward(registry, client, &mut apply, &adjust)
    }

    fn forward(
        &mut self,
        registry: &HyperparameterRegistry<R>,
        client: &C,
        apply: &mut ApplyOptions<'_, R, C>,
        adjust: &dyn Fn(usize) -> BilevelResult<usize>,
    ) -> BilevelResult<()> {
        let mut state = self.state.clone().ok_or_else(|| BilevelError::NotInitialized {
            context: "inner state".to_string(),
        })?;
        let hypers = registry.vars(false);

        self.realized_steps = 0;
        self.last_step = None;

        for t in apply.horizon.steps() {
            let step = adjust(t)?;
            let bindings = step_bindings(apply, t, step, &state)?;

            let inputs = leaves(&state, false);
            let next = self.inner.step(&inputs, &hypers, &bindings, client)?;
            if next.len() != inputs.len() {
                return Err(BilevelError::StateArity {
                    expected: inputs.len(),
                    actual: next.len(),
                });
            }
            state = next.iter().map(|v| v.tensor().clone()).collect();

            self.history.record(Some(t), state.clone());
            self.realized_steps += 1;
            self.last_step = Some(t);
            trace!(step, "forward step");

            if let Some(callback) = apply.forward_callback.as_mut() {
                callback.on_step(&StepInfo {
                    step,
                    bindings: &bindings,
                    client,
                    state: &state,
                    hypergradients: None,
                })?;
            }
        }

        if self.history.evicted() > 0 {
            warn!(
                steps = self.realized_steps,
                evicted = self.history.evicted(),
                "history truncated; contributions of the oldest steps are dropped"
            );
        }
        debug!(steps = self.realized_steps, "forward pass complete");

        self.state = Some(state);
        Ok(())
    }

    fn backward(
        &mut self,
        registry: &HyperparameterRegistry<R>,
        client: &C,
        apply: &mut ApplyOptions<'_, R, C>,
        adjust: &dyn Fn(usize) -> BilevelResult<usize>,
    ) -> BilevelResult<()> {
        let last = self
            .history
            .pop_last()
            .ok_or_else(|| BilevelError::NotInitialized {
                context: "history is empty".to_string(),
            })?;

        let expected = match self.history.max_replay_steps() {
            Some(max_steps) => self.realized_steps.min(max_steps),
            None => self.realized_steps,
        };
        if self.history.len() != expected {
            return Err(BilevelError::HistoryLengthMismatch {
                retained: self.history.len(),
                expected,
            });
        }

        let Self {
            inner,
            history,
            objectives,
            reverse_feed,
            backward_steps,
            ..
        } = self;

        // Each snapshot is consumed by the step that produced its successor.
        let mut consumer = last.produced_by;
        for snapshot in history.iter_reverse() {
            let t = consumer.ok_or_else(|| BilevelError::InvalidInput {
                context: "history snapshot without a consuming step".to_string(),
            })?;
            let step = adjust(t)?;
            let bindings = step_bindings(apply, t, step, &snapshot.state)?;

            backward_step(*inner, objectives, registry, &snapshot.state, &bindings, client)?;
            *backward_steps += 1;
            trace!(step, "backward step");

            if let Some(callback) = apply.backward_callback.as_mut() {
                refresh_boundaries(*inner, objectives, registry, reverse_feed, client)?;
                let current = collect_hypergradients(objectives, client)?;
                callback.on_step(&StepInfo {
                    step,
                    bindings: &bindings,
                    client,
                    state: &snapshot.state,
                    hypergradients: Some(current.as_slice()),
                })?;
            }

            consumer = snapshot.produced_by;
        }

        refresh_boundaries(*inner, objectives, registry, reverse_feed, client)?;
        debug!(steps = *backward_steps, "backward pass complete");
        Ok(())
    }
}

/// One combined backward step on the state pinned to `state`.
///
/// A single backward evaluation of the iteration-wise Lagrangian yields both
/// the hyperparameter contribution, which is accumulated, and the new
/// multipliers, so the accumulation always sees the multipliers from before
/// the update.
fn backward_step<R, C, D>(
    inner: &D,
    objectives: &mut [ObjectiveGraph<'_, R, C>],
    registry: &HyperparameterRegistry<R>,
    state: &[Tensor<R>],
    bindings: &Bindings<R>,
    client: &C,
) -> BilevelResult<()>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
{
    for graph in objectives {
        let hypers = registry.vars(true);
        let s = leaves(state, true);

        let phi = inner.step(&s, &hypers, bindings, client)?;
        if phi.len() != s.len() {
            return Err(BilevelError::StateArity {
                expected: s.len(),
                actual: phi.len(),
            });
        }

        let lag = lagrangian(client, graph.multipliers.values(), &phi)?;
        let grads = gradients_of(client, lag.as_ref())?;

        for (id, gradient) in &mut graph.gradients {
            if !gradient.is_accumulated() {
                continue;
            }
            let leaf = hyper_leaf(&hypers, *id)?;
            if let Some(contribution) = defined_grad(grads.as_ref(), leaf) {
                gradient.accumulate(client, contribution)?;
            }
        }

        let alphas = s.iter().map(|leaf| grad_or_zeros(grads.as_ref(), leaf)).collect();
        graph.multipliers.assign(alphas)?;
    }
    Ok(())
}

/// Bindings for step `t` (virtual index `step`).
fn step_bindings<R: Runtime, C>(
    apply: &ApplyOptions<'_, R, C>,
    t: usize,
    step: usize,
    state: &[Tensor<R>],
) -> BilevelResult<Bindings<R>> {
    let mut bindings = apply.inner_feed.resolve(step);
    if let InnerMethod::Aggregated {
        step_binding,
        counter,
    } = &apply.inner_method
    {
        let like = state.first().ok_or_else(|| BilevelError::InvalidInput {
            context: "aggregated inner method needs a non-empty state".to_string(),
        })?;
        bindings.merge(apply.outer_feed.resolve(step));
        bindings.insert(
            step_binding.clone(),
            step_counter::<R>(*counter, t, like.dtype(), like.device())?,
        );
    }
    Ok(bindings)
}

fn step_overflow(global_step: usize) -> BilevelError {
    BilevelError::InvalidInput {
        context: format!("virtual step index overflows at global step {}", global_step),
    }
}
