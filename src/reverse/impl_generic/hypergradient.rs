//! One-shot reverse hypergradient computation.

use numr::dtype::DType;
use numr::ops::{ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use tracing::info;

use super::helpers::step_counter;
use super::optimizer::ReverseHypergradient;
use crate::error::BilevelResult;
use crate::feed::Bindings;
use crate::hyper::{HyperId, HyperparameterRegistry};
use crate::reverse::traits::{
    ApplyOptions, HypergradientResult, InnerDynamics, InnerMethod, OuterObjective, ReverseOptions,
};

/// Compute hypergradients of `objective` through `inner` in a single call.
///
/// Builds a [`ReverseHypergradient`], registers `objective`, runs one forward
/// and backward pass and returns the hypergradients of every involved
/// hyperparameter.
///
/// Connectivity is probed with the initializer bindings at the global step
/// merged with the inner bindings of step 0 (and, when the inner method is
/// aggregated, the outer bindings and the counter of step 0).
pub fn reverse_hypergradient_impl<R, C, D, O>(
    client: &C,
    inner: &D,
    objective: O,
    registry: &HyperparameterRegistry<R>,
    hypers: Option<&[HyperId]>,
    options: &ReverseOptions,
    apply: ApplyOptions<'_, R, C>,
) -> BilevelResult<HypergradientResult<R>>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R> + ScalarOps<R>,
    D: InnerDynamics<R, C>,
    O: OuterObjective<R, C>,
{
    let global_step = apply.global_step.unwrap_or(0);
    let mut probe = Bindings::merged(apply.init_feed.resolve(global_step), apply.inner_feed.resolve(0));
    if let InnerMethod::Aggregated {
        step_binding,
        counter,
    } = &apply.inner_method
    {
        // The counter follows the hyperparameter dtype until a state exists.
        let dtype = match registry.ids().first() {
            Some(&id) => registry.value(id)?.dtype(),
            None => DType::F64,
        };
        probe.merge(apply.outer_feed.resolve(global_step));
        probe.insert(
            step_binding.clone(),
            step_counter::<R>(*counter, 0, dtype, client.device())?,
        );
    }

    let mut optimizer = ReverseHypergradient::new(inner, options.clone());
    let involved = optimizer.compute_gradients(objective, registry, hypers, &probe, client)?;
    optimizer.apply_gradients(registry, client, apply)?;

    let gradients = optimizer
        .hypergradients(client)?
        .into_iter()
        .filter(|(id, _)| involved.contains(id))
        .collect();

    info!(
        forward_steps = optimizer.realized_steps(),
        backward_steps = optimizer.backward_steps(),
        hypers = involved.len(),
        "reverse hypergradient computed"
    );

    Ok(HypergradientResult {
        hypers: involved,
        gradients,
        forward_steps: optimizer.realized_steps(),
        backward_steps: optimizer.backward_steps(),
    })
}
