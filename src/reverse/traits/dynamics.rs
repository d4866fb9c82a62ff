//! Inner dynamics and outer objective interfaces.

use numr::autograd::Var;
use numr::error::Result;
use numr::runtime::Runtime;

use crate::feed::Bindings;
use crate::hyper::HyperVars;

/// The inner optimization process, written as differentiable expressions.
///
/// Both methods build their result from numr autograd operations on the given
/// leaves, so the optimizer can differentiate them w.r.t. state and
/// hyperparameters. Any hyperparameter used by `initial_state` contributes a
/// boundary term to its hypergradient.
pub trait InnerDynamics<R: Runtime, C> {
    /// State at t = 0.
    fn initial_state(
        &self,
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Vec<Var<R>>>;

    /// Next state as a function of the current state: s_{t+1} = Φ(s_t, h).
    fn step(
        &self,
        state: &[Var<R>],
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Vec<Var<R>>>;
}

/// [`InnerDynamics`] assembled from two closures.
pub struct ClosureDynamics<I, S> {
    init: I,
    step: S,
}

impl<I, S> ClosureDynamics<I, S> {
    /// Create dynamics from an initial-state closure and a step closure.
    pub fn new(init: I, step: S) -> Self {
        Self { init, step }
    }
}

impl<R, C, I, S> InnerDynamics<R, C> for ClosureDynamics<I, S>
where
    R: Runtime,
    I: Fn(&HyperVars<R>, &Bindings<R>, &C) -> Result<Vec<Var<R>>>,
    S: Fn(&[Var<R>], &HyperVars<R>, &Bindings<R>, &C) -> Result<Vec<Var<R>>>,
{
    fn initial_state(
        &self,
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Vec<Var<R>>> {
        (self.init)(hypers, feed, client)
    }

    fn step(
        &self,
        state: &[Var<R>],
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Vec<Var<R>>> {
        (self.step)(state, hypers, feed, client)
    }
}

/// Scalar outer objective E(s_T, h).
pub trait OuterObjective<R: Runtime, C> {
    /// Evaluate the objective on the final inner state.
    fn evaluate(
        &self,
        state: &[Var<R>],
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Var<R>>;
}

impl<R, C, F> OuterObjective<R, C> for F
where
    R: Runtime,
    F: Fn(&[Var<R>], &HyperVars<R>, &Bindings<R>, &C) -> Result<Var<R>>,
{
    fn evaluate(
        &self,
        state: &[Var<R>],
        hypers: &HyperVars<R>,
        feed: &Bindings<R>,
        client: &C,
    ) -> Result<Var<R>> {
        self(state, hypers, feed, client)
    }
}
