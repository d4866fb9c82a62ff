//! Types for reverse-mode hypergradient computation.
//!
//! These types configure the optimizer, describe one `apply_gradients` call and
//! carry results and per-step observations.

use std::fmt;

use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{BilevelError, BilevelResult};
use crate::feed::{Bindings, Feed};
use crate::hyper::HyperId;
use crate::reverse::impl_generic::helpers::tensor_to_f64;

/// What to do when a hyperparameter has no path to the outer objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachedPolicy {
    /// Fail graph construction.
    #[default]
    Error,

    /// Log a warning and report a zero hypergradient.
    Warn,
}

/// Options for the reverse hypergradient optimizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseOptions {
    /// Maximum number of inner steps replayed backward (default: unbounded).
    ///
    /// With `Some(L)` the history keeps the last `L + 1` snapshots and
    /// contributions of older steps are dropped (truncated reverse-mode).
    pub truncate_iter: Option<usize>,

    /// Policy for detached hyperparameters (default: Error).
    pub detached_policy: DetachedPolicy,
}

impl ReverseOptions {
    /// Replay at most `max_steps` backward steps.
    pub fn truncate(mut self, max_steps: usize) -> Self {
        self.truncate_iter = Some(max_steps);
        self
    }

    /// Set the detached-hyperparameter policy.
    pub fn with_detached_policy(mut self, policy: DetachedPolicy) -> Self {
        self.detached_policy = policy;
        self
    }
}

/// Number of inner steps to run.
pub enum Horizon {
    /// Steps `0..n`.
    Fixed(usize),

    /// A lazily produced sequence of step indices.
    ///
    /// The factory is called once per pass, so a termination condition can be
    /// expressed as an iterator adaptor.
    Stream(Box<dyn Fn() -> Box<dyn Iterator<Item = usize>>>),
}

impl Horizon {
    /// Horizon driven by a step-index iterator factory.
    pub fn stream<F, I>(factory: F) -> Self
    where
        F: Fn() -> I + 'static,
        I: Iterator<Item = usize> + 'static,
    {
        Self::Stream(Box::new(move || Box::new(factory())))
    }

    /// Step indices for one pass.
    pub fn steps(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            Self::Fixed(n) => Box::new(0..*n),
            Self::Stream(factory) => factory(),
        }
    }

    /// Number of steps, when known in advance.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "Horizon::Fixed({})", n),
            Self::Stream(_) => write!(f, "Horizon::Stream(..)"),
        }
    }
}

impl From<usize> for Horizon {
    fn from(n: usize) -> Self {
        Self::Fixed(n)
    }
}

/// How inner steps are fed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InnerMethod {
    /// Inner steps see only the inner bindings.
    #[default]
    Reverse,

    /// Inner steps also see the outer bindings, plus an iteration counter
    /// bound under `step_binding`.
    Aggregated {
        step_binding: String,
        counter: StepCounter,
    },
}

impl InnerMethod {
    /// Aggregated method with a scalar counter `t + 1`.
    pub fn aggregated(step_binding: impl Into<String>) -> Self {
        Self::Aggregated {
            step_binding: step_binding.into(),
            counter: StepCounter::Scalar,
        }
    }

    /// Aggregated method with a one-hot `(len, 1)` counter, for aggregation
    /// weights with one entry per inner step.
    pub fn aggregated_one_hot(step_binding: impl Into<String>, len: usize) -> Self {
        Self::Aggregated {
            step_binding: step_binding.into(),
            counter: StepCounter::OneHot { len },
        }
    }
}

/// Encoding of the iteration counter bound by the aggregated inner method.
///
/// The counter takes the dtype of the inner state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepCounter {
    /// `[t + 1]`, shape `[1]`.
    #[default]
    Scalar,

    /// Column of shape `(len, 1)` with a one in row `t`. Steps at or past
    /// `len` are rejected.
    OneHot { len: usize },
}

/// What a step callback sees.
pub struct StepInfo<'s, R: Runtime, C> {
    /// Virtual step index (shifted by the global step in online mode).
    pub step: usize,

    /// Bindings used for the step.
    pub bindings: &'s Bindings<R>,

    /// Client that executed the step.
    pub client: &'s C,

    /// State after a forward step, or the pinned snapshot of a backward step.
    pub state: &'s [Tensor<R>],

    /// Current hypergradients; only provided on backward steps.
    pub hypergradients: Option<&'s [(HyperId, Tensor<R>)]>,
}

/// Observer invoked after forward or backward steps.
pub trait StepCallback<R: Runtime, C> {
    /// Called once per step, after the step completed.
    fn on_step(&mut self, info: &StepInfo<'_, R, C>) -> BilevelResult<()>;
}

impl<R, C, F> StepCallback<R, C> for F
where
    R: Runtime,
    F: FnMut(&StepInfo<'_, R, C>) -> BilevelResult<()>,
{
    fn on_step(&mut self, info: &StepInfo<'_, R, C>) -> BilevelResult<()> {
        self(info)
    }
}

/// Arguments of one `apply_gradients` call.
pub struct ApplyOptions<'c, R: Runtime, C> {
    /// Inner horizon.
    pub horizon: Horizon,

    /// Bindings for inner steps, per virtual step index.
    pub inner_feed: Feed<R>,

    /// Bindings for the outer objective, evaluated at the global step.
    pub outer_feed: Feed<R>,

    /// Bindings for the initial-state expressions, evaluated at the global step.
    pub init_feed: Feed<R>,

    /// Externally tracked outer iteration counter.
    pub global_step: Option<usize>,

    /// Continue from the current inner state instead of re-initializing it.
    pub online: bool,

    /// How inner steps are fed.
    pub inner_method: InnerMethod,

    /// Called after every forward step.
    pub forward_callback: Option<&'c mut dyn StepCallback<R, C>>,

    /// Called after every backward step.
    pub backward_callback: Option<&'c mut dyn StepCallback<R, C>>,
}

impl<'c, R: Runtime, C> ApplyOptions<'c, R, C> {
    /// Options for a pass over `horizon` with no inputs.
    pub fn new(horizon: impl Into<Horizon>) -> Self {
        Self {
            horizon: horizon.into(),
            inner_feed: Feed::Empty,
            outer_feed: Feed::Empty,
            init_feed: Feed::Empty,
            global_step: None,
            online: false,
            inner_method: InnerMethod::Reverse,
            forward_callback: None,
            backward_callback: None,
        }
    }

    /// Set the inner-step feed.
    pub fn with_inner_feed(mut self, feed: impl Into<Feed<R>>) -> Self {
        self.inner_feed = feed.into();
        self
    }

    /// Set the outer-objective feed.
    pub fn with_outer_feed(mut self, feed: impl Into<Feed<R>>) -> Self {
        self.outer_feed = feed.into();
        self
    }

    /// Set the initial-state feed.
    pub fn with_init_feed(mut self, feed: impl Into<Feed<R>>) -> Self {
        self.init_feed = feed.into();
        self
    }

    /// Set the global step.
    pub fn with_global_step(mut self, step: usize) -> Self {
        self.global_step = Some(step);
        self
    }

    /// Enable or disable online mode.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Set the inner method.
    pub fn with_inner_method(mut self, method: InnerMethod) -> Self {
        self.inner_method = method;
        self
    }

    /// Observe forward steps.
    pub fn with_forward_callback(mut self, callback: &'c mut dyn StepCallback<R, C>) -> Self {
        self.forward_callback = Some(callback);
        self
    }

    /// Observe backward steps.
    pub fn with_backward_callback(mut self, callback: &'c mut dyn StepCallback<R, C>) -> Self {
        self.backward_callback = Some(callback);
        self
    }
}

/// Result of a one-shot reverse hypergradient computation.
#[derive(Debug, Clone)]
pub struct HypergradientResult<R: Runtime> {
    /// Hyperparameters involved in the computation.
    pub hypers: Vec<HyperId>,

    /// Hypergradient per involved hyperparameter.
    pub gradients: Vec<(HyperId, Tensor<R>)>,

    /// Number of forward steps executed.
    pub forward_steps: usize,

    /// Number of backward steps replayed.
    pub backward_steps: usize,
}

impl<R: Runtime> HypergradientResult<R> {
    /// Hypergradient of one hyperparameter.
    pub fn gradient(&self, id: HyperId) -> Option<&Tensor<R>> {
        self.gradients
            .iter()
            .find(|(h, _)| *h == id)
            .map(|(_, g)| g)
    }

    /// Hypergradient of one hyperparameter as a Vec<f64>, converted from
    /// F32 when needed.
    pub fn gradient_vec(&self, id: HyperId) -> BilevelResult<Vec<f64>> {
        let g = self
            .gradient(id)
            .ok_or(BilevelError::UnknownHyperparameter { id })?;
        tensor_to_f64(g)
    }
}

/// A forward-pass state snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot<R: Runtime> {
    /// Index of the forward step that produced this state (`None` for the
    /// initial state).
    pub produced_by: Option<usize>,

    /// Inner state components.
    pub state: Vec<Tensor<R>>,
}

impl<R: Runtime> Snapshot<R> {
    /// Create a new snapshot.
    pub fn new(produced_by: Option<usize>, state: Vec<Tensor<R>>) -> Self {
        Self { produced_by, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json() {
        let opts: ReverseOptions =
            serde_json::from_str(r#"{"truncate_iter": 5, "detached_policy": "warn"}"#).unwrap();
        assert_eq!(opts.truncate_iter, Some(5));
        assert_eq!(opts.detached_policy, DetachedPolicy::Warn);

        let defaults: ReverseOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, ReverseOptions::default());
    }

    #[test]
    fn test_options_builder() {
        let opts = ReverseOptions::default()
            .truncate(3)
            .with_detached_policy(DetachedPolicy::Warn);
        let json = serde_json::to_string(&opts).unwrap();
        let back: ReverseOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn test_horizon_steps() {
        assert_eq!(Horizon::Fixed(3).steps().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(Horizon::from(0).steps().count(), 0);

        let stream = Horizon::stream(|| (0..).take_while(|t| t * t < 10));
        assert_eq!(stream.fixed_len(), None);
        assert_eq!(stream.steps().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        // The factory is re-run for every pass.
        assert_eq!(stream.steps().count(), 4);
    }
}
