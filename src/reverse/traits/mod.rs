//! Trait definitions for reverse-mode hypergradients.

mod dynamics;
mod reverse;
mod types;

pub use dynamics::{ClosureDynamics, InnerDynamics, OuterObjective};
pub use reverse::ReverseHypergradientAlgorithms;
pub use types::{
    ApplyOptions, DetachedPolicy, Horizon, HypergradientResult, InnerMethod, ReverseOptions,
    Snapshot, StepCallback, StepCounter, StepInfo,
};
