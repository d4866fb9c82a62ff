//! Reverse-mode hypergradients for bilevel optimization.
//!
//! This module differentiates an outer objective through an unrolled inner
//! optimization process using the discrete adjoint (Lagrangian) method.
//!
//! # Overview
//!
//! The inner process is a differentiable recurrence s_{t+1} = Φ(s_t, h) started
//! from s_0 = s_0(h), where h are hyperparameters. For a scalar outer objective
//! E(s_T, h) we want dE/dh. The forward pass runs Φ for T steps and stores the
//! visited states; the backward pass replays them newest-first with one
//! Lagrangian multiplier per state component.
//!
//! # Memory
//!
//! The history holds one snapshot per step. With
//! [`ReverseOptions::truncate`] only the last `L` steps are replayed
//! (truncated reverse-mode).
//!
//! # Example
//!
//! ```ignore
//! use bilevel::reverse::{ApplyOptions, ClosureDynamics, ReverseHypergradientAlgorithms, ReverseOptions};
//! use numr::autograd::{Var, var_add, var_mul};
//!
//! // x_{t+1} = x_t + h, x_0 = 0, E = x_T²
//! let dynamics = ClosureDynamics::new(
//!     |_h: &HyperVars<R>, _f: &Bindings<R>, _c: &C| Ok(vec![Var::new(zero.clone(), false)]),
//!     |s: &[Var<R>], h: &HyperVars<R>, _f: &Bindings<R>, c: &C| Ok(vec![var_add(&s[0], &h[lr], c)?]),
//! );
//! let objective = |s: &[Var<R>], _h: &HyperVars<R>, _f: &Bindings<R>, c: &C| var_mul(&s[0], &s[0], c);
//!
//! let result = client.reverse_hypergradient(
//!     &dynamics, objective, &registry, None, &ReverseOptions::default(), ApplyOptions::new(3),
//! )?;
//! // result.gradient(lr) == 18 h
//! ```

pub mod cpu;
pub mod impl_generic;
pub mod traits;

// Re-exports
pub use impl_generic::{
    HistoryBuffer, HypergradRecorder, MultiplierSet, OuterGradient, ReverseHypergradient,
    reverse_hypergradient_impl,
};
pub use traits::{
    ApplyOptions, ClosureDynamics, DetachedPolicy, Horizon, HypergradientResult, InnerDynamics,
    InnerMethod, OuterObjective, ReverseHypergradientAlgorithms, ReverseOptions, Snapshot,
    StepCallback, StepCounter, StepInfo,
};
