//! bilevel - Reverse-mode hypergradients for bilevel optimization
//!
//! bilevel differentiates an outer objective through an unrolled inner
//! optimization process. The inner process is written as differentiable numr
//! expressions; the crate runs it forward, stores the visited states and
//! replays them backward with Lagrangian multipliers (the discrete adjoint
//! method) to obtain the gradient of the outer objective w.r.t. the
//! hyperparameters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       bilevel                            │
//! │  (hyperparameters, feeds, history, adjoint sweep)        │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ uses
//! ┌──────────────────────────▼──────────────────────────────┐
//! │                       numr                               │
//! │        (tensors, runtime clients, autograd)              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`hyper`] - Hyperparameter registry and autograd leaves
//! - [`feed`] - Named input bindings and per-step feeds
//! - [`reverse`] - History buffer, gradient-graph builder, forward and backward drivers
//! - [`error`] - Error type shared by all operations
//!
//! # Backend Support
//!
//! The optimizer is generic over numr's `Runtime` trait. The one-shot
//! [`ReverseHypergradientAlgorithms`](reverse::ReverseHypergradientAlgorithms)
//! trait is implemented for the CPU client.
//!
//! # Example
//!
//! ```ignore
//! use bilevel::hyper::HyperparameterRegistry;
//! use bilevel::reverse::{ApplyOptions, ReverseHypergradient, ReverseOptions};
//! use numr::runtime::cpu::{CpuClient, CpuDevice};
//!
//! let device = CpuDevice::new();
//! let client = CpuClient::new(device.clone());
//!
//! let mut registry = HyperparameterRegistry::new();
//! let lr = registry.declare("lr", Tensor::from_slice(&[0.1f64], &[1], &device))?;
//!
//! let mut hg = ReverseHypergradient::new(&dynamics, ReverseOptions::default().truncate(50));
//! hg.compute_gradients(validation_loss, &registry, None, &probe, &client)?;
//! hg.apply_gradients(&registry, &client, ApplyOptions::new(200).with_inner_feed(batches))?;
//! let dlr = hg.hypergradient(lr, &client)?;
//! ```

pub mod error;
pub mod feed;
pub mod hyper;
pub mod reverse;

pub use error::{BilevelError, BilevelResult};
pub use feed::{Bindings, Feed};
pub use hyper::{HyperId, HyperVars, Hyperparameter, HyperparameterRegistry};
