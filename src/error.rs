//! Error types for hypergradient computation.

use thiserror::Error;

use crate::hyper::HyperId;

/// Result type for hypergradient operations.
pub type BilevelResult<T> = Result<T, BilevelError>;

/// Errors that can occur while building or running a reverse hypergradient pass.
#[derive(Debug, Clone, Error)]
pub enum BilevelError {
    /// A hyperparameter reaches the outer objective through neither the per-step
    /// Lagrangian nor the initial-state (boundary) Lagrangian.
    #[error(
        "hyperparameter '{name}' appears in no part of the computation; check the graph connectivity"
    )]
    DetachedHyperparameter { name: String },

    /// The id does not belong to the registry (or to the objective being queried).
    #[error("unknown hyperparameter {id}")]
    UnknownHyperparameter { id: HyperId },

    /// A hyperparameter with this name was already declared.
    #[error("hyperparameter '{name}' is already declared")]
    DuplicateHyperparameter { name: String },

    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The inner step returned a different number of state components.
    #[error("inner dynamics returned {actual} state components, expected {expected}")]
    StateArity { expected: usize, actual: usize },

    /// The outer objective must evaluate to a single element.
    #[error("outer objective must be scalar, got {numel} elements")]
    NonScalarObjective { numel: usize },

    /// The retained history does not match the realized horizon.
    #[error("history holds {retained} replayable snapshots, expected {expected}")]
    HistoryLengthMismatch { retained: usize, expected: usize },

    /// Online mode needs a fixed number of steps to compute virtual step indices.
    #[error("online mode requires a fixed integer horizon")]
    OnlineRequiresFixedHorizon,

    /// `apply_gradients` was called before any outer objective was registered.
    #[error("no outer objective registered; call compute_gradients first")]
    NoObjectives,

    /// An operation needs state that has not been produced yet.
    #[error("not initialized: {context}")]
    NotInitialized { context: String },

    /// Invalid input.
    #[error("invalid input in {context}")]
    InvalidInput { context: String },

    /// Error from an underlying numr operation.
    #[error("numr error: {0}")]
    Numr(String),
}

impl From<numr::error::Error> for BilevelError {
    fn from(err: numr::error::Error) -> Self {
        Self::Numr(err.to_string())
    }
}
