//! Generic implementations for reverse-mode hypergradients.

pub mod builder;
pub mod drivers;
pub mod helpers;
pub mod history;
pub mod hypergradient;
pub mod lagrangian;
pub mod optimizer;
pub mod recorder;

pub use history::HistoryBuffer;
pub use hypergradient::reverse_hypergradient_impl;
pub use lagrangian::{MultiplierSet, OuterGradient};
pub use optimizer::ReverseHypergradient;
pub use recorder::HypergradRecorder;
