//! CPU implementations of reverse hypergradient traits.

mod reverse;
