//! CPU implementation of ReverseHypergradientAlgorithms trait.

use numr::runtime::cpu::{CpuClient, CpuRuntime};

use crate::error::BilevelResult;
use crate::hyper::{HyperId, HyperparameterRegistry};
use crate::reverse::impl_generic::reverse_hypergradient_impl;
use crate::reverse::traits::{
    ApplyOptions, HypergradientResult, InnerDynamics, OuterObjective,
    ReverseHypergradientAlgorithms, ReverseOptions,
};

impl ReverseHypergradientAlgorithms<CpuRuntime> for CpuClient {
    fn reverse_hypergradient<D, O>(
        &self,
        inner: &D,
        objective: O,
        registry: &HyperparameterRegistry<CpuRuntime>,
        hypers: Option<&[HyperId]>,
        options: &ReverseOptions,
        apply: ApplyOptions<'_, CpuRuntime, Self>,
    ) -> BilevelResult<HypergradientResult<CpuRuntime>>
    where
        D: InnerDynamics<CpuRuntime, Self>,
        O: OuterObjective<CpuRuntime, Self>,
    {
        reverse_hypergradient_impl(self, inner, objective, registry, hypers, options, apply)
    }
}
