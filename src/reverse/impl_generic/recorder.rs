//! Recording of partial hypergradients during the backward pass.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::helpers::tensor_to_f64;
use crate::error::{BilevelError, BilevelResult};
use crate::hyper::HyperId;
use crate::reverse::traits::{StepCallback, StepInfo};

/// Backward callback that appends the current hypergradients after every
/// backward step.
///
/// Each record holds one vector per recorded hyperparameter, or a single
/// concatenated vector when flattening.
#[derive(Debug, Clone, Default)]
pub struct HypergradRecorder {
    hyper: Option<HyperId>,
    flatten: bool,
    records: Vec<Vec<Vec<f64>>>,
}

impl HypergradRecorder {
    /// Record `hyper` only, or every hyperparameter when `None`.
    pub fn new(hyper: Option<HyperId>, flatten: bool) -> Self {
        Self {
            hyper,
            flatten,
            records: Vec::new(),
        }
    }

    /// Append the values of `gradients` as one record. F32 values are
    /// widened to f64.
    pub fn record<R: Runtime>(&mut self, gradients: &[(HyperId, Tensor<R>)]) -> BilevelResult<()> {
        let mut values: Vec<Vec<f64>> = match self.hyper {
            Some(id) => {
                let (_, g) = gradients
                    .iter()
                    .find(|(h, _)| *h == id)
                    .ok_or(BilevelError::UnknownHyperparameter { id })?;
                vec![tensor_to_f64(g)?]
            }
            None => gradients
                .iter()
                .map(|(_, g)| tensor_to_f64(g))
                .collect::<BilevelResult<_>>()?,
        };
        if self.flatten {
            values = vec![values.concat()];
        }
        self.records.push(values);
        Ok(())
    }

    /// All records, in backward-step order.
    pub fn records(&self) -> &[Vec<Vec<f64>>] {
        &self.records
    }

    /// Record `index` as a single concatenated vector.
    pub fn flat(&self, index: usize) -> Option<Vec<f64>> {
        self.records.get(index).map(|r| r.concat())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl<R: Runtime, C> StepCallback<R, C> for HypergradRecorder {
    fn on_step(&mut self, info: &StepInfo<'_, R, C>) -> BilevelResult<()> {
        match info.hypergradients {
            Some(gradients) => self.record(gradients),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    fn gradients() -> Vec<(HyperId, Tensor<CpuRuntime>)> {
        let device = CpuDevice::new();
        let mut registry = crate::hyper::HyperparameterRegistry::<CpuRuntime>::new();
        let a = registry
            .declare("a", Tensor::from_slice(&[0.0f64], &[1], &device))
            .unwrap();
        let b = registry
            .declare("b", Tensor::from_slice(&[0.0f64, 0.0], &[2], &device))
            .unwrap();
        vec![
            (a, Tensor::from_slice(&[1.0f64], &[1], &device)),
            (b, Tensor::from_slice(&[2.0f64, 3.0], &[2], &device)),
        ]
    }

    #[test]
    fn test_record_f32_gradients() {
        let device = CpuDevice::new();
        let mut registry = crate::hyper::HyperparameterRegistry::<CpuRuntime>::new();
        let a = registry
            .declare("a", Tensor::from_slice(&[0.0f32, 0.0], &[2], &device))
            .unwrap();
        let g = vec![(a, Tensor::<CpuRuntime>::from_slice(&[1.5f32, -0.25], &[2], &device))];

        let mut recorder = HypergradRecorder::new(None, true);
        recorder.record(&g).unwrap();
        assert_eq!(recorder.records()[0], vec![vec![1.5, -0.25]]);
    }

    #[test]
    fn test_record_all_flattened() {
        let g = gradients();
        let mut recorder = HypergradRecorder::new(None, true);
        recorder.record(&g).unwrap();
        recorder.record(&g).unwrap();

        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.records()[0], vec![vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_record_one_unflattened() {
        let g = gradients();
        let b = g[1].0;
        let mut recorder = HypergradRecorder::new(Some(b), false);
        recorder.record(&g).unwrap();

        assert_eq!(recorder.records()[0], vec![vec![2.0, 3.0]]);
        assert_eq!(recorder.flat(0), Some(vec![2.0, 3.0]));
        assert_eq!(recorder.flat(1), None);
    }

    #[test]
    fn test_record_all_unflattened() {
        let g = gradients();
        let mut recorder = HypergradRecorder::new(None, false);
        recorder.record(&g).unwrap();
        assert_eq!(recorder.records()[0], vec![vec![1.0], vec![2.0, 3.0]]);

        recorder.clear();
        assert!(recorder.is_empty());
    }
}
