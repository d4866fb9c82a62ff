//! Tensor construction and extraction helpers shared by the drivers.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{BilevelError, BilevelResult};
use crate::reverse::traits::StepCounter;

/// Create a tensor of `dtype` from f64 values.
pub fn tensor_from_f64<R: Runtime>(
    values: &[f64],
    shape: &[usize],
    dtype: DType,
    device: &R::Device,
) -> BilevelResult<Tensor<R>> {
    match dtype {
        DType::F32 => {
            let values_f32: Vec<f32> = values.iter().map(|&v| v as f32).collect();
            Ok(Tensor::<R>::from_slice(&values_f32, shape, device))
        }
        DType::F64 => Ok(Tensor::<R>::from_slice(values, shape, device)),
        _ => Err(BilevelError::InvalidInput {
            context: format!("unsupported dtype {:?}; expected F32 or F64", dtype),
        }),
    }
}

/// Read a floating-point tensor as f64 values.
pub fn tensor_to_f64<R: Runtime>(tensor: &Tensor<R>) -> BilevelResult<Vec<f64>> {
    match tensor.dtype() {
        DType::F32 => Ok(tensor
            .to_vec::<f32>()
            .into_iter()
            .map(f64::from)
            .collect()),
        DType::F64 => Ok(tensor.to_vec::<f64>()),
        dtype => Err(BilevelError::InvalidInput {
            context: format!("unsupported dtype {:?}; expected F32 or F64", dtype),
        }),
    }
}

/// Counter bound on inner step `t` under the aggregated inner method.
///
/// `Scalar` gives `[t + 1]`; `OneHot { len }` gives a `(len, 1)` column with
/// a one in row `t`.
pub fn step_counter<R: Runtime>(
    counter: StepCounter,
    t: usize,
    dtype: DType,
    device: &R::Device,
) -> BilevelResult<Tensor<R>> {
    match counter {
        StepCounter::Scalar => tensor_from_f64(&[(t + 1) as f64], &[1], dtype, device),
        StepCounter::OneHot { len } => {
            if t >= len {
                return Err(BilevelError::InvalidInput {
                    context: format!("step {} outside one-hot step counter of length {}", t, len),
                });
            }
            let mut column = vec![0.0; len];
            column[t] = 1.0;
            tensor_from_f64(&column, &[len, 1], dtype, device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};

    #[test]
    fn test_scalar_counter() {
        let device = CpuDevice::new();
        let c = step_counter::<CpuRuntime>(StepCounter::Scalar, 4, DType::F32, &device).unwrap();
        assert_eq!(c.dtype(), DType::F32);
        assert_eq!(c.shape(), &[1]);
        assert_eq!(tensor_to_f64(&c).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_one_hot_counter() {
        let device = CpuDevice::new();
        let c = step_counter::<CpuRuntime>(StepCounter::OneHot { len: 3 }, 1, DType::F64, &device)
            .unwrap();
        assert_eq!(c.shape(), &[3, 1]);
        assert_eq!(c.to_vec::<f64>(), vec![0.0, 1.0, 0.0]);

        let err = step_counter::<CpuRuntime>(StepCounter::OneHot { len: 3 }, 3, DType::F64, &device)
            .unwrap_err();
        assert!(matches!(err, BilevelError::InvalidInput { .. }));
    }

    #[test]
    fn test_f32_round_trip() {
        let device = CpuDevice::new();
        let t = tensor_from_f64::<CpuRuntime>(&[0.5, -2.0], &[2], DType::F32, &device).unwrap();
        assert_eq!(t.to_vec::<f32>(), vec![0.5f32, -2.0]);
        assert_eq!(tensor_to_f64(&t).unwrap(), vec![0.5, -2.0]);
    }
}
