//! Row normalization (layer norm and RMS norm).
//!
//! Both share one kernel: layer norm subtracts the row mean before scaling
//! by the reciprocal standard deviation, RMS norm scales the raw row.
//!
//! ```text
//! xhat = (x - mean) * rstd          mean = 0 for RMS norm
//! y    = xhat * gamma + beta
//! ```

use super::rows_and_cols;
use crate::error::EngineError;
use crate::tensor::Tensor;

/// Per-row statistics saved by the forward pass.
#[derive(Debug, Clone)]
pub struct NormStats {
    pub mean: Vec<f32>,
    pub rstd: Vec<f32>,
    pub centered: bool,
}

fn check_affine(x_cols: usize, gamma: &Tensor, beta: &Tensor) -> Result<(), EngineError> {
    for p in [gamma, beta] {
        if p.len() != x_cols {
            return Err(EngineError::shape("normalize", &[x_cols], p.shape()));
        }
    }
    Ok(())
}

/// Normalize every row of `x` over its last dimension.
pub fn normalize_rows(
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    eps: f32,
    centered: bool,
) -> Result<(Tensor, NormStats), EngineError> {
    let (rows, cols) = rows_and_cols("normalize", x)?;
    check_affine(cols, gamma, beta)?;
    let x = x.contiguous()?;
    let gamma = gamma.contiguous()?;
    let beta = beta.contiguous()?;
    let out = x.new_zeros(x.shape())?;
    let (xo, go, bo, dtype) = (x.offset(), gamma.offset(), beta.offset(), out.dtype());

    let stats = out.kernel(&[&x, &gamma, &beta], |inputs, dst| {
        let mut stats = NormStats {
            mean: Vec::with_capacity(rows),
            rstd: Vec::with_capacity(rows),
            centered,
        };
        let g = &inputs[1][go..go + cols];
        let b = &inputs[2][bo..bo + cols];
        for r in 0..rows {
            let row = &inputs[0][xo + r * cols..][..cols];
            let mean = if centered {
                row.iter().sum::<f32>() / cols as f32
            } else {
                0.0
            };
            let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
            let rstd = 1.0 / (var + eps).sqrt();
            for (j, d) in dst[r * cols..][..cols].iter_mut().enumerate() {
                *d = dtype.quantize((row[j] - mean) * rstd * g[j] + b[j]);
            }
            stats.mean.push(mean);
            stats.rstd.push(rstd);
        }
        stats
    })?;
    Ok((out, stats))
}

/// Gradients `(dx, dgamma, dbeta)` of [`normalize_rows`].
pub fn normalize_rows_backward(
    x: &Tensor,
    gamma: &Tensor,
    stats: &NormStats,
    grad: &Tensor,
) -> Result<(Tensor, Tensor, Tensor), EngineError> {
    let (rows, cols) = rows_and_cols("normalize_backward", x)?;
    if grad.shape() != x.shape() {
        return Err(EngineError::shape("normalize_backward", x.shape(), grad.shape()));
    }
    if stats.mean.len() != rows {
        return Err(EngineError::shape("normalize_backward", &[rows], &[stats.mean.len()]));
    }
    let x = x.contiguous()?;
    let gamma = gamma.contiguous()?;
    let grad = grad.contiguous()?;
    let dx = x.new_zeros(x.shape())?;
    let (xo, go, dyo, dtype) = (x.offset(), gamma.offset(), grad.offset(), dx.dtype());

    let (dgamma, dbeta) = dx.kernel(&[&x, &gamma, &grad], |inputs, dst| {
        let g = &inputs[1][go..go + cols];
        let mut dgamma = vec![0.0f32; cols];
        let mut dbeta = vec![0.0f32; cols];
        let mut xhat = vec![0.0f32; cols];
        let mut dxhat = vec![0.0f32; cols];
        for r in 0..rows {
            let row = &inputs[0][xo + r * cols..][..cols];
            let dy = &inputs[2][dyo + r * cols..][..cols];
            let (mean, rstd) = (stats.mean[r], stats.rstd[r]);
            for j in 0..cols {
                xhat[j] = (row[j] - mean) * rstd;
                dxhat[j] = dy[j] * g[j];
                dgamma[j] += dy[j] * xhat[j];
                dbeta[j] += dy[j];
            }
            let mean_dxhat = if stats.centered {
                dxhat.iter().sum::<f32>() / cols as f32
            } else {
                0.0
            };
            let mean_dxhat_xhat =
                dxhat.iter().zip(&xhat).map(|(&a, &b)| a * b).sum::<f32>() / cols as f32;
            for (j, d) in dst[r * cols..][..cols].iter_mut().enumerate() {
                *d = dtype.quantize(rstd * (dxhat[j] - mean_dxhat - xhat[j] * mean_dxhat_xhat));
            }
        }
        (dgamma, dbeta)
    })?;

    let dgamma = gamma.new_from_vec(dgamma, gamma.shape())?;
    let dbeta = gamma.new_from_vec(dbeta, gamma.shape())?;
    Ok((dx, dgamma, dbeta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use approx::assert_relative_eq;

    fn setup() -> (DeviceContext, Tensor, Tensor, Tensor) {
        let ctx = DeviceContext::cpu();
        let x = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.5, 2.0, 0.0], &[2, 4])
            .unwrap();
        let gamma = Tensor::from_vec(&ctx, vec![1.0, 0.5, 2.0, 1.0], &[4]).unwrap();
        let beta = Tensor::from_vec(&ctx, vec![0.0, 0.1, 0.0, -0.1], &[4]).unwrap();
        (ctx, x, gamma, beta)
    }

    #[test]
    fn test_layer_norm_unit_gamma_has_zero_mean() {
        let ctx = DeviceContext::cpu();
        let x = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0], &[1, 4]).unwrap();
        let ones = Tensor::full(&ctx, &[4], 1.0).unwrap();
        let zeros = Tensor::zeros(&ctx, &[4]).unwrap();
        let (y, stats) = normalize_rows(&x, &ones, &zeros, 1e-6, true).unwrap();
        let y = y.to_vec().unwrap();
        assert_relative_eq!(y.iter().sum::<f32>(), 0.0, epsilon = 1e-5);
        let var = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_relative_eq!(var, 1.0, epsilon = 1e-4);
        assert_relative_eq!(stats.mean[0], 2.5);
    }

    #[test]
    fn test_rms_norm_scales_raw_row() {
        let ctx = DeviceContext::cpu();
        let x = Tensor::from_vec(&ctx, vec![3.0, 4.0], &[1, 2]).unwrap();
        let ones = Tensor::full(&ctx, &[2], 1.0).unwrap();
        let zeros = Tensor::zeros(&ctx, &[2]).unwrap();
        let (y, _) = normalize_rows(&x, &ones, &zeros, 0.0, false).unwrap();
        let rms = (12.5f32).sqrt();
        let y = y.to_vec().unwrap();
        assert_relative_eq!(y[0], 3.0 / rms, epsilon = 1e-6);
        assert_relative_eq!(y[1], 4.0 / rms, epsilon = 1e-6);
    }

    fn weighted_sum(x: &[f32], gamma: &Tensor, beta: &Tensor, ctx: &DeviceContext, centered: bool) -> f32 {
        let xt = Tensor::from_vec(ctx, x.to_vec(), &[2, 4]).unwrap();
        let (y, _) = normalize_rows(&xt, gamma, beta, 1e-5, centered).unwrap();
        y.to_vec()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, v)| v * (i as f32 + 1.0) * 0.1)
            .sum()
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        for centered in [true, false] {
            let (ctx, x, gamma, beta) = setup();
            let (_, stats) = normalize_rows(&x, &gamma, &beta, 1e-5, centered).unwrap();
            let weights: Vec<f32> = (0..8).map(|i| (i as f32 + 1.0) * 0.1).collect();
            let dy = Tensor::from_vec(&ctx, weights, &[2, 4]).unwrap();
            let (dx, dgamma, dbeta) = normalize_rows_backward(&x, &gamma, &stats, &dy).unwrap();

            let x0 = x.to_vec().unwrap();
            let eps = 1e-2;
            for (i, analytic) in dx.to_vec().unwrap().into_iter().enumerate() {
                let mut plus = x0.clone();
                let mut minus = x0.clone();
                plus[i] += eps;
                minus[i] -= eps;
                let numeric = (weighted_sum(&plus, &gamma, &beta, &ctx, centered)
                    - weighted_sum(&minus, &gamma, &beta, &ctx, centered))
                    / (2.0 * eps);
                assert_relative_eq!(analytic, numeric, epsilon = 2e-3);
            }
            assert_eq!(dgamma.shape(), &[4]);
            // dbeta is the column sum of dy.
            let db = dbeta.to_vec().unwrap();
            assert_relative_eq!(db[0], 0.1 + 0.5, epsilon = 1e-6);
            assert_relative_eq!(db[3], 0.4 + 0.8, epsilon = 1e-6);
        }
    }
}
