//! Softmax over the last dimension.

use super::{ensure_same_shape, rows_and_cols};
use crate::error::EngineError;
use crate::tensor::Tensor;

/// Row-wise softmax with max subtraction.
///
/// A row that is entirely `-inf` (fully masked) yields zeros.
pub fn softmax(a: &Tensor) -> Result<Tensor, EngineError> {
    let (_, cols) = rows_and_cols("softmax", a)?;
    let a = a.contiguous()?;
    let out = a.new_zeros(a.shape())?;
    if a.is_empty() {
        return Ok(out);
    }
    let (offset, len, dtype) = (a.offset(), a.len(), out.dtype());
    out.kernel(&[&a], |inputs, dst| {
        let src = &inputs[0][offset..offset + len];
        for (x, y) in src.chunks_exact(cols).zip(dst.chunks_exact_mut(cols)) {
            let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                y.fill(0.0);
                continue;
            }
            let mut sum = 0.0;
            for (yi, &xi) in y.iter_mut().zip(x) {
                *yi = (xi - max).exp();
                sum += *yi;
            }
            for yi in y.iter_mut() {
                *yi = dtype.quantize(*yi / sum);
            }
        }
    })?;
    Ok(out)
}

/// Vector-Jacobian product of softmax: `p * (g - sum(g * p))` per row.
pub fn softmax_backward(probs: &Tensor, grad: &Tensor) -> Result<Tensor, EngineError> {
    ensure_same_shape("softmax_backward", probs, grad)?;
    let (_, cols) = rows_and_cols("softmax_backward", probs)?;
    let probs = probs.contiguous()?;
    let grad = grad.contiguous()?;
    let out = probs.new_zeros(probs.shape())?;
    if probs.is_empty() {
        return Ok(out);
    }
    let (p_off, g_off, len, dtype) = (probs.offset(), grad.offset(), probs.len(), out.dtype());
    out.kernel(&[&probs, &grad], |inputs, dst| {
        let p = &inputs[0][p_off..p_off + len];
        let g = &inputs[1][g_off..g_off + len];
        for ((pr, gr), dr) in p
            .chunks_exact(cols)
            .zip(g.chunks_exact(cols))
            .zip(dst.chunks_exact_mut(cols))
        {
            let dot: f32 = pr.iter().zip(gr).map(|(&pi, &gi)| pi * gi).sum();
            for ((d, &pi), &gi) in dr.iter_mut().zip(pr).zip(gr) {
                *d = dtype.quantize(pi * (gi - dot));
            }
        }
    })?;
    Ok(out)
}
