//! Reductions and concatenation.

use super::elementwise::copy_into;
use crate::device::ensure_same_device;
use crate::error::EngineError;
use crate::strides::{compute_strides, linear_to_cartesian, shape_len};
use crate::tensor::Tensor;

/// Sum of all elements as a `[1]` tensor.
pub fn sum_all(a: &Tensor) -> Result<Tensor, EngineError> {
    let out = a.new_zeros(&[1])?;
    let (layout, dtype) = (a.layout(), out.dtype());
    out.kernel(&[a], |inputs, dst| {
        let total: f32 = layout.offsets().map(|o| inputs[0][o]).sum();
        dst[0] = dtype.quantize(total);
    })?;
    Ok(out)
}

/// Reduce a broadcast gradient back to `shape`.
///
/// `shape` either has one element (scalar broadcast) or the rank of `grad`
/// with extent 1 on every broadcast dimension.
pub fn sum_to_shape(grad: &Tensor, shape: &[usize]) -> Result<Tensor, EngineError> {
    if grad.shape() == shape {
        return grad.contiguous();
    }
    if shape_len(shape) == 1 {
        return sum_all(grad)?.view(shape);
    }
    if shape.len() != grad.ndim() {
        return Err(EngineError::shape("sum_to_shape", shape, grad.shape()));
    }
    for (&to, &from) in shape.iter().zip(grad.shape()) {
        if to != from && to != 1 {
            return Err(EngineError::shape("sum_to_shape", shape, grad.shape()));
        }
    }

    let out = grad.new_zeros(shape)?;
    let out_strides = compute_strides(shape);
    let (layout, dtype) = (grad.layout(), out.dtype());
    let grad_shape = grad.shape();
    out.kernel(&[grad], |inputs, dst| {
        for (linear, o) in layout.offsets().enumerate() {
            let idx = linear_to_cartesian(linear, grad_shape);
            let target: usize = idx
                .iter()
                .zip(shape)
                .zip(out_strides.iter())
                .map(|((&i, &dim), &s)| if dim == 1 { 0 } else { i * s })
                .sum();
            dst[target] += inputs[0][o];
        }
        dtype.quantize_slice(dst);
    })?;
    Ok(out)
}

/// Concatenate tensors along `dim`.
///
/// All inputs must share rank, device, and every extent except `dim`.
pub fn concat(tensors: &[&Tensor], dim: usize) -> Result<Tensor, EngineError> {
    let Some(first) = tensors.first() else {
        return Err(EngineError::InvalidOperation(
            "concat of zero tensors".to_string(),
        ));
    };
    if dim >= first.ndim() {
        return Err(EngineError::IndexOutOfBounds {
            index: dim,
            dim_size: first.ndim(),
        });
    }

    let mut shape = first.shape().to_vec();
    shape[dim] = 0;
    for t in tensors {
        ensure_same_device(first.device(), t.device())?;
        let compatible = t.ndim() == first.ndim()
            && t
                .shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(d, (&a, &b))| d == dim || a == b);
        if !compatible {
            return Err(EngineError::shape("concat", first.shape(), t.shape()));
        }
        shape[dim] += t.shape()[dim];
    }

    let out = first.new_zeros(&shape)?;
    let mut start = 0;
    for t in tensors {
        let len = t.shape()[dim];
        copy_into(&out.narrow(dim, start, len)?, t)?;
        start += len;
    }
    Ok(out)
}
