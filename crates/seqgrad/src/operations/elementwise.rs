//! Element-wise kernels.

use super::ensure_same_shape;
use crate::error::EngineError;
use crate::tensor::Tensor;

/// Apply a function to each element, returning a new tensor.
///
/// # Example
///
/// ```
/// use seqgrad::{DeviceContext, Tensor};
/// use seqgrad::operations::apply;
///
/// let ctx = DeviceContext::cpu();
/// let t = Tensor::from_vec(&ctx, vec![1.0, 4.0, 9.0], &[3]).unwrap();
/// let ts = apply(&t, |x| x.sqrt()).unwrap();
/// assert_eq!(ts.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
/// ```
pub fn apply<F>(tensor: &Tensor, f: F) -> Result<Tensor, EngineError>
where
    F: Fn(f32) -> f32,
{
    let out = tensor.new_zeros(tensor.shape())?;
    let (layout, dtype) = (tensor.layout(), out.dtype());
    out.kernel(&[tensor], |inputs, dst| {
        for (d, o) in dst.iter_mut().zip(layout.offsets()) {
            *d = dtype.quantize(f(inputs[0][o]));
        }
    })?;
    Ok(out)
}

/// Combine two tensors of the same shape element-wise.
pub fn apply_binary<F>(
    op: &'static str,
    a: &Tensor,
    b: &Tensor,
    f: F,
) -> Result<Tensor, EngineError>
where
    F: Fn(f32, f32) -> f32,
{
    ensure_same_shape(op, a, b)?;
    let out = a.new_zeros(a.shape())?;
    let (la, lb, dtype) = (a.layout(), b.layout(), out.dtype());
    out.kernel(&[a, b], |inputs, dst| {
        for ((d, ia), ib) in dst.iter_mut().zip(la.offsets()).zip(lb.offsets()) {
            *d = dtype.quantize(f(inputs[0][ia], inputs[1][ib]));
        }
    })?;
    Ok(out)
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    apply_binary("add", a, b, |x, y| x + y)
}

pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    apply_binary("sub", a, b, |x, y| x - y)
}

pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, EngineError> {
    apply_binary("mul", a, b, |x, y| x * y)
}

pub fn scale(a: &Tensor, k: f32) -> Result<Tensor, EngineError> {
    apply(a, |x| x * k)
}

/// `a * mul + add`
pub fn affine(a: &Tensor, mul: f32, add: f32) -> Result<Tensor, EngineError> {
    apply(a, |x| x * mul + add)
}

/// Replace elements where `mask` is non-zero with `value`.
pub fn masked_fill(a: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor, EngineError> {
    apply_binary("masked_fill", a, mask, |x, m| if m != 0.0 { value } else { x })
}

/// Copy `src` into the elements addressed by `dest`.
pub fn copy_into(dest: &Tensor, src: &Tensor) -> Result<(), EngineError> {
    write_through(dest, src, |_, s| s)
}

/// Add `src` into `dest` in place.
pub fn accumulate(dest: &Tensor, src: &Tensor) -> Result<(), EngineError> {
    write_through(dest, src, |d, s| d + s)
}

fn write_through<F>(dest: &Tensor, src: &Tensor, f: F) -> Result<(), EngineError>
where
    F: Fn(f32, f32) -> f32,
{
    ensure_same_shape("accumulate", dest, src)?;
    if dest.layout().is_broadcast() {
        return Err(EngineError::InvalidOperation(
            "cannot write through a broadcast view".to_string(),
        ));
    }
    let (ld, dtype) = (dest.layout(), dest.dtype());
    if dest.shares_buffer_with(src) {
        let values = src.to_vec()?;
        return dest.kernel(&[], |_, dst| {
            for (o, v) in ld.offsets().zip(values) {
                dst[o] = dtype.quantize(f(dst[o], v));
            }
        });
    }
    let ls = src.layout();
    dest.kernel(&[src], |inputs, dst| {
        for (o, s) in ld.offsets().zip(ls.offsets()) {
            dst[o] = dtype.quantize(f(dst[o], inputs[0][s]));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use approx::assert_relative_eq;

    #[test]
    fn test_binary_ops() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let b = Tensor::from_vec(&ctx, vec![4.0, 5.0, 6.0], &[3]).unwrap();
        assert_eq!(add(&a, &b).unwrap().to_vec().unwrap(), vec![5.0, 7.0, 9.0]);
        assert_eq!(sub(&a, &b).unwrap().to_vec().unwrap(), vec![-3.0, -3.0, -3.0]);
        assert_eq!(mul(&a, &b).unwrap().to_vec().unwrap(), vec![4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_binary_shape_mismatch() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::zeros(&ctx, &[2, 3]).unwrap();
        let b = Tensor::zeros(&ctx, &[3, 2]).unwrap();
        assert!(matches!(add(&a, &b), Err(EngineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_binary_on_strided_views() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let at = a.transpose(0, 1).unwrap();
        let c = add(&a, &at).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![2.0, 5.0, 5.0, 8.0]);
    }

    #[test]
    fn test_affine_and_scale() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, -2.0], &[2]).unwrap();
        let y = affine(&a, -1.0, 100.0).unwrap();
        assert_relative_eq!(y.get(&[0]).unwrap(), 99.0);
        assert_relative_eq!(y.get(&[1]).unwrap(), 102.0);
        assert_eq!(scale(&a, 0.5).unwrap().to_vec().unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn test_accumulate_strided_and_self() {
        let ctx = DeviceContext::cpu();
        let dest = Tensor::from_vec(&ctx, vec![1.0, 1.0, 1.0, 1.0], &[2, 2]).unwrap();
        let src = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        accumulate(&dest, &src.transpose(0, 1).unwrap()).unwrap();
        assert_eq!(dest.to_vec().unwrap(), vec![2.0, 4.0, 3.0, 5.0]);

        accumulate(&dest, &dest.clone()).unwrap();
        assert_eq!(dest.to_vec().unwrap(), vec![4.0, 8.0, 6.0, 10.0]);
    }

    #[test]
    fn test_masked_fill() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let mask = Tensor::from_vec(&ctx, vec![0.0, 1.0, 0.0], &[3]).unwrap();
        let y = masked_fill(&a, &mask, -1e9).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, -1e9, 3.0]);
    }
}
