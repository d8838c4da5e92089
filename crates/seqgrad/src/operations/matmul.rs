//! Matrix multiplication via faer GEMM.
//!
//! Operands are packed row-major, so each matrix is viewed with
//! `MatRef::from_row_major_slice` and transposed lazily by faer.

use faer::linalg::matmul::matmul as gemm;
use faer::{Accum, MatMut, MatRef, Par};

use crate::device::ensure_same_device;
use crate::error::EngineError;
use crate::tensor::Tensor;

/// `op(a) @ op(b)` for 2-D operands or batches of them (3-D).
///
/// `transpose_a` / `transpose_b` use the transpose of the last two
/// dimensions of the operand.
///
/// # Example
///
/// ```
/// use seqgrad::{DeviceContext, Tensor};
/// use seqgrad::operations::matmul;
///
/// let ctx = DeviceContext::cpu();
/// let a = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// let b = Tensor::from_vec(&ctx, vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
/// let c = matmul(&a, &b, false, false).unwrap();
/// assert_eq!(c.to_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
/// ```
pub fn matmul(
    a: &Tensor,
    b: &Tensor,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Tensor, EngineError> {
    ensure_same_device(a.device(), b.device())?;
    let ndim = a.ndim();
    if ndim != 2 && ndim != 3 {
        return Err(EngineError::RankMismatch {
            expected: 2,
            actual: ndim,
        });
    }
    if b.ndim() != ndim {
        return Err(EngineError::RankMismatch {
            expected: ndim,
            actual: b.ndim(),
        });
    }

    let batch = if ndim == 3 { a.shape()[0] } else { 1 };
    if ndim == 3 && b.shape()[0] != batch {
        return Err(EngineError::shape("matmul", a.shape(), b.shape()));
    }

    let (a_rows, a_cols) = (a.shape()[ndim - 2], a.shape()[ndim - 1]);
    let (b_rows, b_cols) = (b.shape()[ndim - 2], b.shape()[ndim - 1]);
    let (m, k) = if transpose_a { (a_cols, a_rows) } else { (a_rows, a_cols) };
    let (k2, n) = if transpose_b { (b_cols, b_rows) } else { (b_rows, b_cols) };
    if k != k2 {
        return Err(EngineError::shape("matmul", a.shape(), b.shape()));
    }

    let a = a.contiguous()?;
    let b = b.contiguous()?;
    let out_shape: Vec<usize> = if ndim == 3 {
        vec![batch, m, n]
    } else {
        vec![m, n]
    };
    let out = a.new_zeros(&out_shape)?;
    if m == 0 || n == 0 {
        return Ok(out);
    }

    let (a_off, b_off) = (a.offset(), b.offset());
    let (a_size, b_size, c_size) = (a_rows * a_cols, b_rows * b_cols, m * n);
    let dtype = out.dtype();

    out.kernel(&[&a, &b], |inputs, dst| {
        for i in 0..batch {
            let a_block = &inputs[0][a_off + i * a_size..][..a_size];
            let b_block = &inputs[1][b_off + i * b_size..][..b_size];
            let lhs = MatRef::from_row_major_slice(a_block, a_rows, a_cols);
            let rhs = MatRef::from_row_major_slice(b_block, b_rows, b_cols);
            let lhs = if transpose_a { lhs.transpose() } else { lhs };
            let rhs = if transpose_b { rhs.transpose() } else { rhs };

            let mut c_mat =
                MatMut::from_row_major_slice_mut(&mut dst[i * c_size..][..c_size], m, n);

            // C = 1 * op(A) * op(B), replacing C
            gemm(c_mat.as_mut(), Accum::Replace, lhs, rhs, 1.0f32, Par::Seq);
        }
        dtype.quantize_slice(dst);
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use approx::assert_relative_eq;

    fn naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for p in 0..k {
                    c[i * n + j] += a[i * k + p] * b[p * n + j];
                }
            }
        }
        c
    }

    #[test]
    fn test_matmul_rectangular() {
        let ctx = DeviceContext::cpu();
        let a_data: Vec<f32> = (1..=6).map(|x| x as f32).collect();
        let b_data: Vec<f32> = (1..=12).map(|x| x as f32).collect();
        let a = Tensor::from_vec(&ctx, a_data.clone(), &[2, 3]).unwrap();
        let b = Tensor::from_vec(&ctx, b_data.clone(), &[3, 4]).unwrap();
        let c = matmul(&a, &b, false, false).unwrap();
        assert_eq!(c.shape(), &[2, 4]);
        for (x, y) in c.to_vec().unwrap().iter().zip(naive(&a_data, &b_data, 2, 3, 4)) {
            assert_relative_eq!(*x, y);
        }
    }

    #[test]
    fn test_matmul_transposed_operands() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]).unwrap();
        let b = Tensor::from_vec(&ctx, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]).unwrap();
        // a^T (2x3) @ b (3x2)
        let c = matmul(&a, &b, true, false).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![6.0, 8.0, 8.0, 10.0]);
        // a (3x2) @ b^T (2x3)
        let d = matmul(&a, &b, false, true).unwrap();
        assert_eq!(d.shape(), &[3, 3]);
        assert_eq!(d.get(&[2, 2]).unwrap(), 11.0);
        // Same result from an explicitly transposed view.
        let e = matmul(&a.transpose(0, 1).unwrap(), &b, false, false).unwrap();
        assert_eq!(e.to_vec().unwrap(), c.to_vec().unwrap());
    }

    #[test]
    fn test_matmul_batched() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::from_vec(&ctx, vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0], &[2, 2, 2])
            .unwrap();
        let b = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0], &[2, 2, 2])
            .unwrap();
        let c = matmul(&a, &b, false, false).unwrap();
        assert_eq!(
            c.to_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let ctx = DeviceContext::cpu();
        let a = Tensor::zeros(&ctx, &[2, 3]).unwrap();
        let b = Tensor::zeros(&ctx, &[2, 3]).unwrap();
        assert!(matches!(
            matmul(&a, &b, false, false),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }
}
