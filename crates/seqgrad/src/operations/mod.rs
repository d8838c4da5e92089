//! Device kernels.
//!
//! Every function here takes tensors, allocates its output from the input's
//! device pool and computes under that pool's lock. None of them record
//! anything; the differentiable versions live in [`crate::ops`].
//!
//! ```text
//! ComputeGraph::matmul (ops)  ->  operations::matmul  ->  faer GEMM
//! ```

mod elementwise;
mod indexing;
mod matmul;
mod norm;
mod reduce;
mod softmax;

pub use elementwise::{
    accumulate, add, affine, apply, apply_binary, copy_into, masked_fill, mul, scale, sub,
};
pub use indexing::{index_add_rows, index_select_rows};
pub use matmul::matmul;
pub use norm::{NormStats, normalize_rows, normalize_rows_backward};
pub use reduce::{concat, sum_all, sum_to_shape};
pub use softmax::{softmax, softmax_backward};

use crate::device::ensure_same_device;
use crate::error::EngineError;
use crate::tensor::Tensor;

pub(crate) fn ensure_same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<(), EngineError> {
    ensure_same_device(a.device(), b.device())?;
    if a.shape() != b.shape() {
        return Err(EngineError::shape(op, a.shape(), b.shape()));
    }
    Ok(())
}

/// Split a tensor into `(rows, cols)` over its last dimension.
pub(crate) fn rows_and_cols(op: &'static str, t: &Tensor) -> Result<(usize, usize), EngineError> {
    let Some(&cols) = t.shape().last() else {
        return Err(EngineError::InvalidOperation(format!(
            "{op} needs at least one dimension"
        )));
    };
    let rows = if cols == 0 { 0 } else { t.len() / cols };
    Ok((rows, cols))
}
