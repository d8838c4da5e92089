//! Row gather and scatter.

use crate::error::EngineError;
use crate::tensor::Tensor;

fn row_geometry(op: &'static str, shape: &[usize]) -> Result<(usize, usize), EngineError> {
    let Some(&rows) = shape.first() else {
        return Err(EngineError::InvalidOperation(format!(
            "{op} needs at least one dimension"
        )));
    };
    Ok((rows, shape[1..].iter().product()))
}

fn check_indices(indices: &[usize], rows: usize) -> Result<(), EngineError> {
    match indices.iter().find(|&&i| i >= rows) {
        Some(&index) => Err(EngineError::IndexOutOfBounds {
            index,
            dim_size: rows,
        }),
        None => Ok(()),
    }
}

/// Gather rows of `table` (first dimension) in the order of `indices`.
///
/// An arbitrary index list has no stride representation, so the rows are
/// copied into a fresh `[indices.len(), ...]` tensor.
pub fn index_select_rows(table: &Tensor, indices: &[usize]) -> Result<Tensor, EngineError> {
    let (rows, width) = row_geometry("index_select", table.shape())?;
    check_indices(indices, rows)?;

    let table = table.contiguous()?;
    let mut shape = table.shape().to_vec();
    shape[0] = indices.len();
    let out = table.new_zeros(&shape)?;
    let offset = table.offset();
    out.kernel(&[&table], |inputs, dst| {
        for (&row, d) in indices.iter().zip(dst.chunks_exact_mut(width.max(1))) {
            let start = offset + row * width;
            d[..width].copy_from_slice(&inputs[0][start..start + width]);
        }
    })?;
    Ok(out)
}

/// Scatter-add the rows of `grad` into a zero tensor of `shape`.
///
/// Row `i` of `grad` is added to row `indices[i]`; repeated indices accumulate.
pub fn index_add_rows(
    grad: &Tensor,
    indices: &[usize],
    shape: &[usize],
) -> Result<Tensor, EngineError> {
    let (rows, width) = row_geometry("index_add", shape)?;
    check_indices(indices, rows)?;
    let (grad_rows, grad_width) = row_geometry("index_add", grad.shape())?;
    if grad_rows != indices.len() || grad_width != width {
        let mut expected = shape.to_vec();
        expected[0] = indices.len();
        return Err(EngineError::shape("index_add", &expected, grad.shape()));
    }

    let grad = grad.contiguous()?;
    let out = grad.new_zeros(shape)?;
    let (offset, dtype) = (grad.offset(), out.dtype());
    out.kernel(&[&grad], |inputs, dst| {
        for (i, &row) in indices.iter().enumerate() {
            let src = &inputs[0][offset + i * width..][..width];
            for (d, &s) in dst[row * width..][..width].iter_mut().zip(src) {
                *d = dtype.quantize(*d + s);
            }
        }
    })?;
    Ok(out)
}
