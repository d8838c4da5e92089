//! Differentiable operations on [`ComputeGraph`](crate::ComputeGraph) nodes.
//!
//! Each operation runs its kernel from [`crate::operations`] eagerly and,
//! when recorded, pushes a backward rule holding the forward tensors it
//! needs.

mod activation;
mod arithmetic;
mod indexing;
mod loss;
mod normalization;
mod shape;

use crate::error::EngineError;
use crate::tensor::Tensor;

/// Broadcast a one-element operand against the other one.
///
/// Returns both operands with a common shape; anything else than equal
/// shapes or a one-element side is a shape mismatch.
fn broadcast_scalar(op: &'static str, a: &Tensor, b: &Tensor) -> Result<(Tensor, Tensor), EngineError> {
    if a.shape() == b.shape() {
        return Ok((a.clone(), b.clone()));
    }
    if b.len() == 1 {
        let ones = vec![1; a.ndim()];
        return Ok((a.clone(), b.view(&ones)?.expand(a.shape())?));
    }
    if a.len() == 1 {
        let ones = vec![1; b.ndim()];
        return Ok((a.view(&ones)?.expand(b.shape())?, b.clone()));
    }
    Err(EngineError::shape(op, a.shape(), b.shape()))
}
