//! Matrix products and shape operations.

use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations;
use crate::tensor::Tensor;

#[derive(Debug)]
struct MatmulBackward {
    a: NodeRef,
    b: NodeRef,
    a_val: Tensor,
    b_val: Tensor,
}

impl BackwardOp for MatmulBackward {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.a, self.b]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        // dA = G B^T, dB = A^T G
        let da = operations::matmul(grad_output, &self.b_val, false, true)?;
        let db = operations::matmul(&self.a_val, grad_output, true, false)?;
        Ok(vec![(self.a, da), (self.b, db)])
    }
}

#[derive(Debug)]
struct TransposeBackward {
    input: NodeRef,
}

impl BackwardOp for TransposeBackward {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let n = grad_output.ndim();
        Ok(vec![(self.input, grad_output.transpose(n - 2, n - 1)?)])
    }
}

/// Gradient of `view`: the same elements under the input's shape.
#[derive(Debug)]
struct ReshapeBackward {
    input: NodeRef,
    shape: Vec<usize>,
}

impl BackwardOp for ReshapeBackward {
    fn name(&self) -> &'static str {
        "view"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        Ok(vec![(self.input, grad_output.contiguous()?.view(&self.shape)?)])
    }
}

#[derive(Debug)]
struct ExpandBackward {
    input: NodeRef,
    shape: Vec<usize>,
}

impl BackwardOp for ExpandBackward {
    fn name(&self) -> &'static str {
        "expand"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        Ok(vec![(self.input, operations::sum_to_shape(grad_output, &self.shape)?)])
    }
}

#[derive(Debug)]
struct ConcatBackward {
    parts: Vec<(NodeRef, usize)>,
    dim: usize,
}

impl BackwardOp for ConcatBackward {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        self.parts.iter().map(|&(node, _)| node).collect()
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let mut start = 0;
        let mut grads = Vec::with_capacity(self.parts.len());
        for &(node, len) in &self.parts {
            grads.push((node, grad_output.narrow(self.dim, start, len)?));
            start += len;
        }
        Ok(grads)
    }
}

impl ComputeGraph {
    /// Matrix product of two 2-D nodes, or batched over the first of 3 dimensions.
    pub fn matmul(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, EngineError> {
        let (a_val, b_val) = (self.value(a)?, self.value(b)?);
        let out = operations::matmul(&a_val, &b_val, false, false)?;
        self.push_op("matmul", out, &[a, b], || MatmulBackward { a, b, a_val, b_val })
    }

    /// Swap the last two dimensions (zero-copy).
    pub fn transpose(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let value = self.value(x)?;
        let n = value.ndim();
        if n < 2 {
            return Err(EngineError::RankMismatch {
                expected: 2,
                actual: n,
            });
        }
        let out = value.transpose(n - 2, n - 1)?;
        self.push_op("transpose", out, &[x], || TransposeBackward { input: x })
    }

    /// Reinterpret `x` with `shape`. Non-contiguous inputs are packed first.
    pub fn view(&mut self, x: NodeRef, shape: &[usize]) -> Result<NodeRef, EngineError> {
        let value = self.value(x)?;
        let input_shape = value.shape().to_vec();
        let out = if value.is_contiguous() {
            value.view(shape)?
        } else {
            value.contiguous()?.view(shape)?
        };
        self.push_op("view", out, &[x], || ReshapeBackward {
            input: x,
            shape: input_shape,
        })
    }

    /// Broadcast extent-1 dimensions of `x` to `dims` (zero-copy).
    pub fn expand(&mut self, x: NodeRef, dims: &[usize]) -> Result<NodeRef, EngineError> {
        let value = self.value(x)?;
        let shape = value.shape().to_vec();
        let out = value.expand(dims)?;
        self.push_op("expand", out, &[x], || ExpandBackward { input: x, shape })
    }

    /// Concatenate nodes along `dim`.
    pub fn concat(&mut self, inputs: &[NodeRef], dim: usize) -> Result<NodeRef, EngineError> {
        let values = inputs
            .iter()
            .map(|&n| self.value(n))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Tensor> = values.iter().collect();
        let out = operations::concat(&refs, dim)?;
        let parts = inputs
            .iter()
            .zip(&values)
            .map(|(&n, v)| (n, v.shape()[dim]))
            .collect();
        self.push_op("concat", out, inputs, || ConcatBackward { parts, dim })
    }
}
