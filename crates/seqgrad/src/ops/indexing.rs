//! Row gather and masking.

use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations;
use crate::tensor::Tensor;

#[derive(Debug)]
struct IndexSelectBackward {
    table: NodeRef,
    indices: Vec<usize>,
    shape: Vec<usize>,
}

impl BackwardOp for IndexSelectBackward {
    fn name(&self) -> &'static str {
        "index_select"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.table]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let grad = operations::index_add_rows(grad_output, &self.indices, &self.shape)?;
        Ok(vec![(self.table, grad)])
    }
}

#[derive(Debug)]
struct MaskedFillBackward {
    input: NodeRef,
    mask: Tensor,
}

impl BackwardOp for MaskedFillBackward {
    fn name(&self) -> &'static str {
        "masked_fill"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let grad = operations::masked_fill(grad_output, &self.mask, 0.0)?;
        Ok(vec![(self.input, grad)])
    }
}

impl ComputeGraph {
    /// Gather rows of `table` along its first dimension.
    ///
    /// Repeated indices are allowed; their gradients accumulate.
    pub fn index_select(&mut self, table: NodeRef, indices: &[usize]) -> Result<NodeRef, EngineError> {
        let value = self.value(table)?;
        let shape = value.shape().to_vec();
        let out = operations::index_select_rows(&value, indices)?;
        self.push_op("index_select", out, &[table], || IndexSelectBackward {
            table,
            indices: indices.to_vec(),
            shape,
        })
    }

    /// Replace elements of `x` where `mask` is non-zero with `value`.
    ///
    /// The mask is a constant: no gradient flows into it.
    pub fn masked_fill(&mut self, x: NodeRef, mask: NodeRef, value: f32) -> Result<NodeRef, EngineError> {
        let input = self.value(x)?;
        let mask = self.value(mask)?;
        let out = operations::masked_fill(&input, &mask, value)?;
        self.push_op("masked_fill", out, &[x], || MaskedFillBackward { input: x, mask })
    }
}

#[cfg(test)]
mod tests {
    use crate::device::DeviceContext;
    use crate::error::EngineError;
    use crate::graph::ComputeGraph;

    #[test]
    fn test_index_select_scatters_gradient() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), true);
        let table = g
            .weight_from_vec("table", &[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], &[3, 2], true)
            .unwrap();
        let rows = g.index_select(table, &[2, 0, 2]).unwrap();
        assert_eq!(
            g.value(rows).unwrap().to_vec().unwrap(),
            vec![20.0, 21.0, 0.0, 1.0, 20.0, 21.0]
        );
        g.sum(rows).unwrap();
        g.backward().unwrap();
        assert_eq!(
            g.gradient(table).unwrap().unwrap().to_vec().unwrap(),
            vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]
        );
        assert!(matches!(
            g.index_select(table, &[3]),
            Err(EngineError::IndexOutOfBounds { index: 3, dim_size: 3 })
        ));
    }

    #[test]
    fn test_masked_fill_blocks_gradient() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), true);
        let x = g.weight_from_vec("x", &[1.0, 2.0, 3.0, 4.0], &[2, 2], true).unwrap();
        let mask = g.weight_from_vec("mask", &[0.0, 1.0, 1.0, 0.0], &[2, 2], false).unwrap();
        let y = g.masked_fill(x, mask, f32::NEG_INFINITY).unwrap();
        let p = g.softmax(y).unwrap();
        assert_eq!(
            g.value(p).unwrap().to_vec().unwrap(),
            vec![1.0, 0.0, 0.0, 1.0]
        );
        let z = g.masked_fill(x, mask, 0.0).unwrap();
        g.sum(z).unwrap();
        g.backward().unwrap();
        assert_eq!(
            g.gradient(x).unwrap().unwrap().to_vec().unwrap(),
            vec![1.0, 0.0, 0.0, 1.0]
        );
        assert!(g.gradient(mask).unwrap().is_none());
    }
}
