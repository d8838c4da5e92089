//! Element-wise arithmetic.

use super::broadcast_scalar;
use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations;
use crate::tensor::Tensor;

#[derive(Debug)]
struct AddBackward {
    a: NodeRef,
    b: NodeRef,
    a_shape: Vec<usize>,
    b_shape: Vec<usize>,
    negate_b: bool,
}

impl BackwardOp for AddBackward {
    fn name(&self) -> &'static str {
        if self.negate_b { "sub" } else { "add" }
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.a, self.b]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let ga = operations::sum_to_shape(grad_output, &self.a_shape)?;
        let gb = operations::sum_to_shape(grad_output, &self.b_shape)?;
        let gb = if self.negate_b {
            operations::scale(&gb, -1.0)?
        } else {
            gb
        };
        Ok(vec![(self.a, ga), (self.b, gb)])
    }
}

#[derive(Debug)]
struct MulBackward {
    a: NodeRef,
    b: NodeRef,
    a_val: Tensor,
    b_val: Tensor,
    a_shape: Vec<usize>,
    b_shape: Vec<usize>,
}

impl BackwardOp for MulBackward {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.a, self.b]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let ga = operations::mul(grad_output, &self.b_val)?;
        let gb = operations::mul(grad_output, &self.a_val)?;
        Ok(vec![
            (self.a, operations::sum_to_shape(&ga, &self.a_shape)?),
            (self.b, operations::sum_to_shape(&gb, &self.b_shape)?),
        ])
    }
}

/// Gradient `k * g` for the affine scalar operations.
#[derive(Debug)]
struct ScaleBackward {
    op: &'static str,
    input: NodeRef,
    k: f32,
}

impl BackwardOp for ScaleBackward {
    fn name(&self) -> &'static str {
        self.op
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let grad = if self.k == 1.0 {
            grad_output.clone()
        } else {
            operations::scale(grad_output, self.k)?
        };
        Ok(vec![(self.input, grad)])
    }
}

impl ComputeGraph {
    /// `a + b`; either side may be a one-element tensor broadcast over the other.
    pub fn add(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, EngineError> {
        self.add_or_sub("add", a, b, false)
    }

    /// `a - b`, with the same broadcasting as [`add`](Self::add).
    pub fn sub(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, EngineError> {
        self.add_or_sub("sub", a, b, true)
    }

    fn add_or_sub(
        &mut self,
        op: &'static str,
        a: NodeRef,
        b: NodeRef,
        negate_b: bool,
    ) -> Result<NodeRef, EngineError> {
        let (av, bv) = (self.value(a)?, self.value(b)?);
        let (a_shape, b_shape) = (av.shape().to_vec(), bv.shape().to_vec());
        let (av, bv) = broadcast_scalar(op, &av, &bv)?;
        let out = if negate_b {
            operations::sub(&av, &bv)?
        } else {
            operations::add(&av, &bv)?
        };
        self.push_op(op, out, &[a, b], || AddBackward {
            a,
            b,
            a_shape,
            b_shape,
            negate_b,
        })
    }

    /// Element-wise product, broadcasting a one-element side.
    pub fn mul(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, EngineError> {
        let (av, bv) = (self.value(a)?, self.value(b)?);
        let (a_shape, b_shape) = (av.shape().to_vec(), bv.shape().to_vec());
        let (a_val, b_val) = broadcast_scalar("mul", &av, &bv)?;
        let out = operations::mul(&a_val, &b_val)?;
        self.push_op("mul", out, &[a, b], || MulBackward {
            a,
            b,
            a_val,
            b_val,
            a_shape,
            b_shape,
        })
    }

    pub fn add_scalar(&mut self, x: NodeRef, k: f32) -> Result<NodeRef, EngineError> {
        self.affine("add_scalar", x, 1.0, k)
    }

    /// `k - x`.
    pub fn sub_from_scalar(&mut self, k: f32, x: NodeRef) -> Result<NodeRef, EngineError> {
        self.affine("sub_from_scalar", x, -1.0, k)
    }

    pub fn mul_scalar(&mut self, x: NodeRef, k: f32) -> Result<NodeRef, EngineError> {
        self.affine("mul_scalar", x, k, 0.0)
    }

    pub fn neg(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        self.affine("neg", x, -1.0, 0.0)
    }

    fn affine(&mut self, op: &'static str, x: NodeRef, mul: f32, add: f32) -> Result<NodeRef, EngineError> {
        let out = operations::affine(&self.value(x)?, mul, add)?;
        self.push_op(op, out, &[x], || ScaleBackward { op, input: x, k: mul })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::super::testing::check_gradient;
    use crate::device::DeviceContext;
    use crate::error::EngineError;
    use crate::graph::ComputeGraph;

    #[test]
    fn test_add_scalar_broadcast() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), true);
        let x = g.weight_from_vec("x", &[1.0, 2.0, 3.0], &[3], true).unwrap();
        let s = g.weight_from_vec("s", &[10.0], &[1], true).unwrap();
        let y = g.add(x, s).unwrap();
        assert_eq!(g.value(y).unwrap().to_vec().unwrap(), vec![11.0, 12.0, 13.0]);
        let z = g.sub(s, x).unwrap();
        assert_eq!(g.value(z).unwrap().to_vec().unwrap(), vec![9.0, 8.0, 7.0]);

        g.set_gradient_from_slice(y, &[1.0, 1.0, 1.0]).unwrap();
        g.backward().unwrap();
        // The broadcast operand collects the sum of its uses.
        assert_eq!(g.get_gradient_at(s, &[0]).unwrap(), 3.0);
        assert_eq!(g.get_gradient_at(x, &[2]).unwrap(), 1.0);
    }

    #[test]
    fn test_add_rejects_mismatched_shapes() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), true);
        let a = g.new_weight("a", &[2, 3], 1.0, true).unwrap();
        let b = g.new_weight("b", &[3, 2], 1.0, true).unwrap();
        assert!(matches!(g.add(a, b), Err(EngineError::ShapeMismatch { .. })));
        assert_eq!(g.tape_len(), 0);
    }

    #[test]
    fn test_neg_plus_constant_matches_sub_from_scalar() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), true);
        let x = g.weight_from_vec("x", &[0.5, -2.0, 7.25], &[3], true).unwrap();
        let n = g.neg(x).unwrap();
        let a = g.add_scalar(n, 100.0).unwrap();
        let b = g.sub_from_scalar(100.0, x).unwrap();
        for i in 0..3 {
            assert_relative_eq!(
                g.get_weight_at(a, &[i]).unwrap(),
                g.get_weight_at(b, &[i]).unwrap()
            );
        }
    }

    #[test]
    fn test_arithmetic_gradients() {
        let data = [0.3, -1.2, 2.0, 0.7];
        check_gradient(
            |g, x| {
                let c = g.weight_from_vec("c", &[1.5, -0.5, 2.0, 0.25], &[2, 2], false)?;
                let y = g.mul(x, c)?;
                let y = g.sub(y, x)?;
                g.mul_scalar(y, 3.0)
            },
            &data,
            &[2, 2],
            1e-2,
        );
        check_gradient(
            |g, x| {
                let s = g.weight_from_vec("s", &[2.0], &[1], false)?;
                let y = g.mul(s, x)?;
                g.sub_from_scalar(1.0, y)
            },
            &data,
            &[4],
            1e-2,
        );
    }
}
