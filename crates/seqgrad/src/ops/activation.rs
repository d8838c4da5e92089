//! Softmax, point-wise activations and dropout.

use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations;
use crate::random::dropout_mask;
use crate::tensor::Tensor;

#[derive(Debug)]
struct SoftmaxBackward {
    input: NodeRef,
    probs: Tensor,
}

impl BackwardOp for SoftmaxBackward {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let grad = operations::softmax_backward(&self.probs, grad_output)?;
        Ok(vec![(self.input, grad)])
    }
}

/// Point-wise rule `dx = rule(saved, g)`, where `saved` is the forward
/// input or output.
#[derive(Debug)]
struct PointwiseBackward {
    op: &'static str,
    input: NodeRef,
    saved: Tensor,
    rule: fn(f32, f32) -> f32,
}

impl BackwardOp for PointwiseBackward {
    fn name(&self) -> &'static str {
        self.op
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let grad = operations::apply_binary(self.op, &self.saved, grad_output, self.rule)?;
        Ok(vec![(self.input, grad)])
    }
}

#[derive(Debug)]
struct DropoutBackward {
    input: NodeRef,
    mask: Tensor,
}

impl BackwardOp for DropoutBackward {
    fn name(&self) -> &'static str {
        "dropout"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        Ok(vec![(self.input, operations::mul(grad_output, &self.mask)?)])
    }
}

impl ComputeGraph {
    /// Softmax over the last dimension.
    pub fn softmax(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let probs = operations::softmax(&self.value(x)?)?;
        let saved = probs.clone();
        self.push_op("softmax", probs, &[x], || SoftmaxBackward {
            input: x,
            probs: saved,
        })
    }

    pub fn relu(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let input = self.value(x)?;
        let out = operations::apply(&input, |v| v.max(0.0))?;
        self.push_op("relu", out, &[x], || PointwiseBackward {
            op: "relu",
            input: x,
            saved: input,
            rule: |v, g| if v > 0.0 { g } else { 0.0 },
        })
    }

    pub fn sigmoid(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let out = operations::apply(&self.value(x)?, |v| 1.0 / (1.0 + (-v).exp()))?;
        let saved = out.clone();
        self.push_op("sigmoid", out, &[x], || PointwiseBackward {
            op: "sigmoid",
            input: x,
            saved,
            rule: |y, g| g * y * (1.0 - y),
        })
    }

    pub fn tanh(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let out = operations::apply(&self.value(x)?, f32::tanh)?;
        let saved = out.clone();
        self.push_op("tanh", out, &[x], || PointwiseBackward {
            op: "tanh",
            input: x,
            saved,
            rule: |y, g| g * (1.0 - y * y),
        })
    }

    /// Inverted dropout: zero each element with probability `ratio` and
    /// scale survivors by `1 / (1 - ratio)`.
    ///
    /// Outside a recording graph, or with `ratio == 0`, returns `x` itself.
    pub fn dropout(&mut self, x: NodeRef, ratio: f32) -> Result<NodeRef, EngineError> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(EngineError::InvalidOperation(format!(
                "dropout ratio must be in [0, 1), got {ratio}"
            )));
        }
        let input = self.value(x)?;
        if !self.is_training() || ratio == 0.0 {
            return Ok(x);
        }
        let data = dropout_mask(input.len(), ratio, self.rng_mut());
        let mask = input.new_from_vec(data, input.shape())?;
        let out = operations::mul(&input, &mask)?;
        self.push_op("dropout", out, &[x], || DropoutBackward { input: x, mask })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::super::testing::check_gradient;
    use crate::config::GraphOptions;
    use crate::device::DeviceContext;
    use crate::graph::ComputeGraph;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut g = ComputeGraph::new(&DeviceContext::cpu(), false);
        let x = g
            .weight_from_vec("x", &[1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], &[2, 3], false)
            .unwrap();
        let p = g.softmax(x).unwrap();
        let values = g.value(p).unwrap().to_vec().unwrap();
        assert_relative_eq!(values[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(values[4], 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_activation_gradients() {
        let data = [0.3, -1.2, 2.0, 0.7, -0.4, 1.1];
        let weights = [1.0, -2.0, 0.5, 3.0, -1.0, 0.25];
        check_gradient(
            |g, x| {
                let p = g.softmax(x)?;
                let w = g.weight_from_vec("w", &weights, &[2, 3], false)?;
                g.mul(p, w)
            },
            &data,
            &[2, 3],
            1e-2,
        );
        check_gradient(|g, x| g.relu(x), &data, &[6], 1e-2);
        check_gradient(|g, x| g.sigmoid(x), &data, &[6], 1e-2);
        check_gradient(|g, x| g.tanh(x), &data, &[6], 1e-2);
    }

    #[test]
    fn test_dropout_training_and_inference() {
        let ctx = DeviceContext::cpu();
        let mut infer = ComputeGraph::new(&ctx, false);
        let x = infer.new_weight("x", &[100], 1.0, false).unwrap();
        assert_eq!(infer.dropout(x, 0.5).unwrap(), x);
        assert!(infer.dropout(x, 1.0).is_err());

        let options = GraphOptions {
            seed: Some(7),
            ..GraphOptions::default()
        };
        let mut g = ComputeGraph::with_options(&ctx, options);
        let x = g.new_weight("x", &[100], 1.0, true).unwrap();
        let y = g.dropout(x, 0.5).unwrap();
        let kept = g.value(y).unwrap().to_vec().unwrap();
        assert!(kept.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(kept.iter().any(|&v| v == 0.0));

        g.sum(y).unwrap();
        g.backward().unwrap();
        let grad = g.gradient(x).unwrap().unwrap().to_vec().unwrap();
        assert_eq!(grad, kept);
    }
}
