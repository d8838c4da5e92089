//! Fully connected layer.

use rand::Rng;

use super::{NeuralUnit, copy_parameter, new_parameter};
use crate::device::{DeviceContext, DeviceId};
use crate::error::EngineError;
use crate::graph::{ComputeGraph, NodeRef, Parameter};
use crate::random::Init;

/// Activation applied after the affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
}

/// `y = act(x W + b)` with `W: [input, output]` and `b: [1, output]`.
#[derive(Debug)]
pub struct FeedForward {
    name: String,
    weight: Parameter,
    bias: Parameter,
    activation: Option<Activation>,
}

impl FeedForward {
    /// Xavier-initialised weight, zero bias.
    pub fn new<R: Rng>(
        name: &str,
        input_dim: usize,
        output_dim: usize,
        activation: Option<Activation>,
        device: &DeviceContext,
        rng: &mut R,
    ) -> Result<Self, EngineError> {
        let shape = [input_dim, output_dim];
        let weight = new_parameter(device, name, "weight", &shape, &Init::Xavier.sample(&shape, rng)?)?;
        let bias = new_parameter(device, name, "bias", &[1, output_dim], &vec![0.0; output_dim])?;
        Ok(Self {
            name: name.to_string(),
            weight,
            bias,
            activation,
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn activation(&self) -> Option<Activation> {
        self.activation
    }

    /// Apply the layer to a `[rows, input]` node.
    pub fn forward(&self, graph: &mut ComputeGraph, x: NodeRef) -> Result<NodeRef, EngineError> {
        let w = graph.bind(&self.weight)?;
        let b = graph.bind(&self.bias)?;
        let y = graph.matmul(x, w)?;
        let out_shape = graph.shape(y)?;
        let bias = graph.expand(b, &out_shape)?;
        let y = graph.add(y, bias)?;
        match self.activation {
            None => Ok(y),
            Some(Activation::Relu) => graph.relu(y),
            Some(Activation::Sigmoid) => graph.sigmoid(y),
            Some(Activation::Tanh) => graph.tanh(y),
        }
    }
}

impl NeuralUnit for FeedForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> DeviceId {
        self.weight.device()
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn clone_to_device(&self, device: &DeviceContext) -> Result<Self, EngineError> {
        Ok(Self {
            name: self.name.clone(),
            weight: copy_parameter(&self.weight, device)?,
            bias: copy_parameter(&self.bias, device)?,
            activation: self.activation,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::graph::ComputeGraph;

    #[test]
    fn test_forward_adds_bias_to_every_row() {
        let ctx = DeviceContext::cpu();
        let mut rng = StdRng::seed_from_u64(11);
        let layer = FeedForward::new("ff", 2, 3, None, &ctx, &mut rng).unwrap();
        layer.bias().value().copy_from_slice(&[1.0, 2.0, 3.0]).unwrap();

        let mut g = ComputeGraph::new(&ctx, false);
        let x = g.new_weight("x", &[4, 2], 0.0, false).unwrap();
        let y = layer.forward(&mut g, x).unwrap();
        let values = g.value(y).unwrap().to_vec().unwrap();
        assert_eq!(values, [1.0, 2.0, 3.0].repeat(4));
    }

    #[test]
    fn test_gradients_reach_parameters() {
        let ctx = DeviceContext::cpu();
        let mut rng = StdRng::seed_from_u64(12);
        let layer = FeedForward::new("ff", 3, 2, Some(Activation::Relu), &ctx, &mut rng).unwrap();
        layer.weight().value().fill(0.5).unwrap();

        let mut g = ComputeGraph::new(&ctx, true);
        let x = g.weight_from_vec("x", &[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3], false).unwrap();
        let y = layer.forward(&mut g, x).unwrap();
        g.sum(y).unwrap();
        g.backward().unwrap();

        // Every output is positive, so dW[i, j] = sum over rows of x[r, i].
        let grad = layer.weight().gradient().unwrap().to_vec().unwrap();
        assert_relative_eq!(grad[0], 2.0);
        assert_relative_eq!(grad[4], 4.0);
        let bias_grad = layer.bias().gradient().unwrap().to_vec().unwrap();
        assert_eq!(bias_grad, vec![2.0, 2.0]);

        // The parameters outlive the graph.
        drop(g);
        assert!(layer.weight().gradient().is_some());
    }
}
