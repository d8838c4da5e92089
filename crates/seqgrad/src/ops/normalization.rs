use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations::{self, NormStats};
use crate::tensor::Tensor;

#[derive(Debug)]
struct NormBackward {
    op: &'static str,
    x: NodeRef,
    gamma: NodeRef,
    beta: NodeRef,
    x_val: Tensor,
    gamma_val: Tensor,
    stats: NormStats,
}

impl BackwardOp for NormBackward {
    fn name(&self) -> &'static str {
        self.op
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.x, self.gamma, self.beta]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let (dx, dgamma, dbeta) =
            operations::normalize_rows_backward(&self.x_val, &self.gamma_val, &self.stats, grad_output)?;
        Ok(vec![(self.x, dx), (self.gamma, dgamma), (self.beta, dbeta)])
    }
}

impl ComputeGraph {
    /// Layer normalization over the last dimension: `(x - mean) / sqrt(var + eps) * gamma + beta`.
    pub fn layer_norm(
        &mut self,
        x: NodeRef,
        gamma: NodeRef,
        beta: NodeRef,
        eps: f32,
    ) -> Result<NodeRef, EngineError> {
        self.normalize("layer_norm", x, gamma, beta, eps, true)
    }

    /// RMS normalization over the last dimension: `x / sqrt(mean(x^2) + eps) * gamma + beta`.
    pub fn rms_norm(
        &mut self,
        x: NodeRef,
        gamma: NodeRef,
        beta: NodeRef,
        eps: f32,
    ) -> Result<NodeRef, EngineError> {
        self.normalize("rms_norm", x, gamma, beta, eps, false)
    }

    fn normalize(
        &mut self,
        op: &'static str,
        x: NodeRef,
        gamma: NodeRef,
        beta: NodeRef,
        eps: f32,
        centered: bool,
    ) -> Result<NodeRef, EngineError> {
        let x_val = self.value(x)?;
        let gamma_val = self.value(gamma)?;
        let beta_val = self.value(beta)?;
        let (out, stats) = operations::normalize_rows(&x_val, &gamma_val, &beta_val, eps, centered)?;
        self.push_op(op, out, &[x, gamma, beta], || NormBackward {
            op,
            x,
            gamma,
            beta,
            x_val,
            gamma_val,
            stats,
        })
    }
}
