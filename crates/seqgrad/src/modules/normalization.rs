use super::{NeuralUnit, copy_parameter, new_parameter};
use crate::device::{DeviceContext, DeviceId};
use crate::error::EngineError;
use crate::graph::{ComputeGraph, NodeRef, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Layer,
    Rms,
}

/// Normalization over the last dimension with learned scale and shift.
#[derive(Debug)]
pub struct Normalization {
    name: String,
    kind: NormKind,
    gamma: Parameter,
    beta: Parameter,
    eps: f32,
}

impl Normalization {
    /// Unit scale, zero shift.
    pub fn new(
        name: &str,
        kind: NormKind,
        dim: usize,
        eps: f32,
        device: &DeviceContext,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            name: name.to_string(),
            kind,
            gamma: new_parameter(device, name, "gamma", &[dim], &vec![1.0; dim])?,
            beta: new_parameter(device, name, "beta", &[dim], &vec![0.0; dim])?,
            eps,
        })
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn forward(&self, graph: &mut ComputeGraph, x: NodeRef) -> Result<NodeRef, EngineError> {
        let gamma = graph.bind(&self.gamma)?;
        let beta = graph.bind(&self.beta)?;
        match self.kind {
            NormKind::Layer => graph.layer_norm(x, gamma, beta, self.eps),
            NormKind::Rms => graph.rms_norm(x, gamma, beta, self.eps),
        }
    }
}

impl NeuralUnit for Normalization {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> DeviceId {
        self.gamma.device()
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn clone_to_device(&self, device: &DeviceContext) -> Result<Self, EngineError> {
        Ok(Self {
            name: self.name.clone(),
            kind: self.kind,
            gamma: copy_parameter(&self.gamma, device)?,
            beta: copy_parameter(&self.beta, device)?,
            eps: self.eps,
        })
    }
}
