//! Token embedding table.

use rand::Rng;

use super::{NeuralUnit, copy_parameter, new_parameter};
use crate::device::{DeviceContext, DeviceId};
use crate::error::EngineError;
use crate::graph::{ComputeGraph, NodeRef, Parameter};
use crate::random::Init;

/// `[vocab, dim]` table looked up by token id.
#[derive(Debug)]
pub struct Embedding {
    name: String,
    table: Parameter,
}

impl Embedding {
    pub fn new<R: Rng>(
        name: &str,
        vocab: usize,
        dim: usize,
        device: &DeviceContext,
        rng: &mut R,
    ) -> Result<Self, EngineError> {
        let shape = [vocab, dim];
        let data = Init::Normal { mean: 0.0, std: 0.1 }.sample(&shape, rng)?;
        Ok(Self {
            name: name.to_string(),
            table: new_parameter(device, name, "table", &shape, &data)?,
        })
    }

    pub fn table(&self) -> &Parameter {
        &self.table
    }

    /// `[tokens.len(), dim]` rows of the table.
    pub fn forward(&self, graph: &mut ComputeGraph, tokens: &[usize]) -> Result<NodeRef, EngineError> {
        let table = graph.bind(&self.table)?;
        graph.index_select(table, tokens)
    }
}

impl NeuralUnit for Embedding {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> DeviceId {
        self.table.device()
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.table.clone()]
    }

    fn clone_to_device(&self, device: &DeviceContext) -> Result<Self, EngineError> {
        Ok(Self {
            name: self.name.clone(),
            table: copy_parameter(&self.table, device)?,
        })
    }
}
