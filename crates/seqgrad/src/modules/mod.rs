//! Network units built from persistent parameters.
//!
//! A unit owns [`Parameter`]s, binds them into a graph on every forward
//! pass and can be saved, restored and cloned onto another device. The
//! concrete units form the closed set [`Module`].

mod embedding;
mod feed_forward;
mod normalization;

pub use embedding::Embedding;
pub use feed_forward::{Activation, FeedForward};
pub use normalization::{NormKind, Normalization};

use crate::device::{DeviceContext, DeviceId};
use crate::error::EngineError;
use crate::graph::{ComputeGraph, NodeRef, Parameter, WeightNode};
use crate::serialize::ModelStore;
use crate::tensor::Tensor;

/// Capabilities shared by every network unit.
pub trait NeuralUnit {
    fn name(&self) -> &str;

    fn device(&self) -> DeviceId;

    /// Parameters in a stable order. Names are unique within the unit.
    fn parameters(&self) -> Vec<Parameter>;

    /// Copy of the unit whose parameters live on `device`, without gradients.
    fn clone_to_device(&self, device: &DeviceContext) -> Result<Self, EngineError>
    where
        Self: Sized;

    fn save(&self, store: &mut ModelStore) -> Result<(), EngineError> {
        for param in self.parameters() {
            store.insert(&param.name(), &param.value())?;
        }
        Ok(())
    }

    /// Overwrite parameter values from `store`; every name must be present
    /// with the recorded shape. Nothing is written unless all of them are.
    fn load(&self, store: &ModelStore) -> Result<(), EngineError> {
        let params = self.parameters();
        for param in &params {
            store.check(&param.name(), param.value().shape())?;
        }
        for param in &params {
            store.restore_into(&param.name(), &param.value())?;
        }
        Ok(())
    }
}

/// What a unit consumes: a node, or token ids for an embedding lookup.
#[derive(Debug, Clone, Copy)]
pub enum UnitInput<'a> {
    Node(NodeRef),
    Tokens(&'a [usize]),
}

impl From<NodeRef> for UnitInput<'_> {
    fn from(node: NodeRef) -> Self {
        UnitInput::Node(node)
    }
}

impl<'a> From<&'a [usize]> for UnitInput<'a> {
    fn from(tokens: &'a [usize]) -> Self {
        UnitInput::Tokens(tokens)
    }
}

/// The closed set of network units.
#[derive(Debug)]
pub enum Module {
    FeedForward(FeedForward),
    Normalization(Normalization),
    Embedding(Embedding),
}

impl Module {
    /// Run the unit on `graph`.
    pub fn forward<'a>(
        &self,
        graph: &mut ComputeGraph,
        input: impl Into<UnitInput<'a>>,
    ) -> Result<NodeRef, EngineError> {
        match (self, input.into()) {
            (Module::FeedForward(unit), UnitInput::Node(x)) => unit.forward(graph, x),
            (Module::Normalization(unit), UnitInput::Node(x)) => unit.forward(graph, x),
            (Module::Embedding(unit), UnitInput::Tokens(ids)) => unit.forward(graph, ids),
            (unit, input) => Err(EngineError::InvalidOperation(format!(
                "unit '{}' cannot consume {input:?}",
                unit.name()
            ))),
        }
    }
}

impl NeuralUnit for Module {
    fn name(&self) -> &str {
        match self {
            Module::FeedForward(unit) => unit.name(),
            Module::Normalization(unit) => unit.name(),
            Module::Embedding(unit) => unit.name(),
        }
    }

    fn device(&self) -> DeviceId {
        match self {
            Module::FeedForward(unit) => unit.device(),
            Module::Normalization(unit) => unit.device(),
            Module::Embedding(unit) => unit.device(),
        }
    }

    fn parameters(&self) -> Vec<Parameter> {
        match self {
            Module::FeedForward(unit) => unit.parameters(),
            Module::Normalization(unit) => unit.parameters(),
            Module::Embedding(unit) => unit.parameters(),
        }
    }

    fn clone_to_device(&self, device: &DeviceContext) -> Result<Self, EngineError> {
        Ok(match self {
            Module::FeedForward(unit) => Module::FeedForward(unit.clone_to_device(device)?),
            Module::Normalization(unit) => Module::Normalization(unit.clone_to_device(device)?),
            Module::Embedding(unit) => Module::Embedding(unit.clone_to_device(device)?),
        })
    }
}

impl From<FeedForward> for Module {
    fn from(unit: FeedForward) -> Self {
        Module::FeedForward(unit)
    }
}

impl From<Normalization> for Module {
    fn from(unit: Normalization) -> Self {
        Module::Normalization(unit)
    }
}

impl From<Embedding> for Module {
    fn from(unit: Embedding) -> Self {
        Module::Embedding(unit)
    }
}

/// New trainable parameter `"{unit}.{suffix}"` filled from `data`.
fn new_parameter(
    device: &DeviceContext,
    unit: &str,
    suffix: &str,
    shape: &[usize],
    data: &[f32],
) -> Result<Parameter, EngineError> {
    let value = Tensor::zeros(device, shape)?;
    value.copy_from_slice(data)?;
    Ok(Parameter::new(WeightNode::new(format!("{unit}.{suffix}"), value, true)))
}

fn copy_parameter(param: &Parameter, device: &DeviceContext) -> Result<Parameter, EngineError> {
    Ok(Parameter::new(param.with(|node| node.copy_to(device))?))
}
