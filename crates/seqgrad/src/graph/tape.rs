//! The tape: recorded operations and their gradient rules.

use std::fmt::Debug;

use super::node::NodeRef;
use crate::error::EngineError;
use crate::tensor::Tensor;

/// Backward rule of one recorded operation.
///
/// Implementations hold whatever forward tensors they need (as buffer
/// aliases) and the handles of their inputs.
pub trait BackwardOp: Debug + Send {
    /// Operation name, for logs and errors.
    fn name(&self) -> &'static str;

    /// Input nodes, in the order gradients are returned for them.
    fn inputs(&self) -> Vec<NodeRef>;

    /// Compute VJP: given grad_output, return a gradient for each input.
    ///
    /// Returned tensors may alias `grad_output` or saved tensors; the
    /// graph adds them into the inputs' own gradient buffers.
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError>;
}

/// One recorded operation.
#[derive(Debug)]
pub(crate) struct TapeEntry {
    pub output: NodeRef,
    pub op: Box<dyn BackwardOp>,
}
