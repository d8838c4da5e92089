//! Weight nodes: a value tensor paired with a lazily allocated gradient.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{DeviceContext, DeviceId};
use crate::error::EngineError;
use crate::operations;
use crate::tensor::Tensor;

/// Handle to a node in a [`ComputeGraph`](crate::ComputeGraph).
///
/// Handles are generation-checked: once the node is released, the handle
/// reports `DisposedAccess` even if its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}v{}", self.index, self.generation)
    }
}

/// A value tensor, its gradient and training metadata.
#[derive(Debug)]
pub struct WeightNode {
    name: String,
    value: Tensor,
    grad: Option<Tensor>,
    trainable: bool,
    lr_factor: f32,
}

impl WeightNode {
    pub fn new(name: impl Into<String>, value: Tensor, trainable: bool) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            trainable,
            lr_factor: 1.0,
        }
    }

    /// Scale applied by an optimizer to this weight's learning rate.
    pub fn with_lr_factor(mut self, lr_factor: f32) -> Self {
        self.lr_factor = lr_factor;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn gradient(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn lr_factor(&self) -> f32 {
        self.lr_factor
    }

    pub fn set_lr_factor(&mut self, lr_factor: f32) {
        self.lr_factor = lr_factor;
    }

    pub fn device(&self) -> DeviceId {
        self.value.device()
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Gradient tensor, zero-filled on first access.
    pub fn gradient_or_zeros(&mut self) -> Result<&Tensor, EngineError> {
        let grad = match self.grad.take() {
            Some(grad) => grad,
            None => self.value.new_zeros(self.value.shape())?,
        };
        Ok(&*self.grad.insert(grad))
    }

    /// Add `contribution` into the gradient.
    pub fn accumulate_gradient(&mut self, contribution: &Tensor) -> Result<(), EngineError> {
        if contribution.shape() != self.value.shape() {
            return Err(EngineError::shape(
                "accumulate_gradient",
                self.value.shape(),
                contribution.shape(),
            ));
        }
        let grad = self.gradient_or_zeros()?;
        operations::accumulate(grad, contribution)
    }

    /// Overwrite the gradient with a copy of `grad`.
    pub fn set_gradient(&mut self, grad: &Tensor) -> Result<(), EngineError> {
        if grad.shape() != self.value.shape() {
            return Err(EngineError::shape(
                "set_gradient",
                self.value.shape(),
                grad.shape(),
            ));
        }
        let target = self.gradient_or_zeros()?;
        operations::copy_into(target, grad)
    }

    /// Zero the gradient if one was allocated.
    pub fn clear_gradient(&mut self) -> Result<(), EngineError> {
        match &self.grad {
            Some(grad) => grad.fill(0.0),
            None => Ok(()),
        }
    }

    /// Drop the gradient buffer.
    pub fn release_gradient(&mut self) {
        self.grad = None;
    }

    /// Replace the value with `value`, which must have the same shape.
    pub fn set_value(&mut self, value: Tensor) -> Result<(), EngineError> {
        if value.shape() != self.value.shape() {
            return Err(EngineError::shape("set_value", self.value.shape(), value.shape()));
        }
        self.value = value;
        Ok(())
    }

    /// Copy of the value into `target`'s pool. The copy has no gradient.
    pub fn copy_to(&self, target: &DeviceContext) -> Result<Self, EngineError> {
        let data = self.value.to_vec()?;
        let value = Tensor::allocate(target, self.value.shape(), self.value.dtype())?;
        value.copy_from_slice(&data)?;
        Ok(Self {
            name: self.name.clone(),
            value,
            grad: None,
            trainable: self.trainable,
            lr_factor: self.lr_factor,
        })
    }
}

/// A persistent weight shared between graphs and threads.
///
/// Parameters outlive any single graph: binding one into a graph and
/// disposing the graph leaves the parameter and its gradient intact.
#[derive(Debug, Clone)]
pub struct Parameter(Arc<Mutex<WeightNode>>);

impl Parameter {
    pub fn new(node: WeightNode) -> Self {
        Self(Arc::new(Mutex::new(node)))
    }

    fn lock(&self) -> MutexGuard<'_, WeightNode> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&WeightNode) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut WeightNode) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Alias of the value tensor.
    pub fn value(&self) -> Tensor {
        self.lock().value.clone()
    }

    /// Alias of the gradient tensor, if any.
    pub fn gradient(&self) -> Option<Tensor> {
        self.lock().grad.clone()
    }

    pub fn device(&self) -> DeviceId {
        self.lock().device()
    }

    pub fn trainable(&self) -> bool {
        self.lock().trainable
    }

    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_allocated_lazily() {
        let ctx = DeviceContext::cpu();
        let mut node = WeightNode::new("w", Tensor::full(&ctx, &[2, 2], 1.0).unwrap(), true);
        assert!(node.gradient().is_none());
        let grad = node.gradient_or_zeros().unwrap();
        assert_eq!(grad.to_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_accumulate_is_additive() {
        let ctx = DeviceContext::cpu();
        let mut node = WeightNode::new("w", Tensor::zeros(&ctx, &[2]).unwrap(), true);
        let g = Tensor::from_vec(&ctx, vec![1.0, 2.0], &[2]).unwrap();
        node.accumulate_gradient(&g).unwrap();
        node.accumulate_gradient(&g).unwrap();
        assert_eq!(node.gradient().unwrap().to_vec().unwrap(), vec![2.0, 4.0]);
        // The gradient owns its own buffer.
        assert!(!node.gradient().unwrap().shares_buffer_with(&g));

        let wrong = Tensor::zeros(&ctx, &[3]).unwrap();
        assert!(matches!(
            node.accumulate_gradient(&wrong),
            Err(EngineError::ShapeMismatch { .. })
        ));

        node.clear_gradient().unwrap();
        assert_eq!(node.gradient().unwrap().to_vec().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_parameter_shared_across_clones() {
        let ctx = DeviceContext::cpu();
        let p = Parameter::new(WeightNode::new("p", Tensor::zeros(&ctx, &[1]).unwrap(), true).with_lr_factor(0.5));
        let q = p.clone();
        assert!(p.ptr_eq(&q));
        q.with_mut(|n| n.set_lr_factor(2.0));
        assert_eq!(p.with(|n| n.lr_factor()), 2.0);
        assert_eq!(p.name(), "p");
    }
}
