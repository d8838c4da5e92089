//! Reductions to a scalar and the cross-entropy loss.
//!
//! Loss outputs are marked so that `backward()` seeds them with a gradient
//! of 1 when nothing downstream consumed them.

use crate::error::EngineError;
use crate::graph::{BackwardOp, ComputeGraph, NodeRef};
use crate::operations::{self, rows_and_cols};
use crate::tensor::Tensor;

#[derive(Debug)]
struct SumBackward {
    input: NodeRef,
    shape: Vec<usize>,
}

impl BackwardOp for SumBackward {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.input]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let ones = vec![1; self.shape.len()];
        let grad = grad_output.contiguous()?.view(&ones)?.expand(&self.shape)?;
        Ok(vec![(self.input, grad)])
    }
}

/// Gradient of the cross-entropy taken with respect to the logits of a
/// softmax: `(p - onehot(target)) * g`.
#[derive(Debug)]
struct SoftmaxCrossEntropyBackward {
    logits: NodeRef,
    probs_val: Tensor,
    targets: Vec<usize>,
    scale: f32,
}

impl BackwardOp for SoftmaxCrossEntropyBackward {
    fn name(&self) -> &'static str {
        "cross_entropy_loss"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.logits]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let g = grad_output.get(&[0])? * self.scale;
        let (_, cols) = rows_and_cols("cross_entropy_loss", &self.probs_val)?;
        let mut data = self.probs_val.to_vec()?;
        for (row, &target) in data.chunks_exact_mut(cols.max(1)).zip(&self.targets) {
            row[target] -= 1.0;
            for v in row.iter_mut() {
                *v *= g;
            }
        }
        let grad = self.probs_val.new_from_vec(data, self.probs_val.shape())?;
        Ok(vec![(self.logits, grad)])
    }
}

/// Gradient with respect to the probabilities themselves: `-g / p` at the
/// target and zero elsewhere.
#[derive(Debug)]
struct CrossEntropyBackward {
    probs: NodeRef,
    probs_val: Tensor,
    targets: Vec<usize>,
    scale: f32,
}

impl BackwardOp for CrossEntropyBackward {
    fn name(&self) -> &'static str {
        "cross_entropy_loss"
    }

    fn inputs(&self) -> Vec<NodeRef> {
        vec![self.probs]
    }

    fn backward(&self, grad_output: &Tensor) -> Result<Vec<(NodeRef, Tensor)>, EngineError> {
        let g = grad_output.get(&[0])? * self.scale;
        let (_, cols) = rows_and_cols("cross_entropy_loss", &self.probs_val)?;
        let mut data = self.probs_val.to_vec()?;
        for (row, &target) in data.chunks_exact_mut(cols.max(1)).zip(&self.targets) {
            let p = row[target];
            row.fill(0.0);
            // The loss clamps p at MIN_POSITIVE, so it is flat below that.
            if p >= f32::MIN_POSITIVE {
                row[target] = -g / p;
            }
        }
        let grad = self.probs_val.new_from_vec(data, self.probs_val.shape())?;
        Ok(vec![(self.probs, grad)])
    }
}

impl ComputeGraph {
    /// Sum of all elements as a `[1]` node.
    pub fn sum(&mut self, x: NodeRef) -> Result<NodeRef, EngineError> {
        let value = self.value(x)?;
        let shape = value.shape().to_vec();
        let out = operations::sum_all(&value)?;
        let node = self.push_op("sum", out, &[x], || SumBackward { input: x, shape })?;
        self.mark_loss(node)?;
        Ok(node)
    }

    /// Negative log-likelihood of `targets` under row probabilities `probs`.
    ///
    /// `probs` is `[batch, classes]` (normally a softmax output) and
    /// `targets` holds one class index per row. The result is the `[1]`
    /// sum of `-ln p[row, target]`, or its mean when `avg_loss` is set.
    ///
    /// When `probs` comes straight from a recorded [`softmax`](Self::softmax)
    /// the loss is recorded against the softmax input and sends it
    /// `p - onehot` directly. Other consumers of `probs` still go through
    /// the softmax Jacobian.
    pub fn cross_entropy_loss(
        &mut self,
        probs: NodeRef,
        targets: &[usize],
        avg_loss: bool,
    ) -> Result<NodeRef, EngineError> {
        let probs_val = self.value(probs)?;
        if probs_val.ndim() != 2 {
            return Err(EngineError::RankMismatch {
                expected: 2,
                actual: probs_val.ndim(),
            });
        }
        let (rows, cols) = rows_and_cols("cross_entropy_loss", &probs_val)?;
        if targets.len() != rows {
            return Err(EngineError::shape("cross_entropy_loss", &[rows], &[targets.len()]));
        }
        if let Some(&index) = targets.iter().find(|&&t| t >= cols) {
            return Err(EngineError::IndexOutOfBounds {
                index,
                dim_size: cols,
            });
        }

        let data = probs_val.to_vec()?;
        let mut loss: f64 = data
            .chunks_exact(cols.max(1))
            .zip(targets)
            .map(|(row, &t)| -f64::from(row[t].max(f32::MIN_POSITIVE)).ln())
            .sum();
        let scale = if avg_loss && rows > 0 {
            loss /= rows as f64;
            1.0 / rows as f32
        } else {
            1.0
        };
        let out = probs_val.new_from_vec(vec![loss as f32], &[1])?;

        let targets = targets.to_vec();
        let node = match self.softmax_input(probs) {
            Some(logits) => self.push_op("cross_entropy_loss", out, &[logits], || {
                SoftmaxCrossEntropyBackward {
                    logits,
                    probs_val,
                    targets,
                    scale,
                }
            })?,
            None => self.push_op("cross_entropy_loss", out, &[probs], || CrossEntropyBackward {
                probs,
                probs_val,
                targets,
                scale,
            })?,
        };
        self.mark_loss(node)?;
        Ok(node)
    }
}
