//! Step-wise generation with an out-of-memory checkpoint.
//!
//! Each step runs in its own subgraph scope, so intermediate nodes are
//! released between steps. Running out of device memory abandons the
//! remaining steps but keeps everything produced so far.

use log::{debug, warn};

use crate::error::EngineError;
use crate::graph::ComputeGraph;

/// How a stepped run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The step function finished or `max_steps` was reached.
    Completed,
    /// Step `step` ran out of device memory; later steps were not run.
    OutOfMemory { step: usize },
}

/// Outputs of the steps that completed.
#[derive(Debug)]
pub struct DecodeReport<T> {
    pub status: RunStatus,
    pub outputs: Vec<T>,
}

impl<T> DecodeReport<T> {
    pub fn steps(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Run up to `max_steps` steps of `step_fn` on `graph`.
///
/// `step_fn` receives the step's scope and index and returns `Some(output)`
/// to continue or `None` to stop. Outputs must be owned data: nodes created
/// during a step are released when it ends unless unbound.
///
/// # Errors
///
/// Any error other than `OutOfMemory` is returned unchanged.
pub fn run_steps<T, F>(
    graph: &mut ComputeGraph,
    max_steps: usize,
    mut step_fn: F,
) -> Result<DecodeReport<T>, EngineError>
where
    F: FnMut(&mut ComputeGraph, usize) -> Result<Option<T>, EngineError>,
{
    let mut outputs = Vec::new();
    for step in 0..max_steps {
        let result = {
            let mut scope = graph.create_subgraph("decode_step");
            step_fn(&mut scope, step)
        };
        match result {
            Ok(Some(output)) => outputs.push(output),
            Ok(None) => break,
            Err(err) if err.is_out_of_memory() => {
                warn!(
                    "decode step {step} ran out of memory; keeping {} completed steps: {err}",
                    outputs.len()
                );
                return Ok(DecodeReport {
                    status: RunStatus::OutOfMemory { step },
                    outputs,
                });
            }
            Err(err) => return Err(err),
        }
    }
    debug!("decode finished after {} steps", outputs.len());
    Ok(DecodeReport {
        status: RunStatus::Completed,
        outputs,
    })
}
