//! Error types for seqgrad.

use thiserror::Error;

use crate::device::DeviceId;

/// Errors that can occur while building, running, or differentiating a graph.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operand shapes are incompatible for the requested operation.
    #[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Operands live on different devices.
    #[error("device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: DeviceId, actual: DeviceId },

    /// The device pool could not satisfy an allocation.
    #[error(
        "out of memory on {device}: requested {requested} bytes with {reserved} bytes reserved (limit {limit:?})"
    )]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        reserved: usize,
        limit: Option<usize>,
    },

    /// A buffer or node was used after its owner released it.
    #[error("use of disposed {what}")]
    DisposedAccess { what: String },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// Operation requires specific tensor rank.
    #[error("expected tensor of rank {expected}, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// `backward()` was called on a graph built without gradients.
    #[error("graph was built for inference and has no tape")]
    NotRecording,

    /// `backward()` was called twice without a new forward pass.
    #[error("tape already replayed; run a new forward pass before calling backward again")]
    TapeConsumed,

    /// A named weight already exists in the graph.
    #[error("weight '{name}' already exists in this graph")]
    DuplicateName { name: String },

    /// A named parameter is missing from a module or a model container.
    #[error("parameter '{name}' not found")]
    ParameterNotFound { name: String },

    /// A device worker thread panicked.
    #[error("worker for {device} panicked")]
    WorkerPanicked { device: DeviceId },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl EngineError {
    /// Whether this error is the recoverable out-of-memory condition.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, EngineError::OutOfMemory { .. })
    }

    pub(crate) fn shape(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        EngineError::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
