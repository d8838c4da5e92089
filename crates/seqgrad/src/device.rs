//! Devices and the per-device context threaded through tensor creation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::EngineError;
use crate::storage::DeviceAllocator;

/// Identifier of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Kind of processor the device ids refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    #[default]
    Cpu,
    Accelerator,
}

/// Handle to one device: its id, processor kind and memory pool.
///
/// Cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    id: DeviceId,
    kind: ProcessorKind,
    dtype: DType,
    allocator: Arc<DeviceAllocator>,
}

impl DeviceContext {
    /// Create a device with its own pool. `limit_bytes` caps what the pool
    /// may reserve; `None` leaves only host allocation failure as a limit.
    pub fn new(id: DeviceId, kind: ProcessorKind, limit_bytes: Option<usize>) -> Self {
        Self {
            id,
            kind,
            dtype: DType::Float32,
            allocator: Arc::new(DeviceAllocator::new(id, limit_bytes)),
        }
    }

    /// Unlimited host device with id 0.
    pub fn cpu() -> Self {
        Self::new(DeviceId(0), ProcessorKind::Cpu, None)
    }

    /// Set the element type used by default for tensors created on this device.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn kind(&self) -> ProcessorKind {
        self.kind
    }

    pub fn default_dtype(&self) -> DType {
        self.dtype
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }
}

/// Fail with `DeviceMismatch` unless both ids are equal.
pub fn ensure_same_device(expected: DeviceId, actual: DeviceId) -> Result<(), EngineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(EngineError::DeviceMismatch { expected, actual })
    }
}
