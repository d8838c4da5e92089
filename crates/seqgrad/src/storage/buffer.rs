//! Pooled buffer handles.

use std::sync::Arc;

use log::warn;

use super::pool::{BufferHandle, DeviceAllocator};
use crate::device::DeviceId;
use crate::error::EngineError;

/// One alias of a pooled block.
///
/// Cloning registers another alias with the pool and dropping releases it;
/// the block goes back to the free list when the last alias is gone.
#[derive(Debug)]
pub struct Buffer {
    allocator: Arc<DeviceAllocator>,
    handle: BufferHandle,
    len: usize,
}

impl Buffer {
    /// Acquire a zero-filled buffer of `len` elements.
    pub fn allocate(allocator: &Arc<DeviceAllocator>, len: usize) -> Result<Self, EngineError> {
        let handle = allocator.acquire(len)?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            handle,
            len,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    pub fn device(&self) -> DeviceId {
        self.allocator.device()
    }

    /// Number of elements in the block.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether both buffers alias the same block.
    pub fn same_block(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.allocator, &other.allocator) && self.handle == other.handle
    }

    /// Whether both buffers live in the same pool.
    pub fn same_pool(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.allocator, &other.allocator)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R, EngineError> {
        self.allocator.read(self.handle, f)
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R, EngineError> {
        self.allocator.write(self.handle, f)
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        let retained = self.allocator.retain(self.handle);
        if let Err(err) = &retained {
            warn!("cloning {}: {err}", self.handle);
        }
        debug_assert!(retained.is_ok(), "cloned a released buffer {}", self.handle);
        Self {
            allocator: Arc::clone(&self.allocator),
            handle: self.handle,
            len: self.len,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.allocator.release(self.handle) {
            warn!("releasing {}: {err}", self.handle);
        }
    }
}
