//! Device memory for tensors.
//!
//! ```text
//! DeviceAllocator (one per device)
//! └── Buffer - reference-counted handle to one pooled block
//! ```

mod buffer;
mod pool;

pub use buffer::Buffer;
pub use pool::{AllocatorStats, BufferHandle, DeviceAllocator};
