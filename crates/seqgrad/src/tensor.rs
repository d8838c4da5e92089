//! Strided tensors over pooled device buffers.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::{DeviceContext, DeviceId};
use crate::dtype::DType;
use crate::error::EngineError;
use crate::storage::{Buffer, BufferHandle, DeviceAllocator};
use crate::strides::{Layout, shape_len};

/// A shaped, strided view over a pooled [`Buffer`].
///
/// `Clone` creates another alias of the same buffer; writes through one
/// alias are visible through all of them. Views (`view`, `expand`,
/// `transpose`, `narrow`) alias as well and never copy.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Buffer,
    layout: Layout,
    dtype: DType,
}

impl Tensor {
    /// Obtain a zero-filled tensor from the device pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqgrad::{DType, DeviceContext, Tensor};
    ///
    /// let ctx = DeviceContext::cpu();
    /// let t = Tensor::allocate(&ctx, &[2, 3], DType::Float32).unwrap();
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.len(), 6);
    /// ```
    pub fn allocate(ctx: &DeviceContext, shape: &[usize], dtype: DType) -> Result<Self, EngineError> {
        Self::alloc_in(ctx.allocator(), shape, dtype)
    }

    /// Zero-filled tensor with the device's default element type.
    pub fn zeros(ctx: &DeviceContext, shape: &[usize]) -> Result<Self, EngineError> {
        Self::allocate(ctx, shape, ctx.default_dtype())
    }

    pub fn full(ctx: &DeviceContext, shape: &[usize], value: f32) -> Result<Self, EngineError> {
        let t = Self::zeros(ctx, shape)?;
        t.fill(value)?;
        Ok(t)
    }

    /// Create a tensor from row-major data.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ShapeMismatch` if data length doesn't match shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use seqgrad::{DeviceContext, Tensor};
    ///
    /// let ctx = DeviceContext::cpu();
    /// let t = Tensor::from_vec(&ctx, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.get(&[0, 1]).unwrap(), 2.0);
    /// assert_eq!(t.get(&[1, 0]).unwrap(), 4.0);
    /// ```
    pub fn from_vec(ctx: &DeviceContext, data: Vec<f32>, shape: &[usize]) -> Result<Self, EngineError> {
        Self::from_slice_in(ctx.allocator(), &data, shape, ctx.default_dtype())
    }

    pub(crate) fn alloc_in(
        allocator: &Arc<DeviceAllocator>,
        shape: &[usize],
        dtype: DType,
    ) -> Result<Self, EngineError> {
        let buffer = Buffer::allocate(allocator, shape_len(shape))?;
        Ok(Self {
            buffer,
            layout: Layout::contiguous(shape),
            dtype,
        })
    }

    fn from_slice_in(
        allocator: &Arc<DeviceAllocator>,
        data: &[f32],
        shape: &[usize],
        dtype: DType,
    ) -> Result<Self, EngineError> {
        if data.len() != shape_len(shape) {
            return Err(EngineError::shape("from_vec", shape, &[data.len()]));
        }
        let t = Self::alloc_in(allocator, shape, dtype)?;
        t.buffer.write(|dst| {
            dst.copy_from_slice(data);
            dtype.quantize_slice(dst);
        })?;
        Ok(t)
    }

    /// Zero-filled tensor on the same device with the same element type.
    pub fn new_zeros(&self, shape: &[usize]) -> Result<Self, EngineError> {
        Self::alloc_in(self.buffer.allocator(), shape, self.dtype)
    }

    /// Tensor from row-major data on the same device with the same element type.
    pub fn new_from_vec(&self, data: Vec<f32>, shape: &[usize]) -> Result<Self, EngineError> {
        Self::from_slice_in(self.buffer.allocator(), &data, shape, self.dtype)
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> DeviceId {
        self.buffer.device()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Bytes addressed by this view at its element width.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    pub fn buffer_handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub(crate) fn allocator(&self) -> &Arc<DeviceAllocator> {
        self.buffer.allocator()
    }

    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        self.buffer.same_block(&other.buffer)
    }

    /// Get element by cartesian indices.
    pub fn get(&self, indices: &[usize]) -> Result<f32, EngineError> {
        let offset = self.layout.offset_of(indices)?;
        self.buffer.read(|data| data[offset])
    }

    /// Set element by cartesian indices. The write is visible through every alias.
    pub fn set(&self, indices: &[usize], value: f32) -> Result<(), EngineError> {
        let offset = self.layout.offset_of(indices)?;
        let value = self.dtype.quantize(value);
        self.buffer.write(|data| data[offset] = value)
    }

    /// Copy the addressed elements out in row-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>, EngineError> {
        let layout = &self.layout;
        self.buffer.read(|data| layout.offsets().map(|o| data[o]).collect())
    }

    /// Overwrite the addressed elements from row-major values.
    pub fn copy_from_slice(&self, values: &[f32]) -> Result<(), EngineError> {
        if values.len() != self.len() {
            return Err(EngineError::shape(
                "copy_from_slice",
                self.shape(),
                &[values.len()],
            ));
        }
        self.ensure_writable()?;
        let (layout, dtype) = (&self.layout, self.dtype);
        self.buffer.write(|data| {
            for (o, &v) in layout.offsets().zip(values) {
                data[o] = dtype.quantize(v);
            }
        })
    }

    pub fn fill(&self, value: f32) -> Result<(), EngineError> {
        self.ensure_writable()?;
        let (layout, value) = (&self.layout, self.dtype.quantize(value));
        self.buffer.write(|data| {
            for o in layout.offsets() {
                data[o] = value;
            }
        })
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.layout.is_broadcast() {
            return Err(EngineError::InvalidOperation(
                "cannot write through a broadcast view".to_string(),
            ));
        }
        Ok(())
    }

    fn with_layout(&self, layout: Layout) -> Result<Self, EngineError> {
        if layout.max_extent() > self.buffer.len() {
            return Err(EngineError::InvalidOperation(format!(
                "view of extent {} exceeds buffer of {} elements",
                layout.max_extent(),
                self.buffer.len()
            )));
        }
        Ok(Self {
            buffer: self.buffer.clone(),
            layout,
            dtype: self.dtype,
        })
    }

    /// Reinterpret a contiguous tensor with a new shape (zero-copy).
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the element count differs, `InvalidOperation` if
    /// the tensor is not contiguous.
    pub fn view(&self, shape: &[usize]) -> Result<Self, EngineError> {
        self.with_layout(self.layout.reshaped(shape)?)
    }

    /// Broadcast extent-1 dimensions to `dims` without copying.
    pub fn expand(&self, dims: &[usize]) -> Result<Self, EngineError> {
        self.with_layout(self.layout.expanded(dims)?)
    }

    /// Swap two dimensions (zero-copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self, EngineError> {
        self.with_layout(self.layout.transposed(dim0, dim1)?)
    }

    /// Restrict dimension `dim` to `start..start + len` (zero-copy).
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self, EngineError> {
        self.with_layout(self.layout.narrowed(dim, start, len)?)
    }

    /// This tensor if already dense row-major, otherwise a packed copy.
    pub fn contiguous(&self) -> Result<Self, EngineError> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.deep_copy()
    }

    /// Packed copy in a fresh buffer.
    pub fn deep_copy(&self) -> Result<Self, EngineError> {
        let out = self.new_zeros(self.shape())?;
        let layout = &self.layout;
        out.kernel(&[self], |inputs, dst| {
            for (d, o) in dst.iter_mut().zip(layout.offsets()) {
                *d = inputs[0][o];
            }
        })?;
        Ok(out)
    }

    /// Run `f` with read access to `inputs` and write access to this tensor's block.
    pub(crate) fn kernel<R>(
        &self,
        inputs: &[&Tensor],
        f: impl FnOnce(&[&[f32]], &mut [f32]) -> R,
    ) -> Result<R, EngineError> {
        let mut handles: SmallVec<[BufferHandle; 4]> = SmallVec::new();
        for t in inputs {
            if !t.buffer.same_pool(&self.buffer) {
                return Err(EngineError::DeviceMismatch {
                    expected: self.device(),
                    actual: t.device(),
                });
            }
            handles.push(t.buffer.handle());
        }
        self.buffer
            .allocator()
            .with_blocks(&handles, self.buffer.handle(), f)
    }

    pub(crate) fn read_block<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R, EngineError> {
        self.buffer.read(f)
    }
}
