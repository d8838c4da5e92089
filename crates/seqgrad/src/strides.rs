//! Stride computation utilities.
//!
//! Uses row-major order: the last dimension is contiguous, which is the
//! layout of a `[batch, features]` activation matrix.

use smallvec::SmallVec;

use crate::error::EngineError;

/// Inline storage for shapes and strides.
pub type Dims = SmallVec<[usize; 4]>;

/// Compute row-major strides from shape.
///
/// For shape [d0, d1, d2], returns strides [d1*d2, d2, 1].
///
/// # Examples
///
/// ```
/// use seqgrad::strides::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]).as_slice(), &[20, 5, 1]);
/// assert_eq!(compute_strides(&[2, 3]).as_slice(), &[3, 1]);
/// assert!(compute_strides(&[]).is_empty());
/// ```
pub fn compute_strides(shape: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(0, shape.len());
    let mut stride = 1;
    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride *= dim;
    }
    strides
}

/// Number of elements addressed by a shape. The empty shape is a scalar.
#[inline]
pub fn shape_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Convert cartesian indices to a linear offset.
#[inline]
pub fn cartesian_to_linear(indices: &[usize], strides: &[usize]) -> usize {
    indices
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Convert a row-major linear index to cartesian indices.
pub fn linear_to_cartesian(mut linear: usize, shape: &[usize]) -> Dims {
    let mut indices: Dims = SmallVec::from_elem(0, shape.len());
    for (i, &dim) in shape.iter().enumerate().rev() {
        if dim > 0 {
            indices[i] = linear % dim;
            linear /= dim;
        }
    }
    indices
}

/// Shape, strides and storage offset of a tensor view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Dims,
    strides: Dims,
    offset: usize,
}

impl Layout {
    /// Dense row-major layout starting at offset 0.
    pub fn contiguous(shape: &[usize]) -> Self {
        Self {
            shape: SmallVec::from_slice(shape),
            strides: compute_strides(shape),
            offset: 0,
        }
    }

    pub fn new(shape: &[usize], strides: &[usize], offset: usize) -> Self {
        debug_assert_eq!(shape.len(), strides.len());
        Self {
            shape: SmallVec::from_slice(shape),
            strides: SmallVec::from_slice(strides),
            offset,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        shape_len(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when elements are laid out densely in row-major order.
    ///
    /// Dimensions of extent 1 are ignored since their stride is never used.
    pub fn is_contiguous(&self) -> bool {
        let expected = compute_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&dim, (&s, &e))| dim <= 1 || s == e)
    }

    /// True when some dimension repeats elements through a zero stride.
    pub fn is_broadcast(&self) -> bool {
        self.shape
            .iter()
            .zip(self.strides.iter())
            .any(|(&dim, &s)| dim > 1 && s == 0)
    }

    /// One past the largest storage offset this view touches.
    pub fn max_extent(&self) -> usize {
        if self.is_empty() {
            return self.offset;
        }
        self.offset
            + self
                .shape
                .iter()
                .zip(self.strides.iter())
                .map(|(&dim, &s)| (dim - 1) * s)
                .sum::<usize>()
            + 1
    }

    /// Storage offset of a multi-index.
    pub fn offset_of(&self, indices: &[usize]) -> Result<usize, EngineError> {
        if indices.len() != self.ndim() {
            return Err(EngineError::WrongNumberOfIndices {
                expected: self.ndim(),
                actual: indices.len(),
            });
        }
        for (&idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return Err(EngineError::IndexOutOfBounds {
                    index: idx,
                    dim_size: dim,
                });
            }
        }
        Ok(self.offset + cartesian_to_linear(indices, &self.strides))
    }

    /// Iterate storage offsets in row-major element order.
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            shape: &self.shape,
            strides: &self.strides,
            index: SmallVec::from_elem(0, self.shape.len()),
            next: self.offset,
            remaining: self.len(),
        }
    }

    pub fn reshaped(&self, shape: &[usize]) -> Result<Self, EngineError> {
        if shape_len(shape) != self.len() {
            return Err(EngineError::shape("view", &self.shape, shape));
        }
        if !self.is_contiguous() {
            return Err(EngineError::InvalidOperation(
                "view requires a contiguous tensor".to_string(),
            ));
        }
        Ok(Self {
            shape: SmallVec::from_slice(shape),
            strides: compute_strides(shape),
            offset: self.offset,
        })
    }

    pub fn transposed(&self, dim0: usize, dim1: usize) -> Result<Self, EngineError> {
        let ndim = self.ndim();
        for dim in [dim0, dim1] {
            if dim >= ndim {
                return Err(EngineError::IndexOutOfBounds {
                    index: dim,
                    dim_size: ndim,
                });
            }
        }
        let mut out = self.clone();
        out.shape.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    pub fn narrowed(&self, dim: usize, start: usize, len: usize) -> Result<Self, EngineError> {
        if dim >= self.ndim() {
            return Err(EngineError::IndexOutOfBounds {
                index: dim,
                dim_size: self.ndim(),
            });
        }
        let size = self.shape[dim];
        if start + len > size {
            return Err(EngineError::IndexOutOfBounds {
                index: start + len,
                dim_size: size,
            });
        }
        let mut out = self.clone();
        out.shape[dim] = len;
        if len > 0 {
            out.offset += start * self.strides[dim];
        }
        Ok(out)
    }

    /// Broadcast extent-1 dimensions to `dims` with a zero stride.
    pub fn expanded(&self, dims: &[usize]) -> Result<Self, EngineError> {
        if dims.len() != self.ndim() {
            return Err(EngineError::RankMismatch {
                expected: self.ndim(),
                actual: dims.len(),
            });
        }
        let mut out = self.clone();
        for (i, (&from, &to)) in self.shape.iter().zip(dims.iter()).enumerate() {
            if from == to {
                continue;
            }
            if from != 1 {
                return Err(EngineError::shape("expand", &self.shape, dims));
            }
            out.shape[i] = to;
            out.strides[i] = 0;
        }
        Ok(out)
    }
}

/// Row-major iterator over the storage offsets of a [`Layout`].
pub struct Offsets<'a> {
    shape: &'a [usize],
    strides: &'a [usize],
    index: Dims,
    next: usize,
    remaining: usize,
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.remaining -= 1;
        if self.remaining > 0 {
            for d in (0..self.shape.len()).rev() {
                self.index[d] += 1;
                self.next += self.strides[d];
                if self.index[d] < self.shape[d] {
                    break;
                }
                self.next -= self.strides[d] * self.shape[d];
                self.index[d] = 0;
            }
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert_eq!(compute_strides(&[5]).as_slice(), &[1]);
    }

    #[test]
    fn test_linear_cartesian_roundtrip() {
        let shape = [2, 3, 4];
        let strides = compute_strides(&shape);
        for linear in 0..24 {
            let idx = linear_to_cartesian(linear, &shape);
            assert_eq!(cartesian_to_linear(&idx, &strides), linear);
        }
    }

    #[test]
    fn test_offsets_contiguous() {
        let layout = Layout::contiguous(&[2, 3]);
        let offsets: Vec<usize> = layout.offsets().collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);
        assert!(layout.is_contiguous());
    }

    #[test]
    fn test_offsets_transposed() {
        let layout = Layout::contiguous(&[2, 3]).transposed(0, 1).unwrap();
        assert_eq!(layout.shape(), &[3, 2]);
        let offsets: Vec<usize> = layout.offsets().collect();
        assert_eq!(offsets, vec![0, 3, 1, 4, 2, 5]);
        assert!(!layout.is_contiguous());
    }

    #[test]
    fn test_offsets_expanded() {
        let layout = Layout::contiguous(&[1, 3]).expanded(&[2, 3]).unwrap();
        assert!(layout.is_broadcast());
        let offsets: Vec<usize> = layout.offsets().collect();
        assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(layout.max_extent(), 3);
    }

    #[test]
    fn test_narrowed() {
        let layout = Layout::contiguous(&[4, 3]).narrowed(0, 1, 2).unwrap();
        assert_eq!(layout.offset(), 3);
        assert!(layout.is_contiguous());
        assert_eq!(layout.max_extent(), 9);

        let cols = Layout::contiguous(&[4, 3]).narrowed(1, 1, 1).unwrap();
        let offsets: Vec<usize> = cols.offsets().collect();
        assert_eq!(offsets, vec![1, 4, 7, 10]);

        assert!(Layout::contiguous(&[4, 3]).narrowed(0, 3, 2).is_err());
    }

    #[test]
    fn test_reshaped_checks_element_count() {
        let layout = Layout::contiguous(&[2, 3]);
        assert_eq!(layout.reshaped(&[3, 2]).unwrap().strides(), &[2, 1]);
        assert!(matches!(
            layout.reshaped(&[4, 2]),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_offset_of_bounds() {
        let layout = Layout::contiguous(&[2, 2]);
        assert_eq!(layout.offset_of(&[1, 1]).unwrap(), 3);
        assert!(matches!(
            layout.offset_of(&[2, 0]),
            Err(EngineError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            layout.offset_of(&[0]),
            Err(EngineError::WrongNumberOfIndices { .. })
        ));
    }

    #[test]
    fn test_scalar_layout() {
        let layout = Layout::contiguous(&[]);
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.offsets().collect::<Vec<_>>(), vec![0]);
    }
}
