//! Element types.
//!
//! Values are always computed in `f32`. A `Float16` tensor rounds every
//! stored value through IEEE half precision, which is what an AMP run
//! observes on a device that stores activations in 16 bits.

use half::f16;
use serde::{Deserialize, Serialize};

/// Storage element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Float32,
    Float16,
}

impl DType {
    /// Element width in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float16 => 2,
        }
    }

    /// Round a value to what this element type can store.
    #[inline]
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            DType::Float32 => value,
            DType::Float16 => f16::from_f32(value).to_f32(),
        }
    }

    pub fn quantize_slice(self, data: &mut [f32]) {
        if self == DType::Float16 {
            for x in data.iter_mut() {
                *x = f16::from_f32(*x).to_f32();
            }
        }
    }
}
