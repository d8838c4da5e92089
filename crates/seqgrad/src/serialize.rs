//! Persisted-model container: named tensors in the safetensors format.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};

use crate::error::EngineError;
use crate::tensor::Tensor;

/// Shape and row-major contents of one saved tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Named raw tensors, keyed by the unique weight name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStore {
    entries: BTreeMap<String, StoredTensor>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&StoredTensor> {
        self.entries.get(name)
    }

    /// Snapshot `tensor` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: &str, tensor: &Tensor) -> Result<(), EngineError> {
        let stored = StoredTensor {
            shape: tensor.shape().to_vec(),
            data: tensor.to_vec()?,
        };
        self.entries.insert(name.to_string(), stored);
        Ok(())
    }

    /// The entry `name`, provided it was recorded with `shape`.
    ///
    /// # Errors
    ///
    /// `ParameterNotFound` if the entry is missing, `ShapeMismatch` if the
    /// recorded shape differs.
    pub fn check(&self, name: &str, shape: &[usize]) -> Result<&StoredTensor, EngineError> {
        let stored = self
            .entries
            .get(name)
            .ok_or_else(|| EngineError::ParameterNotFound {
                name: name.to_string(),
            })?;
        if stored.shape != shape {
            return Err(EngineError::shape("restore", shape, &stored.shape));
        }
        Ok(stored)
    }

    /// Copy the entry `name` into `target`. Fails like [`check`](Self::check).
    pub fn restore_into(&self, name: &str, target: &Tensor) -> Result<(), EngineError> {
        let stored = self.check(name, target.shape())?;
        target.copy_from_slice(&stored.data)
    }

    /// Encode as safetensors bytes (little-endian `F32`).
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let views = self
            .entries
            .iter()
            .map(|(name, t)| {
                let view = TensorView::new(Dtype::F32, t.shape.clone(), bytemuck::cast_slice(&t.data))?;
                Ok((name.as_str(), view))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        Ok(safetensors::serialize(views.iter().map(|(n, v)| (*n, v)), &None)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut entries = BTreeMap::new();
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(EngineError::InvalidOperation(format!(
                    "tensor '{name}' has element type {:?}, expected F32",
                    view.dtype()
                )));
            }
            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let stored = StoredTensor {
                shape: view.shape().to_vec(),
                data,
            };
            entries.insert(name, stored);
        }
        Ok(Self { entries })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()?)?;
        debug!("saved {} tensors to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let store = Self::from_bytes(&std::fs::read(path)?)?;
        debug!("loaded {} tensors from {}", store.len(), path.display());
        Ok(store)
    }
}
