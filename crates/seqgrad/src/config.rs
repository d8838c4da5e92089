//! Engine and graph configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, ProcessorKind};
use crate::dtype::DType;
use crate::error::EngineError;

fn default_device_ids() -> Vec<usize> {
    vec![0]
}

fn default_memory_usage_ratio() -> f64 {
    0.95
}

/// Device selection and memory policy for a [`Coordinator`](crate::Coordinator).
///
/// ```
/// use seqgrad::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{ "device_ids": [0, 1], "amp": true }"#).unwrap();
/// assert_eq!(config.device_ids, vec![0, 1]);
/// assert!((config.memory_usage_ratio - 0.95).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub processor: ProcessorKind,
    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<usize>,
    /// Fraction of `device_memory_bytes` the pool may reserve.
    #[serde(default = "default_memory_usage_ratio")]
    pub memory_usage_ratio: f64,
    /// Device capacity. `None` means the pool has no limit of its own.
    #[serde(default)]
    pub device_memory_bytes: Option<usize>,
    /// Store new tensors as 16-bit floats.
    #[serde(default)]
    pub amp: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorKind::default(),
            device_ids: default_device_ids(),
            memory_usage_ratio: default_memory_usage_ratio(),
            device_memory_bytes: None,
            amp: false,
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.device_ids.is_empty() {
            return Err(EngineError::Config("device_ids must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.device_ids.iter().find(|&&id| !seen.insert(id)) {
            return Err(EngineError::Config(format!("device id {dup} listed twice")));
        }
        if !(self.memory_usage_ratio > 0.0 && self.memory_usage_ratio <= 1.0) {
            return Err(EngineError::Config(format!(
                "memory_usage_ratio must be in (0, 1], got {}",
                self.memory_usage_ratio
            )));
        }
        Ok(())
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.device_ids.iter().map(|&id| DeviceId(id))
    }

    /// Byte limit of each device pool.
    pub fn pool_limit_bytes(&self) -> Option<usize> {
        self.device_memory_bytes
            .map(|bytes| (bytes as f64 * self.memory_usage_ratio) as usize)
    }

    pub fn dtype(&self) -> DType {
        if self.amp { DType::Float16 } else { DType::Float32 }
    }
}

/// Options of one [`ComputeGraph`](crate::ComputeGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphOptions {
    /// Record a tape for `backward()`. `false` builds an inference graph.
    pub needs_gradient: bool,
    /// Element type of tensors created by the graph. Defaults to the device's.
    pub dtype: Option<DType>,
    pub seed: Option<u64>,
    /// Zero the gradients of bound parameters when a replay starts.
    pub clear_parameter_gradients: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            needs_gradient: true,
            dtype: None,
            seed: None,
            clear_parameter_gradients: true,
        }
    }
}

impl GraphOptions {
    pub fn inference() -> Self {
        Self {
            needs_gradient: false,
            ..Self::default()
        }
    }
}
