//! Weight initialisation and dropout masks.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How a new weight is filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Init {
    Zeros,
    Constant { value: f32 },
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std: f32 },
    /// Glorot uniform over `±sqrt(6 / (fan_in + fan_out))`.
    Xavier,
}

impl Init {
    /// Sample `product(shape)` values.
    pub fn sample<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f32>, EngineError> {
        let len: usize = shape.iter().product();
        let values = match *self {
            Init::Zeros => vec![0.0; len],
            Init::Constant { value } => vec![value; len],
            Init::Uniform { low, high } => {
                if !(low < high) {
                    return Err(EngineError::InvalidOperation(format!(
                        "uniform init needs low < high, got {low}..{high}"
                    )));
                }
                uniform(len, low, high, rng)
            }
            Init::Normal { mean, std } => {
                if !(std >= 0.0) {
                    return Err(EngineError::InvalidOperation(format!(
                        "normal init needs a non-negative std, got {std}"
                    )));
                }
                (0..len)
                    .map(|_| mean + std * rng.sample::<f32, _>(StandardNormal))
                    .collect()
            }
            Init::Xavier => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                uniform(len, -limit, limit, rng)
            }
        };
        Ok(values)
    }
}

fn uniform<R: Rng>(len: usize, low: f32, high: f32, rng: &mut R) -> Vec<f32> {
    (0..len)
        .map(|_| low + (high - low) * rng.sample::<f32, _>(StandardUniform))
        .collect()
}

fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [rows, .., cols] => (*rows, *cols),
    }
}

/// Inverted dropout mask: `0` with probability `ratio`, else `1 / (1 - ratio)`.
pub fn dropout_mask<R: Rng>(len: usize, ratio: f32, rng: &mut R) -> Vec<f32> {
    let keep = 1.0 - ratio;
    (0..len)
        .map(|_| {
            if rng.sample::<f32, _>(StandardUniform) < ratio {
                0.0
            } else {
                1.0 / keep
            }
        })
        .collect()
}
