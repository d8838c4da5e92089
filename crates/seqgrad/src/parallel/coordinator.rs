//! Data-parallel execution over the configured devices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use log::{info, warn};

use crate::config::EngineConfig;
use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::graph::Parameter;
use crate::modules::NeuralUnit;

/// Result of one device's shard of a parallel step.
#[derive(Debug)]
pub enum ShardOutcome<T> {
    Completed(T),
    /// The shard ran out of device memory and contributes nothing.
    OutOfMemory(EngineError),
}

impl<T> ShardOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, ShardOutcome::Completed(_))
    }

    pub fn completed(&self) -> Option<&T> {
        match self {
            ShardOutcome::Completed(value) => Some(value),
            ShardOutcome::OutOfMemory(_) => None,
        }
    }
}

/// How per-device gradients are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateKind {
    #[default]
    Sum,
    /// Sum divided by the number of contributing devices.
    Mean,
}

/// Owns one device context per configured device.
#[derive(Debug)]
pub struct Coordinator {
    config: EngineConfig,
    devices: Vec<DeviceContext>,
    cursor: AtomicUsize,
}

impl Coordinator {
    /// Validate `config` and create a pool for every device id.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let limit = config.pool_limit_bytes();
        let dtype = config.dtype();
        let devices: Vec<DeviceContext> = config
            .devices()
            .map(|id| DeviceContext::new(id, config.processor, limit).with_dtype(dtype))
            .collect();
        info!(
            "coordinator started: {} {:?} device(s), pool limit {:?} bytes, {:?}",
            devices.len(),
            config.processor,
            limit,
            dtype
        );
        Ok(Self {
            config: config.clone(),
            devices,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn devices(&self) -> &[DeviceContext] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&DeviceContext> {
        self.devices.get(index)
    }

    /// Next device in round-robin order, for placing new unit instances.
    pub fn next_device(&self) -> &DeviceContext {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.devices.len();
        &self.devices[index]
    }

    /// Clone `prototype` onto every device. Replica `i` lives on device `i`.
    pub fn replicate<M: NeuralUnit>(&self, prototype: &M) -> Result<Replicated<M>, EngineError> {
        let replicas = self
            .devices
            .iter()
            .map(|device| prototype.clone_to_device(device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Replicated { replicas })
    }

    /// Run `work` once per device on its own thread and wait for all of them.
    ///
    /// A shard failing with `OutOfMemory` is reported as
    /// [`ShardOutcome::OutOfMemory`]; any other error, or a panic, fails the
    /// whole step once every worker has finished.
    pub fn run_parallel<T, F>(&self, work: F) -> Result<Vec<ShardOutcome<T>>, EngineError>
    where
        T: Send,
        F: Fn(usize, &DeviceContext) -> Result<T, EngineError> + Sync,
    {
        let results: Vec<thread::Result<Result<T, EngineError>>> = thread::scope(|s| {
            let work = &work;
            let handles: Vec<_> = self
                .devices
                .iter()
                .enumerate()
                .map(|(index, device)| s.spawn(move || work(index, device)))
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut outcomes = Vec::with_capacity(results.len());
        let mut fatal = None;
        for (device, result) in self.devices.iter().zip(results) {
            match result {
                Ok(Ok(value)) => outcomes.push(ShardOutcome::Completed(value)),
                Ok(Err(err)) if err.is_out_of_memory() => {
                    warn!("{}: shard dropped from this step: {err}", device.id());
                    outcomes.push(ShardOutcome::OutOfMemory(err));
                }
                Ok(Err(err)) => {
                    fatal.get_or_insert(err);
                }
                Err(_) => {
                    fatal.get_or_insert(EngineError::WorkerPanicked { device: device.id() });
                }
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Release every cached block and log the final pool statistics.
    pub fn teardown(&self) {
        for device in &self.devices {
            let stats = device.allocator().stats();
            device.allocator().reset();
            info!(
                "{}: {} allocations, {} reuses, peak {} bytes reserved, {} live buffers",
                device.id(),
                stats.device_allocations,
                stats.reuses,
                stats.peak_bytes_reserved,
                stats.live_buffers
            );
        }
    }
}

/// One replica of a unit per device; replica 0 is the primary.
#[derive(Debug)]
pub struct Replicated<M> {
    replicas: Vec<M>,
}

impl<M: NeuralUnit> Replicated<M> {
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn get_on_device(&self, index: usize) -> Result<&M, EngineError> {
        self.replicas.get(index).ok_or(EngineError::IndexOutOfBounds {
            index,
            dim_size: self.replicas.len(),
        })
    }

    pub fn primary(&self) -> Result<&M, EngineError> {
        self.get_on_device(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.replicas.iter()
    }

    /// Combine the gradients of completed shards into the primary replica.
    ///
    /// Parameters are matched by name. A replica whose parameter has no
    /// gradient contributes zeros. Returns the number of contributing shards;
    /// with none, the primary's gradients are left untouched.
    pub fn aggregate_gradients<T>(
        &self,
        outcomes: &[ShardOutcome<T>],
        kind: AggregateKind,
    ) -> Result<usize, EngineError> {
        if outcomes.len() != self.replicas.len() {
            return Err(EngineError::InvalidOperation(format!(
                "{} shard outcomes for {} replicas",
                outcomes.len(),
                self.replicas.len()
            )));
        }
        let mut contributing = Vec::new();
        for (index, (replica, outcome)) in self.replicas.iter().zip(outcomes).enumerate() {
            match outcome {
                ShardOutcome::Completed(_) => contributing.push(by_name(replica.parameters())),
                ShardOutcome::OutOfMemory(err) => {
                    warn!("replica {index} skipped in gradient aggregation: {err}");
                }
            }
        }
        if contributing.is_empty() {
            warn!("no shard completed; gradients not aggregated");
            return Ok(0);
        }

        let primary = self.primary()?;
        for param in primary.parameters() {
            let name = param.name();
            let mut total = vec![0.0f32; param.value().len()];
            for params in &contributing {
                let replica_param = params
                    .get(&name)
                    .ok_or_else(|| EngineError::ParameterNotFound { name: name.clone() })?;
                let Some(grad) = replica_param.gradient() else {
                    continue;
                };
                let values = grad.to_vec()?;
                if values.len() != total.len() {
                    return Err(EngineError::shape("aggregate_gradients", &[total.len()], &[values.len()]));
                }
                for (t, v) in total.iter_mut().zip(values) {
                    *t += v;
                }
            }
            if kind == AggregateKind::Mean {
                let n = contributing.len() as f32;
                total.iter_mut().for_each(|t| *t /= n);
            }
            param.with_mut(|node| node.gradient_or_zeros()?.copy_from_slice(&total))?;
        }
        Ok(contributing.len())
    }

    /// Copy every primary parameter value to the other replicas.
    pub fn broadcast_weights(&self) -> Result<(), EngineError> {
        let primary = self.primary()?.parameters();
        for replica in self.replicas.iter().skip(1) {
            let params = by_name(replica.parameters());
            for source in &primary {
                let name = source.name();
                let target = params
                    .get(&name)
                    .ok_or_else(|| EngineError::ParameterNotFound { name: name.clone() })?;
                target.value().copy_from_slice(&source.value().to_vec()?)?;
            }
        }
        Ok(())
    }
}

fn by_name(params: Vec<Parameter>) -> HashMap<String, Parameter> {
    params.into_iter().map(|p| (p.name(), p)).collect()
}
