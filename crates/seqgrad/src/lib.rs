//! seqgrad - reverse-mode autodiff tensor engine for sequence-to-sequence networks
//!
//! Tensors are strided views over buffers drawn from a per-device pool.
//! A [`ComputeGraph`] executes operations eagerly and records a tape that
//! `backward()` replays once in reverse. Subgraph scopes bound the lifetime
//! of per-step intermediates, and a [`Coordinator`] runs the same network on
//! several devices and aggregates gradients.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Network units (modules), Coordinator (parallel), decode loop
//!     → FeedForward, Normalization, Embedding, run_steps
//!
//! Level 2: Differentiable graph operations (ops on ComputeGraph)
//!     → add, matmul, softmax, layer_norm, cross_entropy_loss, ...
//!
//! Level 3: Device kernels (operations) over pooled buffers (storage)
//!     → faer GEMM, row kernels, DeviceAllocator
//! ```
//!
//! # Example
//!
//! ```
//! use seqgrad::{ComputeGraph, DeviceContext};
//!
//! let ctx = DeviceContext::cpu();
//! let mut graph = ComputeGraph::new(&ctx, true);
//!
//! let logits = graph
//!     .weight_from_vec("logits", &[2.0, 1.0, 0.1, 0.5, 2.5, 0.3], &[2, 3], true)
//!     .unwrap();
//! let probs = graph.softmax(logits).unwrap();
//! let loss = graph.cross_entropy_loss(probs, &[0, 1], true).unwrap();
//! assert!(graph.get_weight_at(loss, &[0]).unwrap() > 0.0);
//!
//! graph.backward().unwrap();
//! // d loss / d logits = (p - onehot) / batch
//! assert!(graph.get_gradient_at(logits, &[0, 0]).unwrap() < 0.0);
//! assert!(graph.get_gradient_at(logits, &[0, 1]).unwrap() > 0.0);
//! ```

pub mod config;
pub mod decode;
pub mod device;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod modules;
pub mod operations;
pub mod parallel;
pub mod random;
pub mod serialize;
pub mod storage;
pub mod strides;
pub mod tensor;

mod ops;

pub use config::{EngineConfig, GraphOptions};
pub use decode::{DecodeReport, RunStatus, run_steps};
pub use device::{DeviceContext, DeviceId, ProcessorKind};
pub use dtype::DType;
pub use error::EngineError;
pub use graph::{
    BackwardOp, ComputeGraph, GraphMode, NodeRef, Parameter, ScopeId, SubgraphScope, WeightNode,
};
pub use modules::{
    Activation, Embedding, FeedForward, Module, NeuralUnit, NormKind, Normalization, UnitInput,
};
pub use parallel::{AggregateKind, Coordinator, Replicated, ShardOutcome};
pub use random::Init;
pub use serialize::{ModelStore, StoredTensor};
pub use storage::{AllocatorStats, Buffer, BufferHandle, DeviceAllocator};
pub use tensor::Tensor;
