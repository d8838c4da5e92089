//! Computation graph: nodes, the recording tape and scopes.

mod compute;
mod node;
mod scope;
mod tape;

pub use compute::{ComputeGraph, GraphMode};
pub use node::{NodeRef, Parameter, WeightNode};
pub use scope::{ScopeId, SubgraphScope};
pub use tape::BackwardOp;
