//! Nested graph scopes with deterministic release.

use std::ops::{Deref, DerefMut};

use super::compute::ComputeGraph;

/// Identifier of a scope within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u64);

impl ScopeId {
    pub(crate) const ROOT: ScopeId = ScopeId(0);
}

/// A child scope of a [`ComputeGraph`].
///
/// Operations go through the scope (it dereferences to the graph). When the
/// scope drops, every node created in it is released, except nodes that were
/// [`unbind`](ComputeGraph::unbind)-ed. Nodes still needed by a pending
/// backward pass are hidden immediately and freed after the replay.
///
/// ```
/// use seqgrad::{ComputeGraph, DeviceContext, EngineError};
///
/// let mut graph = ComputeGraph::new(&DeviceContext::cpu(), false);
/// let x = graph.new_weight("x", &[2], 1.0, false).unwrap();
/// let y = {
///     let mut step = graph.create_subgraph("step");
///     let y = step.add_scalar(x, 1.0).unwrap();
///     step.unbind(y).unwrap();
///     step.mul_scalar(y, 2.0).unwrap()
/// };
/// assert!(matches!(graph.value(y), Err(EngineError::DisposedAccess { .. })));
/// assert_eq!(graph.get_weight_at(x, &[0]).unwrap(), 1.0);
/// ```
pub struct SubgraphScope<'g> {
    graph: &'g mut ComputeGraph,
    id: ScopeId,
}

impl<'g> SubgraphScope<'g> {
    pub(crate) fn new(graph: &'g mut ComputeGraph, id: ScopeId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn label(&self) -> &str {
        self.graph.scope_label(self.id)
    }
}

impl Deref for SubgraphScope<'_> {
    type Target = ComputeGraph;

    fn deref(&self) -> &ComputeGraph {
        self.graph
    }
}

impl DerefMut for SubgraphScope<'_> {
    fn deref_mut(&mut self) -> &mut ComputeGraph {
        self.graph
    }
}

impl Drop for SubgraphScope<'_> {
    fn drop(&mut self) {
        self.graph.close_scope(self.id);
    }
}
