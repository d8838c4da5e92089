//! Compute graph: eager forward execution with an append-only tape.
//!
//! Every catalog operation computes its result immediately and, when the
//! graph is recording and some input wants a gradient, appends a
//! [`BackwardOp`] to the tape. [`ComputeGraph::backward`] walks the tape in
//! reverse once, adds each contribution into the inputs' gradients and
//! clears it.
//!
//! ```text
//! Recording --backward()--> Replaying --tape cleared--> Recording
//! Inert (no tape, selected at construction)
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::{debug, trace};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::node::{NodeRef, Parameter, WeightNode};
use super::scope::{ScopeId, SubgraphScope};
use super::tape::{BackwardOp, TapeEntry};
use crate::config::GraphOptions;
use crate::device::{DeviceContext, ensure_same_device};
use crate::dtype::DType;
use crate::error::EngineError;
use crate::random::Init;
use crate::tensor::Tensor;

/// Execution mode of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphMode {
    /// Forward pass with gradients wanted.
    Recording,
    /// Inside `backward()`.
    Replaying,
    /// Inference: operations run forward-only and nothing is recorded.
    Inert,
}

#[derive(Debug)]
enum NodeBody {
    Owned(WeightNode),
    Shared(Parameter),
}

impl NodeBody {
    fn with<R>(&self, f: impl FnOnce(&WeightNode) -> R) -> R {
        match self {
            NodeBody::Owned(node) => f(node),
            NodeBody::Shared(param) => param.with(f),
        }
    }

    fn with_mut<R>(&mut self, f: impl FnOnce(&mut WeightNode) -> R) -> R {
        match self {
            NodeBody::Owned(node) => f(node),
            NodeBody::Shared(param) => param.with_mut(f),
        }
    }

    fn value(&self) -> Tensor {
        self.with(|n| n.value().clone())
    }

    fn gradient(&self) -> Option<Tensor> {
        self.with(|n| n.gradient().cloned())
    }
}

#[derive(Debug)]
struct NodeSlot {
    generation: u32,
    body: Option<NodeBody>,
    /// Released by its scope but still referenced by the tape.
    retired: bool,
    /// Unbound at the root: survives `release_intermediates`.
    pinned: bool,
    on_tape: bool,
    requires_grad: bool,
    scope: ScopeId,
    producer: Option<&'static str>,
    /// Loss output: starts the replay with a gradient of 1.
    seeds_gradient: bool,
    registered_name: Option<String>,
}

impl NodeSlot {
    fn vacant(scope: ScopeId) -> Self {
        Self {
            generation: 0,
            body: None,
            retired: false,
            pinned: false,
            on_tape: false,
            requires_grad: false,
            scope,
            producer: None,
            seeds_gradient: false,
            registered_name: None,
        }
    }

    fn holds(&self, node: NodeRef) -> bool {
        self.generation == node.generation && self.body.is_some()
    }
}

#[derive(Debug)]
struct ScopeFrame {
    id: ScopeId,
    label: String,
    nodes: Vec<NodeRef>,
}

fn disposed(node: NodeRef) -> EngineError {
    EngineError::DisposedAccess {
        what: node.to_string(),
    }
}

/// Records operations on one device and replays them in reverse.
pub struct ComputeGraph {
    device: DeviceContext,
    options: GraphOptions,
    dtype: DType,
    mode: GraphMode,
    slots: Vec<NodeSlot>,
    vacant: Vec<u32>,
    tape: Vec<TapeEntry>,
    consumed: bool,
    frames: Vec<ScopeFrame>,
    next_scope: u64,
    names: HashMap<String, NodeRef>,
    retired: Vec<NodeRef>,
    op_counter: u64,
    rng: StdRng,
}

impl fmt::Debug for ComputeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeGraph")
            .field("device", &self.device.id())
            .field("mode", &self.mode)
            .field("live_nodes", &self.live_nodes())
            .field("tape_len", &self.tape.len())
            .field("scope_depth", &self.scope_depth())
            .finish()
    }
}

impl ComputeGraph {
    /// Create a graph bound to `device`.
    ///
    /// `needs_gradient = false` builds an inert inference graph.
    pub fn new(device: &DeviceContext, needs_gradient: bool) -> Self {
        Self::with_options(
            device,
            GraphOptions {
                needs_gradient,
                ..GraphOptions::default()
            },
        )
    }

    pub fn with_options(device: &DeviceContext, options: GraphOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let root = ScopeId::ROOT;
        Self {
            device: device.clone(),
            dtype: options.dtype.unwrap_or(device.default_dtype()),
            mode: if options.needs_gradient {
                GraphMode::Recording
            } else {
                GraphMode::Inert
            },
            options,
            slots: Vec::new(),
            vacant: Vec::new(),
            tape: Vec::new(),
            consumed: false,
            frames: vec![ScopeFrame {
                id: root,
                label: "root".to_string(),
                nodes: Vec::new(),
            }],
            next_scope: root.0 + 1,
            names: HashMap::new(),
            retired: Vec::new(),
            op_counter: 0,
            rng,
        }
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    pub fn options(&self) -> &GraphOptions {
        &self.options
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Whether operations are being recorded (dropout is active).
    pub fn is_training(&self) -> bool {
        self.mode == GraphMode::Recording
    }

    pub fn tape_len(&self) -> usize {
        self.tape.len()
    }

    /// Nodes currently holding tensors, retired ones included.
    pub fn live_nodes(&self) -> usize {
        self.slots.iter().filter(|s| s.body.is_some()).count()
    }

    /// Number of open subgraph scopes.
    pub fn scope_depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    // ----- slot bookkeeping -------------------------------------------------

    fn slot(&self, node: NodeRef) -> Result<&NodeSlot, EngineError> {
        match self.slots.get(node.index as usize) {
            Some(slot) if slot.holds(node) && !slot.retired => Ok(slot),
            _ => Err(disposed(node)),
        }
    }

    fn slot_mut(&mut self, node: NodeRef) -> Result<&mut NodeSlot, EngineError> {
        match self.slots.get_mut(node.index as usize) {
            Some(slot) if slot.holds(node) && !slot.retired => Ok(slot),
            _ => Err(disposed(node)),
        }
    }

    fn body(&self, node: NodeRef) -> Result<&NodeBody, EngineError> {
        self.slot(node)?.body.as_ref().ok_or_else(|| disposed(node))
    }

    fn body_mut(&mut self, node: NodeRef) -> Result<&mut NodeBody, EngineError> {
        self.slot_mut(node)?.body.as_mut().ok_or_else(|| disposed(node))
    }

    /// Slot lookup for the replay, which may touch retired nodes.
    fn replay_slot_mut(&mut self, node: NodeRef) -> Option<&mut NodeSlot> {
        self.slots
            .get_mut(node.index as usize)
            .filter(|slot| slot.holds(node))
    }

    fn current_scope(&self) -> ScopeId {
        self.frames.last().map_or(ScopeId::ROOT, |f| f.id)
    }

    fn insert(
        &mut self,
        body: NodeBody,
        requires_grad: bool,
        producer: Option<&'static str>,
    ) -> NodeRef {
        let scope = self.current_scope();
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(NodeSlot::vacant(scope));
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let generation = slot.generation;
        *slot = NodeSlot {
            generation,
            body: Some(body),
            requires_grad,
            scope,
            producer,
            ..NodeSlot::vacant(scope)
        };
        let node = NodeRef { index, generation };
        if let Some(frame) = self.frames.last_mut() {
            frame.nodes.push(node);
        }
        node
    }

    fn unregister_name(&mut self, node: NodeRef) {
        let Some(slot) = self.slots.get_mut(node.index as usize) else {
            return;
        };
        if let Some(name) = slot.registered_name.take() {
            if self.names.get(&name) == Some(&node) {
                self.names.remove(&name);
            }
        }
    }

    /// Free a slot and return its body. Stale handles are ignored.
    fn vacate(&mut self, node: NodeRef) -> Option<NodeBody> {
        if !self.slots.get(node.index as usize)?.holds(node) {
            return None;
        }
        self.unregister_name(node);
        let slot = &mut self.slots[node.index as usize];
        let body = slot.body.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.retired = false;
        slot.pinned = false;
        slot.on_tape = false;
        slot.seeds_gradient = false;
        self.vacant.push(node.index);
        body
    }

    /// Hide a node from the client but keep it for the pending replay.
    fn retire(&mut self, node: NodeRef) {
        self.unregister_name(node);
        if let Some(slot) = self.replay_slot_mut(node) {
            slot.retired = true;
            self.retired.push(node);
        }
    }

    fn ensure_name_free(&self, name: &str) -> Result<(), EngineError> {
        if self.lookup(name).is_some() {
            return Err(EngineError::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn register_name(&mut self, node: NodeRef, name: String) {
        if let Some(slot) = self.slots.get_mut(node.index as usize) {
            slot.registered_name = Some(name.clone());
        }
        self.names.insert(name, node);
    }

    // ----- node factory -----------------------------------------------------

    /// Create a named weight filled with `fill`.
    pub fn new_weight(
        &mut self,
        name: &str,
        shape: &[usize],
        fill: f32,
        trainable: bool,
    ) -> Result<NodeRef, EngineError> {
        self.ensure_name_free(name)?;
        let value = Tensor::allocate(&self.device, shape, self.dtype)?;
        if fill != 0.0 {
            value.fill(fill)?;
        }
        self.add_named(WeightNode::new(name, value, trainable))
    }

    /// Create a named weight from row-major data.
    pub fn weight_from_vec(
        &mut self,
        name: &str,
        data: &[f32],
        shape: &[usize],
        trainable: bool,
    ) -> Result<NodeRef, EngineError> {
        self.ensure_name_free(name)?;
        let value = Tensor::allocate(&self.device, shape, self.dtype)?;
        value.copy_from_slice(data)?;
        self.add_named(WeightNode::new(name, value, trainable))
    }

    /// Create a named weight sampled from `init` with the graph's generator.
    pub fn init_weight(
        &mut self,
        name: &str,
        shape: &[usize],
        init: Init,
        trainable: bool,
    ) -> Result<NodeRef, EngineError> {
        let data = init.sample(shape, &mut self.rng)?;
        self.weight_from_vec(name, &data, shape, trainable)
    }

    /// Move an existing weight node into the graph.
    pub fn adopt(&mut self, node: WeightNode) -> Result<NodeRef, EngineError> {
        ensure_same_device(self.device.id(), node.device())?;
        self.ensure_name_free(node.name())?;
        self.add_named(node)
    }

    fn add_named(&mut self, node: WeightNode) -> Result<NodeRef, EngineError> {
        let name = node.name().to_string();
        let requires_grad = self.options.needs_gradient && node.trainable();
        let r = self.insert(NodeBody::Owned(node), requires_grad, None);
        self.register_name(r, name);
        Ok(r)
    }

    /// Make a persistent parameter available to the graph.
    ///
    /// Binding the same parameter again returns the cached node.
    pub fn bind(&mut self, param: &Parameter) -> Result<NodeRef, EngineError> {
        let name = param.name();
        if let Some(existing) = self.lookup(&name) {
            if let Ok(NodeBody::Shared(bound)) = self.body(existing) {
                if bound.ptr_eq(param) {
                    return Ok(existing);
                }
            }
            return Err(EngineError::DuplicateName { name });
        }
        ensure_same_device(self.device.id(), param.device())?;
        let requires_grad = self.options.needs_gradient && param.trainable();
        let r = self.insert(NodeBody::Shared(param.clone()), requires_grad, None);
        self.register_name(r, name);
        Ok(r)
    }

    // ----- access -----------------------------------------------------------

    /// Look up a live named weight or bound parameter.
    pub fn lookup(&self, name: &str) -> Option<NodeRef> {
        self.names
            .get(name)
            .copied()
            .filter(|&node| self.slot(node).is_ok())
    }

    pub fn is_alive(&self, node: NodeRef) -> bool {
        self.slot(node).is_ok()
    }

    /// Alias of the node's value tensor.
    pub fn value(&self, node: NodeRef) -> Result<Tensor, EngineError> {
        Ok(self.body(node)?.value())
    }

    /// Alias of the node's gradient, if one was allocated.
    pub fn gradient(&self, node: NodeRef) -> Result<Option<Tensor>, EngineError> {
        Ok(self.body(node)?.gradient())
    }

    pub fn shape(&self, node: NodeRef) -> Result<Vec<usize>, EngineError> {
        Ok(self.body(node)?.with(|n| n.shape().to_vec()))
    }

    pub fn name(&self, node: NodeRef) -> Result<String, EngineError> {
        Ok(self.body(node)?.with(|n| n.name().to_string()))
    }

    pub fn requires_grad(&self, node: NodeRef) -> Result<bool, EngineError> {
        Ok(self.slot(node)?.requires_grad)
    }

    /// The persistent parameter behind a bound node.
    pub fn parameter(&self, node: NodeRef) -> Result<Option<Parameter>, EngineError> {
        Ok(match self.body(node)? {
            NodeBody::Shared(param) => Some(param.clone()),
            NodeBody::Owned(_) => None,
        })
    }

    pub fn get_weight_at(&self, node: NodeRef, indices: &[usize]) -> Result<f32, EngineError> {
        self.value(node)?.get(indices)
    }

    /// Gradient element; an unallocated gradient reads as zero.
    pub fn get_gradient_at(&self, node: NodeRef, indices: &[usize]) -> Result<f32, EngineError> {
        let value = self.value(node)?;
        match self.gradient(node)? {
            Some(grad) => grad.get(indices),
            None => value.layout().offset_of(indices).map(|_| 0.0),
        }
    }

    pub fn set_weight_at(&mut self, node: NodeRef, indices: &[usize], v: f32) -> Result<(), EngineError> {
        self.value(node)?.set(indices, v)
    }

    /// Overwrite the node's gradient with a copy of `grad`.
    pub fn set_gradient(&mut self, node: NodeRef, grad: &Tensor) -> Result<(), EngineError> {
        ensure_same_device(self.device.id(), grad.device())?;
        self.body_mut(node)?.with_mut(|n| n.set_gradient(grad))
    }

    pub fn set_gradient_from_slice(&mut self, node: NodeRef, data: &[f32]) -> Result<(), EngineError> {
        self.body_mut(node)?
            .with_mut(|n| n.gradient_or_zeros()?.copy_from_slice(data))
    }

    /// Seed the node's gradient with a copy of its own value.
    pub fn copy_weights_to_gradients(&mut self, node: NodeRef) -> Result<(), EngineError> {
        self.body_mut(node)?.with_mut(|n| {
            let value = n.value().clone();
            n.set_gradient(&value)
        })
    }

    pub(crate) fn mark_loss(&mut self, node: NodeRef) -> Result<(), EngineError> {
        self.slot_mut(node)?.seeds_gradient = true;
        Ok(())
    }

    /// Input of the recorded softmax that produced `probs`, if any.
    pub(crate) fn softmax_input(&self, probs: NodeRef) -> Option<NodeRef> {
        let entry = self.tape.iter().rev().find(|e| e.output == probs)?;
        if entry.op.name() != "softmax" {
            return None;
        }
        entry.op.inputs().first().copied().filter(|&x| self.is_alive(x))
    }

    // ----- lifecycle --------------------------------------------------------

    /// Keep a node alive past its scope.
    ///
    /// The node moves to the enclosing scope; at the root it is pinned
    /// against [`release_intermediates`](Self::release_intermediates).
    pub fn unbind(&mut self, node: NodeRef) -> Result<(), EngineError> {
        let scope = self.slot(node)?.scope;
        let position = self.frames.iter().position(|f| f.id == scope);
        match position {
            Some(i) if i > 0 => {
                let parent = &mut self.frames[i - 1];
                parent.nodes.push(node);
                let parent_id = parent.id;
                self.slot_mut(node)?.scope = parent_id;
            }
            _ => self.slot_mut(node)?.pinned = true,
        }
        Ok(())
    }

    /// Move a node out of the graph entirely.
    pub fn take(&mut self, node: NodeRef) -> Result<WeightNode, EngineError> {
        if let NodeBody::Shared(param) = self.body(node)? {
            return Err(EngineError::InvalidOperation(format!(
                "bound parameter '{}' cannot be taken out of a graph",
                param.name()
            )));
        }
        match self.vacate(node) {
            Some(NodeBody::Owned(weight)) => Ok(weight),
            _ => Err(disposed(node)),
        }
    }

    /// Release a node now. Nodes the tape still needs stay hidden until the replay.
    pub fn dispose(&mut self, node: NodeRef) -> Result<(), EngineError> {
        let on_tape = self.slot(node)?.on_tape;
        if self.mode == GraphMode::Recording && on_tape {
            self.retire(node);
        } else {
            self.vacate(node);
        }
        Ok(())
    }

    /// Drop the tape and every node that is neither pinned nor a bound parameter.
    pub fn release_intermediates(&mut self) {
        self.tape.clear();
        self.consumed = false;
        self.retired.clear();

        let doomed: Vec<NodeRef> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let body = slot.body.as_ref()?;
                let keep = !slot.retired && (slot.pinned || matches!(body, NodeBody::Shared(_)));
                (!keep).then_some(NodeRef {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect();
        for &node in &doomed {
            self.vacate(node);
        }

        for slot in &mut self.slots {
            slot.on_tape = false;
            slot.seeds_gradient = false;
        }
        let slots = &self.slots;
        for frame in &mut self.frames {
            frame.nodes.retain(|n| {
                slots
                    .get(n.index as usize)
                    .is_some_and(|slot| slot.holds(*n))
            });
        }
        debug!("released {} intermediate nodes", doomed.len());
    }

    // ----- scopes -----------------------------------------------------------

    /// Open a nested scope. Nodes created through it are released when it
    /// drops, unless unbound.
    pub fn create_subgraph(&mut self, label: &str) -> SubgraphScope<'_> {
        let id = ScopeId(self.next_scope);
        self.next_scope += 1;
        self.frames.push(ScopeFrame {
            id,
            label: label.to_string(),
            nodes: Vec::new(),
        });
        debug!("open subgraph '{label}' at depth {}", self.scope_depth());
        SubgraphScope::new(self, id)
    }

    pub(crate) fn scope_label(&self, id: ScopeId) -> &str {
        self.frames
            .iter()
            .find(|f| f.id == id)
            .map_or("", |f| f.label.as_str())
    }

    pub(crate) fn close_scope(&mut self, id: ScopeId) {
        let Some(position) = self.frames.iter().rposition(|f| f.id == id) else {
            return;
        };
        if position == 0 {
            return;
        }
        let closing = self.frames.split_off(position);
        let keep_for_tape = self.mode == GraphMode::Recording;

        for frame in closing.into_iter().rev() {
            let (mut released, mut retired) = (0usize, 0usize);
            for node in frame.nodes {
                let Some(slot) = self.slots.get(node.index as usize) else {
                    continue;
                };
                if !slot.holds(node) || slot.retired || slot.scope != frame.id {
                    continue;
                }
                if keep_for_tape && slot.on_tape {
                    self.retire(node);
                    retired += 1;
                } else {
                    self.vacate(node);
                    released += 1;
                }
            }
            debug!(
                "closed subgraph '{}': released {released} nodes, retired {retired}",
                frame.label
            );
        }
    }

    // ----- tape -------------------------------------------------------------

    /// Whether an operation over `inputs` must be recorded.
    pub(crate) fn tracks(&self, inputs: &[NodeRef]) -> Result<bool, EngineError> {
        let mut track = false;
        for &input in inputs {
            track |= self.slot(input)?.requires_grad;
        }
        Ok(track && self.mode == GraphMode::Recording)
    }

    /// Add an operation result to the graph, recording `backward` if needed.
    pub(crate) fn push_op<B, F>(
        &mut self,
        op: &'static str,
        value: Tensor,
        inputs: &[NodeRef],
        backward: F,
    ) -> Result<NodeRef, EngineError>
    where
        B: BackwardOp + 'static,
        F: FnOnce() -> B,
    {
        ensure_same_device(self.device.id(), value.device())?;
        let track = self.tracks(inputs)?;
        self.op_counter += 1;
        let name = format!("{op}#{}", self.op_counter);
        let node = self.insert(
            NodeBody::Owned(WeightNode::new(name, value, false)),
            track,
            Some(op),
        );
        if track {
            let op: Box<dyn BackwardOp> = Box::new(backward());
            for input in op.inputs() {
                if let Some(slot) = self.replay_slot_mut(input) {
                    slot.on_tape = true;
                }
            }
            if let Some(slot) = self.replay_slot_mut(node) {
                slot.on_tape = true;
            }
            trace!("recorded {} as {node}", op.name());
            self.tape.push(TapeEntry { output: node, op });
            self.consumed = false;
        }
        Ok(node)
    }

    /// Replay the tape in reverse and accumulate gradients into its inputs.
    ///
    /// Every recorded operation whose output holds a gradient propagates it.
    /// Loss outputs that nothing consumed start with a gradient of 1; callers
    /// may seed any other node with [`set_gradient`](Self::set_gradient).
    /// Leaf weights start each replay from zero; bound parameters do too
    /// unless [`GraphOptions::clear_parameter_gradients`] is off.
    ///
    /// # Errors
    ///
    /// - `NotRecording` on an inference graph
    /// - `TapeConsumed` when called again without a new forward pass
    pub fn backward(&mut self) -> Result<(), EngineError> {
        match self.mode {
            GraphMode::Inert => return Err(EngineError::NotRecording),
            GraphMode::Replaying => {
                return Err(EngineError::InvalidOperation(
                    "backward() called during a replay".to_string(),
                ));
            }
            GraphMode::Recording => {}
        }
        if self.tape.is_empty() {
            return if self.consumed {
                Err(EngineError::TapeConsumed)
            } else {
                Ok(())
            };
        }

        self.mode = GraphMode::Replaying;
        let tape = std::mem::take(&mut self.tape);
        debug!("replaying {} operations on {}", tape.len(), self.device.id());

        let result = self
            .clear_leaf_gradients()
            .and_then(|()| self.seed_losses(&tape))
            .and_then(|()| self.replay(&tape));
        drop(tape);
        self.finish_replay();
        result
    }

    /// Zero the gradients of leaf weights, and of bound parameters unless
    /// the options keep those accumulating.
    fn clear_leaf_gradients(&mut self) -> Result<(), EngineError> {
        let clear_params = self.options.clear_parameter_gradients;
        for slot in &mut self.slots {
            let leaf = slot.producer.is_none();
            match &mut slot.body {
                Some(NodeBody::Shared(param)) if clear_params => {
                    param.with_mut(|n| n.clear_gradient())?;
                }
                Some(NodeBody::Owned(node)) if leaf => node.clear_gradient()?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Give every loss output that no later operation consumed a gradient of 1,
    /// unless the caller already set one.
    fn seed_losses(&mut self, tape: &[TapeEntry]) -> Result<(), EngineError> {
        let consumed: HashSet<NodeRef> = tape.iter().flat_map(|e| e.op.inputs()).collect();
        for entry in tape {
            if consumed.contains(&entry.output) {
                continue;
            }
            let Some(slot) = self.replay_slot_mut(entry.output) else {
                continue;
            };
            if !slot.seeds_gradient {
                continue;
            }
            if let Some(body) = slot.body.as_mut() {
                body.with_mut(|n| -> Result<(), EngineError> {
                    if n.gradient().is_none() {
                        n.gradient_or_zeros()?.fill(1.0)?;
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    fn replay(&mut self, tape: &[TapeEntry]) -> Result<(), EngineError> {
        for entry in tape.iter().rev() {
            let Some(slot) = self.replay_slot_mut(entry.output) else {
                continue;
            };
            let Some(grad) = slot.body.as_ref().and_then(NodeBody::gradient) else {
                continue;
            };

            for (input, contribution) in entry.op.backward(&grad)? {
                let Some(slot) = self.replay_slot_mut(input) else {
                    continue;
                };
                if !slot.requires_grad {
                    continue;
                }
                if let Some(body) = slot.body.as_mut() {
                    body.with_mut(|n| n.accumulate_gradient(&contribution))?;
                }
            }
        }
        Ok(())
    }

    fn finish_replay(&mut self) {
        self.mode = GraphMode::Recording;
        self.consumed = true;
        for slot in &mut self.slots {
            slot.on_tape = false;
            slot.seeds_gradient = false;
        }
        let retired = std::mem::take(&mut self.retired);
        let count = retired.len();
        for node in retired {
            self.vacate(node);
        }
        if count > 0 {
            debug!("released {count} retired nodes after replay");
        }
    }
}
