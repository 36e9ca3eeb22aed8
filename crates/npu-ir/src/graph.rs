//! The non-intrusive op/buffer dataflow graph container.
//!
//! [`OpGraph`] records which buffers each op consumes and produces (and vice
//! versa) without the entities knowing they belong to a graph, so the same
//! entity can appear in several graphs at once; plans are assembled from
//! fragments and merged. [`OwnedOpGraph`] additionally owns the entities, so
//! a self-contained graph can be built, merged and dropped as a unit.
//!
//! Each op takes zero or more input buffers, each associated with an input
//! slot index, and produces at most one buffer. A buffer can be produced by
//! several ops (e.g. two DMAs each writing part of a concatenation result)
//! and consumed by several ops. Producers are ordered but not slot-numbered;
//! consumers keep insertion order, which carries meaning for multi-output
//! chunking.
//!
//! Every mutation validates its preconditions completely before touching any
//! state, so a failed call leaves the graph exactly as it was.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};

use smallvec::SmallVec;
use thiserror::Error;

use crate::buffer::{Buffer, BufferId};
use crate::op::{Op, OpId};

/// A consuming op together with the input slot it consumes through.
pub type Consumer = (OpId, u32);

/// Either side of the entity model, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Op(OpId),
    Buffer(BufferId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Op(id) => write!(f, "{id}"),
            EntityRef::Buffer(id) => write!(f, "{id}"),
        }
    }
}

/// Errors surfaced by the graph container. These are programmer-error
/// conditions: callers catch them at plan-construction granularity and
/// discard the offending candidate plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{0} has already been added to this graph")]
    DuplicateEntity(EntityRef),
    #[error("{0} is not part of this graph")]
    UnknownEntity(EntityRef),
    #[error("graph invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("{0} has multiple producers; use producers() instead")]
    AmbiguousProducer(BufferId),
}

fn unknown_op(op: OpId) -> GraphError {
    GraphError::UnknownEntity(EntityRef::Op(op))
}

fn unknown_buffer(buffer: BufferId) -> GraphError {
    GraphError::UnknownEntity(EntityRef::Buffer(buffer))
}

/// A graph of connected ops and buffers.
///
/// Stores connectivity only; entity data lives elsewhere (normally in an
/// [`OwnedOpGraph`]). All references are IDs, so there is nothing to dangle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OpGraph {
    /// All ops in the graph, in insertion order.
    ops: Vec<OpId>,
    /// All buffers in the graph, in insertion order.
    buffers: Vec<BufferId>,
    op_set: HashSet<OpId>,
    buffer_set: HashSet<BufferId>,
    /// For each buffer, the ops producing it (if any), in insertion order.
    producers: HashMap<BufferId, SmallVec<[OpId; 1]>>,
    /// For each buffer, the (op, input slot) pairs consuming it (if any), in
    /// insertion order.
    consumers: HashMap<BufferId, SmallVec<[Consumer; 2]>>,
    /// For each op, the buffer it produces (if any).
    op_output: HashMap<OpId, BufferId>,
    /// For each op, the buffers it consumes (if any), indexed by input slot.
    op_inputs: HashMap<OpId, SmallVec<[BufferId; 2]>>,
}

impl OpGraph {
    pub fn new() -> OpGraph {
        OpGraph::default()
    }

    /// Registers an op. The same op cannot be added twice.
    pub fn add_op(&mut self, op: OpId) -> Result<(), GraphError> {
        if !self.op_set.insert(op) {
            return Err(GraphError::DuplicateEntity(EntityRef::Op(op)));
        }
        self.ops.push(op);
        Ok(())
    }

    /// Registers a buffer. The same buffer cannot be added twice.
    pub fn add_buffer(&mut self, buffer: BufferId) -> Result<(), GraphError> {
        if !self.buffer_set.insert(buffer) {
            return Err(GraphError::DuplicateEntity(EntityRef::Buffer(buffer)));
        }
        self.buffers.push(buffer);
        Ok(())
    }

    pub fn contains_op(&self, op: OpId) -> bool {
        self.op_set.contains(&op)
    }

    pub fn contains_buffer(&self, buffer: BufferId) -> bool {
        self.buffer_set.contains(&buffer)
    }

    /// All ops, in insertion order.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// All buffers, in insertion order.
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    /// The ops producing `buffer`, possibly empty.
    pub fn producers(&self, buffer: BufferId) -> Result<&[OpId], GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        Ok(self
            .producers
            .get(&buffer)
            .map(|list| list.as_slice())
            .unwrap_or(&[]))
    }

    /// The single producer of `buffer`, or `None` if it has no producer.
    /// Errors with [`GraphError::AmbiguousProducer`] if there is more than
    /// one; callers that tolerate multiple producers must use
    /// [`OpGraph::producers`].
    pub fn single_producer(&self, buffer: BufferId) -> Result<Option<OpId>, GraphError> {
        let producers = self.producers(buffer)?;
        match producers {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            _ => Err(GraphError::AmbiguousProducer(buffer)),
        }
    }

    /// The (op, input slot) pairs consuming `buffer`, in insertion order.
    pub fn consumers(&self, buffer: BufferId) -> Result<&[Consumer], GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        Ok(self
            .consumers
            .get(&buffer)
            .map(|list| list.as_slice())
            .unwrap_or(&[]))
    }

    /// The buffers consumed by `op`, indexed by input slot. There are no
    /// gaps: slot `n` can only be connected once slots `0..n` are.
    pub fn inputs(&self, op: OpId) -> Result<&[BufferId], GraphError> {
        if !self.contains_op(op) {
            return Err(unknown_op(op));
        }
        Ok(self
            .op_inputs
            .get(&op)
            .map(|list| list.as_slice())
            .unwrap_or(&[]))
    }

    /// The buffer produced by `op`, if any.
    pub fn output(&self, op: OpId) -> Result<Option<BufferId>, GraphError> {
        if !self.contains_op(op) {
            return Err(unknown_op(op));
        }
        Ok(self.op_output.get(&op).copied())
    }

    /// Connects `producer` as the first producer of `buffer`. Fails if the
    /// buffer already has a producer; it must be disconnected first.
    pub fn set_producer(&mut self, buffer: BufferId, producer: OpId) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if !self.contains_op(producer) {
            return Err(unknown_op(producer));
        }
        if !self.producers(buffer)?.is_empty() {
            return Err(GraphError::InvariantViolation(
                "buffer already has a producer; it must be disconnected first",
            ));
        }
        if self.op_output.contains_key(&producer) {
            return Err(GraphError::InvariantViolation(
                "op already produces a buffer",
            ));
        }
        self.producers.entry(buffer).or_default().push(producer);
        self.op_output.insert(producer, buffer);
        Ok(())
    }

    /// Connects `producer` as an additional producer of `buffer`.
    pub fn add_producer(&mut self, buffer: BufferId, producer: OpId) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if !self.contains_op(producer) {
            return Err(unknown_op(producer));
        }
        if self.producers(buffer)?.contains(&producer) {
            return Err(GraphError::InvariantViolation(
                "op is already a producer of this buffer",
            ));
        }
        if self.op_output.contains_key(&producer) {
            return Err(GraphError::InvariantViolation(
                "op already produces a buffer",
            ));
        }
        self.producers.entry(buffer).or_default().push(producer);
        self.op_output.insert(producer, buffer);
        Ok(())
    }

    pub fn remove_producer(&mut self, buffer: BufferId, producer: OpId) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if !self.contains_op(producer) {
            return Err(unknown_op(producer));
        }
        let list = self
            .producers
            .get_mut(&buffer)
            .filter(|list| list.contains(&producer))
            .ok_or(GraphError::InvariantViolation(
                "op is not a producer of this buffer",
            ))?;
        list.retain(|p| *p != producer);
        self.op_output.remove(&producer);
        Ok(())
    }

    /// Disconnects every producer of `buffer`.
    pub fn clear_producers(&mut self, buffer: BufferId) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if let Some(list) = self.producers.remove(&buffer) {
            for producer in list {
                self.op_output.remove(&producer);
            }
        }
        Ok(())
    }

    /// Connects `buffer` as input number `slot` of `consumer`. Slots must be
    /// filled in order: connecting slot `n` requires slots `0..n` to already
    /// be connected, so no input is ever left dangling below a connected one.
    pub fn add_consumer(
        &mut self,
        buffer: BufferId,
        consumer: OpId,
        slot: u32,
    ) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if !self.contains_op(consumer) {
            return Err(unknown_op(consumer));
        }
        let connected = self.inputs(consumer)?.len() as u32;
        if slot < connected {
            return Err(GraphError::InvariantViolation(
                "op already consumes a buffer at this input slot; it must be disconnected first",
            ));
        }
        if slot > connected {
            return Err(GraphError::InvariantViolation(
                "cannot connect this input slot without connecting earlier slots first",
            ));
        }
        self.consumers
            .entry(buffer)
            .or_default()
            .push((consumer, slot));
        self.op_inputs.entry(consumer).or_default().push(buffer);
        Ok(())
    }

    /// Disconnects input `slot` of `consumer` from `buffer`. Only the last
    /// connected slot may be disconnected, as removing an earlier one would
    /// silently renumber the remaining inputs.
    pub fn remove_consumer(
        &mut self,
        buffer: BufferId,
        consumer: OpId,
        slot: u32,
    ) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }
        if !self.contains_op(consumer) {
            return Err(unknown_op(consumer));
        }
        if !self.consumers(buffer)?.contains(&(consumer, slot)) {
            return Err(GraphError::InvariantViolation(
                "op is not a consumer of this buffer at this input slot",
            ));
        }
        let connected = self.inputs(consumer)?.len() as u32;
        if slot + 1 != connected {
            return Err(GraphError::InvariantViolation(
                "cannot disconnect this input slot without disconnecting later slots first",
            ));
        }
        if let Some(list) = self.consumers.get_mut(&buffer) {
            let entry = (consumer, slot);
            if let Some(position) = list.iter().position(|c| *c == entry) {
                list.remove(position);
            }
        }
        if let Some(inputs) = self.op_inputs.get_mut(&consumer) {
            inputs.pop();
        }
        Ok(())
    }

    /// Removes `op` from the graph, then recursively removes any
    /// previously-connected neighbour left without input or output
    /// connections. On a linear graph this empties it; with branching, an
    /// entire branch disappears. This is the only bulk-removal primitive.
    pub fn remove_and_prune_op(&mut self, op: OpId) -> Result<(), GraphError> {
        if !self.contains_op(op) {
            return Err(unknown_op(op));
        }

        // Input side: disconnect (in reverse slot order, the only legal
        // order), then prune input buffers that lost their last consumer.
        let inputs: Vec<BufferId> = self.inputs(op)?.to_vec();
        for (slot, buffer) in inputs.iter().enumerate().rev() {
            self.remove_consumer(*buffer, op, slot as u32)?;
        }
        for buffer in &inputs {
            if self.contains_buffer(*buffer) && self.consumers(*buffer)?.is_empty() {
                self.remove_and_prune_buffer(*buffer)?;
            }
        }

        // Output side: disconnect, then prune the output buffer if this was
        // its last producer.
        if let Some(output) = self.output(op)? {
            self.remove_producer(output, op)?;
            if self.producers(output)?.is_empty() {
                self.remove_and_prune_buffer(output)?;
            }
        }

        self.op_set.remove(&op);
        self.ops.retain(|o| *o != op);
        self.op_inputs.remove(&op);
        self.op_output.remove(&op);
        Ok(())
    }

    /// Buffer counterpart of [`OpGraph::remove_and_prune_op`].
    pub fn remove_and_prune_buffer(&mut self, buffer: BufferId) -> Result<(), GraphError> {
        if !self.contains_buffer(buffer) {
            return Err(unknown_buffer(buffer));
        }

        // Producer side: disconnect all producers, then prune them (they have
        // lost their output connection).
        let producers: Vec<OpId> = self.producers(buffer)?.to_vec();
        for producer in &producers {
            self.remove_producer(buffer, *producer)?;
        }
        for producer in &producers {
            if self.contains_op(*producer) {
                self.remove_and_prune_op(*producer)?;
            }
        }

        // Consumer side: disconnect all consumers (later slots first), then
        // prune consumers left with no inputs at all.
        let mut consumers: Vec<Consumer> = self.consumers(buffer)?.to_vec();
        consumers.sort_by(|a, b| b.1.cmp(&a.1));
        for (consumer, slot) in &consumers {
            self.remove_consumer(buffer, *consumer, *slot)?;
        }
        for (consumer, _) in &consumers {
            if self.contains_op(*consumer) && self.inputs(*consumer)?.is_empty() {
                self.remove_and_prune_op(*consumer)?;
            }
        }

        self.buffer_set.remove(&buffer);
        self.buffers.retain(|b| *b != buffer);
        self.producers.remove(&buffer);
        self.consumers.remove(&buffer);
        Ok(())
    }

    /// Unions all entities and edges of `other` into this graph. This is a
    /// reference union: entities are shared, not copied, and must be disjoint
    /// from this graph's.
    pub fn merge(&mut self, other: &OpGraph) -> Result<(), GraphError> {
        for op in &other.ops {
            if self.contains_op(*op) {
                return Err(GraphError::DuplicateEntity(EntityRef::Op(*op)));
            }
        }
        for buffer in &other.buffers {
            if self.contains_buffer(*buffer) {
                return Err(GraphError::DuplicateEntity(EntityRef::Buffer(*buffer)));
            }
        }

        self.ops.extend(other.ops.iter().copied());
        self.buffers.extend(other.buffers.iter().copied());
        self.op_set.extend(other.op_set.iter().copied());
        self.buffer_set.extend(other.buffer_set.iter().copied());
        for (buffer, list) in &other.producers {
            self.producers.insert(*buffer, list.clone());
        }
        for (buffer, list) in &other.consumers {
            self.consumers.insert(*buffer, list.clone());
        }
        for (op, buffer) in &other.op_output {
            self.op_output.insert(*op, *buffer);
        }
        for (op, list) in &other.op_inputs {
            self.op_inputs.insert(*op, list.clone());
        }
        Ok(())
    }
}

/// An [`OpGraph`] that additionally owns its entities.
///
/// This is the type plan-construction code uses: entities added here live
/// exactly as long as the wrapper (pruned entities stay owned but become
/// unreachable through the API, mirroring how connectivity and storage are
/// separate concerns). Raw [`OpGraph`] is for algorithms that only manipulate
/// connectivity.
#[derive(Debug, Default)]
pub struct OwnedOpGraph {
    graph: OpGraph,
    ops: HashMap<OpId, Op>,
    buffers: HashMap<BufferId, Buffer>,
}

impl OwnedOpGraph {
    pub fn new() -> OwnedOpGraph {
        OwnedOpGraph::default()
    }

    /// Takes ownership of `op`, registers it and returns its identity.
    pub fn add_op(&mut self, op: Op) -> OpId {
        let id = OpId::fresh();
        // A fresh id cannot collide, so registration cannot fail.
        let _ = self.graph.add_op(id);
        self.ops.insert(id, op);
        id
    }

    /// Takes ownership of `buffer`, registers it and returns its identity.
    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferId {
        let id = BufferId::fresh();
        let _ = self.graph.add_buffer(id);
        self.buffers.insert(id, buffer);
        id
    }

    pub fn op(&self, id: OpId) -> Result<&Op, GraphError> {
        if !self.graph.contains_op(id) {
            return Err(unknown_op(id));
        }
        self.ops.get(&id).ok_or(unknown_op(id))
    }

    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Op, GraphError> {
        if !self.graph.contains_op(id) {
            return Err(unknown_op(id));
        }
        self.ops.get_mut(&id).ok_or(unknown_op(id))
    }

    pub fn buffer(&self, id: BufferId) -> Result<&Buffer, GraphError> {
        if !self.graph.contains_buffer(id) {
            return Err(unknown_buffer(id));
        }
        self.buffers.get(&id).ok_or(unknown_buffer(id))
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Result<&mut Buffer, GraphError> {
        if !self.graph.contains_buffer(id) {
            return Err(unknown_buffer(id));
        }
        self.buffers.get_mut(&id).ok_or(unknown_buffer(id))
    }

    /// Merges `other` into this graph, transferring ownership of its
    /// entities. Entity identities are globally unique, so two independently
    /// built graphs always merge cleanly; a duplicate means the same graph
    /// was merged twice.
    pub fn merge(&mut self, other: OwnedOpGraph) -> Result<(), GraphError> {
        self.graph.merge(&other.graph)?;
        self.ops.extend(other.ops);
        self.buffers.extend(other.buffers);
        Ok(())
    }

    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }
}

impl Deref for OwnedOpGraph {
    type Target = OpGraph;

    fn deref(&self) -> &OpGraph {
        &self.graph
    }
}

impl DerefMut for OwnedOpGraph {
    fn deref_mut(&mut self) -> &mut OpGraph {
        &mut self.graph
    }
}
