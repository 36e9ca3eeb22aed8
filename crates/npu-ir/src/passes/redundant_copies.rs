//! Redundant-copy elimination.
//!
//! Combining independently chosen plans (in particular for reshape, concat
//! and split) can leave sequences of DMAs that copy the same data in and out
//! of SRAM several times. Each such chain collectively moves one logical
//! tensor (or a declared sub-region of it) between an SRAM buffer and a DRAM
//! buffer, and can be replaced by a single copy when that is representable,
//! leaving the NPU less work to do.
//!
//! The optimisation runs as two complementary halves, because the legality
//! and offset-accumulation rules differ by direction and these are the only
//! two shapes that occur in practice:
//!
//! - SRAM → DRAM chains (e.g. concat):
//!
//! ```text
//!  a (Sram)  b (Sram)                                  a (Sram)  b (Sram)
//!     |          |                                        |          |
//!     C          D                                        C          D
//!      \        /                                          \         |
//!        e (Dram)       f (Sram)                            \        |    f (Sram)
//!           |              |                 =>              \       |       |
//!           G              |                                  \      |       |
//!        j (Sram)          |                                   \     |       |
//!           |              |                                    \    |       H
//!           K              H                                     \   |      /
//!             \           /                                        i (Dram)
//!                i (Dram)
//! ```
//!
//! - DRAM → SRAM chains (e.g. split), the mirror image of the above.
//!
//! (Capital letters are DMAs, lowercase letters are buffers.)

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::buffer::{Buffer, BufferId, Location};
use crate::graph::{GraphError, OpGraph, OwnedOpGraph};
use crate::op::OpId;
use crate::passes::{GraphPass, PassContext, PassResult};
use crate::placement::PlacementRule;
use crate::shape::TensorShape;

/// Raised only if the pass's own bookkeeping put a non-copy op in a chain.
const NOT_A_COPY: GraphError =
    GraphError::InvariantViolation("copy chain references an op that is not a DMA");

/// Replaces chains of DMAs that copy data into and out of SRAM multiple
/// times with a single equivalent copy. See the module docs for the shapes
/// this recognises.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedundantCopyElimination;

impl GraphPass for RedundantCopyElimination {
    fn name(&self) -> &'static str {
        "redundant-copy-elimination"
    }

    fn run(
        &self,
        graph: &mut OwnedOpGraph,
        cx: &PassContext<'_>,
    ) -> Result<PassResult, GraphError> {
        let entities_before = graph.ops().len() + graph.buffers().len();

        let collapsed_down = collapse_sram_to_dram(graph, cx.placement)?;
        let collapsed_up = collapse_dram_to_sram(graph, cx.placement)?;
        let chains_collapsed = collapsed_down + collapsed_up;

        let entities_after = graph.ops().len() + graph.buffers().len();
        let result = PassResult {
            changed: chains_collapsed > 0,
            chains_collapsed,
            entities_removed: entities_before - entities_after,
        };
        debug!(
            chains = result.chains_collapsed,
            removed = result.entities_removed,
            "redundant copy elimination finished"
        );
        Ok(result)
    }
}

/// All buffers in the graph, sorted topologically from inputs to outputs.
///
/// DFS post-order over incoming edges, starting from the consumer-less
/// buffers (the graph outputs). Plan graphs are acyclic, so every buffer is
/// reached.
fn sorted_buffers(graph: &OpGraph) -> Result<Vec<BufferId>, GraphError> {
    enum Visit {
        Enter(BufferId),
        Exit(BufferId),
    }

    let mut stack: Vec<Visit> = Vec::new();
    for &buffer in graph.buffers().iter().rev() {
        if graph.consumers(buffer)?.is_empty() {
            stack.push(Visit::Enter(buffer));
        }
    }

    let mut sorted = Vec::with_capacity(graph.buffers().len());
    let mut seen: HashSet<BufferId> = HashSet::new();
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(buffer) => {
                if !seen.insert(buffer) {
                    continue;
                }
                stack.push(Visit::Exit(buffer));
                for &producer in graph.producers(buffer)? {
                    for &input in graph.inputs(producer)? {
                        stack.push(Visit::Enter(input));
                    }
                }
            }
            Visit::Exit(buffer) => sorted.push(buffer),
        }
    }
    Ok(sorted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    SramToDram,
    DramToSram,
}

/// Whether the chain so far contains a reshape and/or sub-tensor step, which
/// constrains the DMAs that may still join it (see [`step_state`]).
#[derive(Debug, Default, Clone, Copy)]
struct ChainState {
    has_reshape: bool,
    has_subtensor: bool,
}

/// A chain of buffers with DMAs connecting adjacent buffers:
///
/// ```text
///    buffers[0] -> dmas[0] -> buffers[1] -> dmas[1] -> buffers[2]
/// ```
#[derive(Debug, Default, Clone)]
struct DmaChain {
    /// In order from first to last; one longer than `dmas`.
    buffers: Vec<BufferId>,
    /// `dmas[i]` is the DMA between `buffers[i]` and `buffers[i + 1]`.
    dmas: Vec<OpId>,
}

impl DmaChain {
    fn len(&self) -> usize {
        self.buffers.len()
    }

    fn tail(&self) -> Option<BufferId> {
        self.buffers.last().copied()
    }

    /// Drops the last buffer pair (and DMA pair), keeping the open end on the
    /// same memory tier.
    fn shorten(&mut self) {
        self.buffers.pop();
        self.buffers.pop();
        self.dmas.pop();
        self.dmas.pop();
    }

    /// Sums the DMA offsets along the whole chain. Chain discovery only
    /// admits sub-tensor steps of a single direction, so the per-step offsets
    /// are all into the same DRAM tensor and summing them is meaningful.
    fn combined_offset(&self, graph: &OwnedOpGraph) -> Result<TensorShape, GraphError> {
        let mut total = TensorShape::ZERO;
        for &dma in &self.dmas {
            total += graph.op(dma)?.as_dma().ok_or(NOT_A_COPY)?.offset;
        }
        Ok(total)
    }

    /// Union of the operation IDs tagged anywhere on the chain.
    fn operation_ids(&self, graph: &OwnedOpGraph) -> Result<BTreeSet<u32>, GraphError> {
        let mut ids = BTreeSet::new();
        for &dma in &self.dmas {
            ids.extend(graph.op(dma)?.operation_ids.iter().copied());
        }
        Ok(ids)
    }
}

/// Whether a buffer can be part of a DMA chain at all.
fn eligible(buffer: &Buffer) -> bool {
    matches!(buffer.location(), Location::Dram | Location::Sram)
}

/// Checks whether the op between `input` and `output` can extend a chain in
/// state `state`, and if so returns the updated state.
///
/// An op extends a chain only if it is a plain DMA whose transfer format
/// matches the DRAM buffer it touches: a mismatch means the DMA deliberately
/// reinterprets the data (e.g. for fully connected) and the chain cannot be
/// summarised by a single copy.
///
/// Sub-tensor steps are only admitted in one direction per chain (taking part
/// of the input, or placing the input into part of the output): mixing
/// directions would make the combined offset of the optimised chain
/// ill-defined. Repeated sub-tensor steps of the allowed direction are fine
/// and let nested concats/splits merge. Reshape steps may also repeat, but a
/// chain may never hold both a reshape and a sub-tensor: the combined
/// transform cannot be recovered afterwards, so discovery stops before the
/// chain would contain both.
fn step_state(
    graph: &OwnedOpGraph,
    op: OpId,
    input: BufferId,
    output: BufferId,
    allowed_subtensor_dir: Direction,
    state: ChainState,
) -> Result<Option<ChainState>, GraphError> {
    let dma = match graph.op(op)?.as_dma() {
        Some(dma) => dma,
        None => return Ok(None),
    };
    let input = graph.buffer(input)?;
    let output = graph.buffer(output)?;

    let (dram_format, transfer_dir) = if input.location() == Location::Dram {
        (input.format, Direction::DramToSram)
    } else {
        (output.format, Direction::SramToDram)
    };
    if dma.transfer_format != dram_format {
        return Ok(None);
    }

    let mut next = state;
    let is_subtensor = !dma.offset.is_zero()
        || input.tensor_shape.num_elements() != output.tensor_shape.num_elements();
    if is_subtensor {
        next.has_subtensor = true;
        if transfer_dir != allowed_subtensor_dir {
            return Ok(None);
        }
    }
    let is_reshape = input.tensor_shape != output.tensor_shape
        && input.tensor_shape.num_elements() == output.tensor_shape.num_elements();
    if is_reshape {
        next.has_reshape = true;
    }
    if next.has_reshape && next.has_subtensor {
        return Ok(None);
    }
    Ok(Some(next))
}

/// Finds the chain of DMAs starting at the given SRAM buffer and ending in a
/// DRAM buffer, which together copy the entire starting buffer into (possibly
/// a sub-tensor of) the ending buffer. Returns a chain of one buffer when
/// nothing extends it.
fn chain_from_sram(graph: &OwnedOpGraph, start: BufferId) -> Result<DmaChain, GraphError> {
    if graph.buffer(start)?.location() != Location::Sram {
        return Ok(DmaChain::default());
    }

    let mut chain = DmaChain {
        buffers: vec![start],
        dmas: Vec::new(),
    };
    let mut state = ChainState::default();
    let mut buffer = start;
    loop {
        let consumers = graph.consumers(buffer)?;
        if consumers.len() != 1 {
            // Branching or end of graph. Multiple consumers mean the data is
            // needed elsewhere too, so this chain cannot simply be replaced.
            break;
        }
        let (consumer, _) = consumers[0];

        let output = match graph.output(consumer)? {
            Some(output) if eligible(graph.buffer(output)?) => output,
            _ => break,
        };
        state = match step_state(graph, consumer, buffer, output, Direction::SramToDram, state)? {
            Some(state) => state,
            None => break,
        };

        chain.buffers.push(output);
        chain.dmas.push(consumer);
        buffer = output;
    }

    // The search always terminates with a DRAM buffer at the open end; drop a
    // trailing SRAM hop.
    if chain.len() >= 2 {
        if let Some(last) = chain.tail() {
            if graph.buffer(last)?.location() == Location::Sram {
                chain.buffers.pop();
                chain.dmas.pop();
            }
        }
    }
    Ok(chain)
}

/// Mirror of [`chain_from_sram`]: finds the chain ending at the given SRAM
/// buffer and starting from a DRAM buffer.
fn chain_to_sram(graph: &OwnedOpGraph, end: BufferId) -> Result<DmaChain, GraphError> {
    if graph.buffer(end)?.location() != Location::Sram {
        return Ok(DmaChain::default());
    }

    let mut chain = DmaChain {
        buffers: vec![end],
        dmas: Vec::new(),
    };
    let mut state = ChainState::default();
    let mut buffer = end;
    loop {
        let producers = graph.producers(buffer)?;
        if producers.len() != 1 {
            // Branching or end of graph. Multiple producers mean the data
            // does not come from a single place.
            break;
        }
        let producer = producers[0];

        let input = match graph.inputs(producer)?.first() {
            Some(&input) if eligible(graph.buffer(input)?) => input,
            _ => break,
        };
        state = match step_state(graph, producer, input, buffer, Direction::DramToSram, state)? {
            Some(state) => state,
            None => break,
        };

        // Walking up, so the new buffer and DMA go at the front.
        chain.buffers.insert(0, input);
        chain.dmas.insert(0, producer);
        buffer = input;
    }

    // The open end (the front, here) must be a DRAM buffer.
    if chain.len() >= 2 && graph.buffer(chain.buffers[0])?.location() == Location::Sram {
        chain.buffers.remove(0);
        chain.dmas.remove(0);
    }
    Ok(chain)
}

/// Drops the tail pair of `chains[index]`, keeping the tail index in sync.
fn shorten_chain(
    chains: &mut [DmaChain],
    tails: &mut HashMap<BufferId, HashSet<usize>>,
    index: usize,
) {
    if let Some(old_tail) = chains[index].tail() {
        if let Some(set) = tails.get_mut(&old_tail) {
            set.remove(&index);
            if set.is_empty() {
                tails.remove(&old_tail);
            }
        }
    }
    chains[index].shorten();
    if chains[index].len() >= 2 {
        if let Some(new_tail) = chains[index].tail() {
            tails.entry(new_tail).or_default().insert(index);
        }
    }
}

/// Replaces chains of redundant DMAs from SRAM to DRAM (e.g. concat).
/// Returns the number of chains collapsed.
fn collapse_sram_to_dram(
    graph: &mut OwnedOpGraph,
    placement: &dyn PlacementRule,
) -> Result<usize, GraphError> {
    // Search in topological order from inputs to outputs so the longest
    // chains are found first. A buffer swallowed by one chain cannot start
    // another (chains must not be subsets of each other), but it can still be
    // the shared tail of several chains, as with nested concats where several
    // SRAM buffers end up in the same DRAM buffer.
    let mut chains: Vec<DmaChain> = Vec::new();
    let mut visited: HashSet<BufferId> = HashSet::new();
    for buffer in sorted_buffers(graph.graph())? {
        if visited.contains(&buffer) {
            continue;
        }
        let chain = chain_from_sram(graph, buffer)?;
        visited.extend(chain.buffers.iter().copied());
        if chain.len() >= 2 {
            trace!(start = %chain.buffers[0], len = chain.len(), "found sram->dram copy chain");
            chains.push(chain);
        }
    }

    // Validation phase: shorten each chain until the placement rule accepts a
    // direct copy between its ends, discarding chains that fall below four
    // buffers (Sram -> Dram -> Sram -> Dram), the minimum we can optimise.
    //
    // Shortening drops a chain's tail, and that tail may be shared with other
    // chains. Leaving it in only some of them would produce a concat buffer
    // with missing contributions, overwriting valid data later, so the
    // dropped tail is removed from every chain ending at it and those chains
    // are re-validated. The tail index tracks this membership explicitly and
    // the worklist re-validates exactly the affected chains.
    let mut tails: HashMap<BufferId, HashSet<usize>> = HashMap::new();
    for (index, chain) in chains.iter().enumerate() {
        if let Some(tail) = chain.tail() {
            tails.entry(tail).or_default().insert(index);
        }
    }
    let mut pending: VecDeque<usize> = (0..chains.len()).collect();
    let mut queued = vec![true; chains.len()];
    let mut alive = vec![true; chains.len()];
    while let Some(index) = pending.pop_front() {
        queued[index] = false;
        if !alive[index] {
            continue;
        }
        loop {
            if chains[index].len() < 4 {
                alive[index] = false;
                break;
            }
            let first = chains[index].buffers[0];
            let Some(last) = chains[index].tail() else {
                alive[index] = false;
                break;
            };
            let offset = chains[index].combined_offset(graph)?;
            if placement.allows_direct_copy(graph.buffer(first)?, graph.buffer(last)?, offset) {
                break;
            }

            trace!(start = %first, tail = %last, "direct copy not representable, shortening chain");
            shorten_chain(&mut chains, &mut tails, index);
            if let Some(sharing) = tails.get(&last).map(|set| set.iter().copied().collect::<Vec<_>>())
            {
                for other in sharing {
                    shorten_chain(&mut chains, &mut tails, other);
                    if alive[other] && !queued[other] {
                        pending.push_back(other);
                        queued[other] = true;
                    }
                }
            }
        }
    }

    // Apply phase: replace each surviving chain with a single DMA between its
    // end buffers. New ops cannot be allocated here (the container does not
    // own entity storage in general), so an existing DMA is repurposed. The
    // last DMA may be shared with other chains; the first one never is.
    let mut collapsed = 0;
    for (index, chain) in chains.iter().enumerate() {
        if !alive[index] {
            continue;
        }
        let first_dma = chain.dmas[0];
        let second_buffer = chain.buffers[1];
        let Some(last) = chain.tail() else { continue };

        let offset = chain.combined_offset(graph)?;
        let ids = chain.operation_ids(graph)?;
        let dram_format = graph.buffer(last)?.format;

        debug!(len = chain.len(), dram = %last, "collapsing sram->dram copy chain");
        graph.remove_producer(second_buffer, first_dma)?;
        {
            let op = graph.op_mut(first_dma)?;
            op.operation_ids = ids;
            let dma = op.as_dma_mut().ok_or(NOT_A_COPY)?;
            dma.transfer_format = dram_format;
            dma.offset = offset;
        }
        graph.add_producer(last, first_dma)?;

        // Prune from the top; the tail end may be shared with other chains.
        if graph.producers(second_buffer)?.is_empty() {
            graph.remove_and_prune_buffer(second_buffer)?;
        }
        collapsed += 1;
    }
    Ok(collapsed)
}

/// Replaces chains of redundant DMAs from DRAM to SRAM (e.g. split).
/// Returns the number of chains collapsed.
///
/// These chains can share a head prefix (one DRAM buffer split into many
/// SRAM buffers across nested splits) but never an ending buffer, so each
/// chain is validated and replaced independently. Collapsing one chain can
/// prune or repurpose entities inside a shared prefix, which is why only the
/// ending buffers are kept from discovery and each chain is re-explored
/// against the current graph when its turn comes.
fn collapse_dram_to_sram(
    graph: &mut OwnedOpGraph,
    placement: &dyn PlacementRule,
) -> Result<usize, GraphError> {
    // Reverse topological order: exploration walks bottom-up, so this finds
    // the longest chains first. An ending buffer is never a member of an
    // earlier-discovered chain (discovery marks every chain buffer visited),
    // so it cannot be pruned by an earlier collapse.
    let mut ends: Vec<BufferId> = Vec::new();
    let mut visited: HashSet<BufferId> = HashSet::new();
    for buffer in sorted_buffers(graph.graph())?.into_iter().rev() {
        if visited.contains(&buffer) {
            continue;
        }
        let chain = chain_to_sram(graph, buffer)?;
        visited.extend(chain.buffers.iter().copied());
        if chain.len() >= 2 {
            trace!(end = %buffer, len = chain.len(), "found dram->sram copy chain");
            ends.push(buffer);
        }
    }

    let mut collapsed = 0;
    for end in ends {
        let mut chain = chain_to_sram(graph, end)?;
        // Four buffers (Dram -> Sram -> Dram -> Sram) is the minimum length
        // we can optimise; shorten until the placement rule is satisfied.
        while chain.len() >= 4 {
            let head = chain.buffers[0];
            let Some(tail) = chain.tail() else { break };
            let offset = chain.combined_offset(graph)?;
            if !placement.allows_direct_copy(graph.buffer(tail)?, graph.buffer(head)?, offset) {
                trace!(head = %head, tail = %tail, "direct copy not representable, shortening chain");
                chain.shorten();
                continue;
            }

            let Some(&last_dma) = chain.dmas.last() else { break };
            let penultimate = chain.buffers[chain.len() - 2];
            let ids = chain.operation_ids(graph)?;
            let dram_format = graph.buffer(head)?.format;

            debug!(len = chain.len(), dram = %head, "collapsing dram->sram copy chain");
            graph.remove_consumer(penultimate, last_dma, 0)?;
            {
                let op = graph.op_mut(last_dma)?;
                op.operation_ids = ids;
                let dma = op.as_dma_mut().ok_or(NOT_A_COPY)?;
                dma.transfer_format = dram_format;
                dma.offset = offset;
            }
            graph.add_consumer(head, last_dma, 0)?;

            // Prune from the bottom; the head end may be shared with other
            // chains.
            if graph.consumers(penultimate)?.is_empty() {
                graph.remove_and_prune_buffer(penultimate)?;
            }
            collapsed += 1;
            break;
        }
    }
    Ok(collapsed)
}
