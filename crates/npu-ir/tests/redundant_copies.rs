//! End-to-end tests for the redundant-copy-elimination pass, covering the
//! concat/split/reshape graph shapes it is designed to collapse and the
//! situations where it must leave the graph alone.

use npu_ir::{
    Buffer, BufferFormat, BufferId, GraphPass, Op, OpId, OpKind, OwnedOpGraph, PassContext,
    PassResult, PlacementRule, RedundantCopyElimination, TensorShape, Unrestricted,
};

const SHAPE: TensorShape = TensorShape([1, 16, 16, 16]);
const TALL: TensorShape = TensorShape([1, 32, 16, 16]);

fn sram(shape: TensorShape) -> Buffer {
    Buffer::new_sram(shape, shape)
}

fn dram(shape: TensorShape) -> Buffer {
    Buffer::new_dram(BufferFormat::Nhwc, shape)
}

fn dma() -> Op {
    Op::dma(BufferFormat::Nhwc)
}

fn dma_at(offset: TensorShape) -> Op {
    let mut op = dma();
    if let OpKind::Dma(fields) = &mut op.kind {
        fields.offset = offset;
    }
    op
}

/// Connects `input -> op -> output`, joining existing producers of `output`
/// if it already has some.
fn link(graph: &mut OwnedOpGraph, input: BufferId, op: OpId, output: BufferId) {
    graph.add_consumer(input, op, 0).unwrap();
    if graph.producers(output).unwrap().is_empty() {
        graph.set_producer(output, op).unwrap();
    } else {
        graph.add_producer(output, op).unwrap();
    }
}

fn run(graph: &mut OwnedOpGraph, placement: &dyn PlacementRule) -> PassResult {
    let cx = PassContext::new(placement);
    RedundantCopyElimination.run(graph, &cx).unwrap()
}

fn offset_of(graph: &OwnedOpGraph, op: OpId) -> TensorShape {
    graph.op(op).unwrap().as_dma().unwrap().offset
}

#[test]
fn linear_chain_collapses_to_single_copies() {
    // c -> D1 -> e -> D2 -> g -> D3 -> i -> D4 -> k
    //  S          D          S          D          S
    //
    // The Sram->Dram half collapses c..i into c -> D1 -> i; the remaining
    // i -> D4 -> k is already a single copy.
    let mut graph = OwnedOpGraph::new();
    let c = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma().with_operation_ids([1]));
    let e = graph.add_buffer(dram(SHAPE));
    let d2 = graph.add_op(dma().with_operation_ids([2]));
    let g = graph.add_buffer(sram(SHAPE));
    let d3 = graph.add_op(dma().with_operation_ids([3]));
    let i = graph.add_buffer(dram(SHAPE));
    let d4 = graph.add_op(dma().with_operation_ids([4]));
    let k = graph.add_buffer(sram(SHAPE));
    link(&mut graph, c, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, g, d3, i);
    link(&mut graph, i, d4, k);

    let result = run(&mut graph, &Unrestricted);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 1);
    assert_eq!(graph.ops().len(), 2);
    assert_eq!(graph.buffers().len(), 3);
    assert_eq!(graph.single_producer(i).unwrap(), Some(d1));
    assert_eq!(graph.consumers(i).unwrap(), &[(d4, 0)]);
    assert_eq!(graph.single_producer(k).unwrap(), Some(d4));
    // The repurposed DMA carries the union of the collapsed ops' IDs.
    let ids: Vec<u32> = graph.op(d1).unwrap().operation_ids.iter().copied().collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn concat_chains_merge_into_shared_output() {
    // a -> C \                                   a -> C \
    //          e -> G -> j -> K -> i     =>               i
    // b -> D /                                   b -> D /
    //
    // e is a concatenation along height; both chains share the e..i suffix.
    let mut graph = OwnedOpGraph::new();
    let a = graph.add_buffer(sram(SHAPE));
    let b = graph.add_buffer(sram(SHAPE));
    let op_c = graph.add_op(dma());
    let op_d = graph.add_op(dma_at(TensorShape::new(0, 16, 0, 0)));
    let e = graph.add_buffer(dram(TALL));
    let op_g = graph.add_op(dma());
    let j = graph.add_buffer(sram(TALL));
    let op_k = graph.add_op(dma());
    let i = graph.add_buffer(dram(TALL));
    link(&mut graph, a, op_c, e);
    link(&mut graph, b, op_d, e);
    link(&mut graph, e, op_g, j);
    link(&mut graph, j, op_k, i);

    let result = run(&mut graph, &Unrestricted);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 2);
    assert_eq!(graph.ops().len(), 2);
    assert_eq!(graph.buffers().len(), 3);
    assert!(graph.contains_buffer(a));
    assert!(graph.contains_buffer(b));
    assert!(graph.contains_buffer(i));
    // Both concat DMAs now write straight into i, keeping their offsets.
    let mut producers = graph.producers(i).unwrap().to_vec();
    producers.sort();
    let mut expected = vec![op_c, op_d];
    expected.sort();
    assert_eq!(producers, expected);
    assert_eq!(offset_of(&graph, op_c), TensorShape::ZERO);
    assert_eq!(offset_of(&graph, op_d), TensorShape::new(0, 16, 0, 0));
}

/// Rejects any copy where either end is tagged "blocked".
struct BlockTagged;

impl PlacementRule for BlockTagged {
    fn allows_direct_copy(&self, sram: &Buffer, dram: &Buffer, _offset: TensorShape) -> bool {
        !sram.debug_tag.contains("blocked") && !dram.debug_tag.contains("blocked")
    }
}

#[test]
fn shared_tail_is_all_or_nothing() {
    // Same shape as the concat test, but the direct copy into i is not
    // representable. Collapsing only the b chain would leave i with a
    // missing contribution from a, so neither chain may collapse.
    let mut graph = OwnedOpGraph::new();
    let a = graph.add_buffer(sram(SHAPE));
    let b = graph.add_buffer(sram(SHAPE));
    let op_c = graph.add_op(dma());
    let op_d = graph.add_op(dma_at(TensorShape::new(0, 16, 0, 0)));
    let e = graph.add_buffer(dram(TALL));
    let op_g = graph.add_op(dma());
    let j = graph.add_buffer(sram(TALL));
    let op_k = graph.add_op(dma());
    let i = graph.add_buffer(dram(TALL).with_debug_tag("blocked output"));
    link(&mut graph, a, op_c, e);
    link(&mut graph, b, op_d, e);
    link(&mut graph, e, op_g, j);
    link(&mut graph, j, op_k, i);

    let before = graph.graph().clone();
    let result = run(&mut graph, &BlockTagged);
    assert!(!result.changed);
    assert_eq!(result.entities_removed, 0);
    assert_eq!(graph.graph(), &before);
}

#[test]
fn consumer_branch_stops_a_chain() {
    // c -> D1 -> e, with e feeding two separate SRAM buffers. The data in e
    // is needed in two places, so nothing may collapse.
    let mut graph = OwnedOpGraph::new();
    let c = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma());
    let e = graph.add_buffer(dram(SHAPE));
    let d2 = graph.add_op(dma());
    let g = graph.add_buffer(sram(SHAPE));
    let d5 = graph.add_op(dma());
    let m = graph.add_buffer(sram(SHAPE));
    let d3 = graph.add_op(dma());
    let i = graph.add_buffer(dram(SHAPE));
    link(&mut graph, c, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, e, d5, m);
    link(&mut graph, g, d3, i);

    let before = graph.graph().clone();
    let result = run(&mut graph, &Unrestricted);
    assert!(!result.changed);
    assert_eq!(graph.graph(), &before);
}

#[test]
fn reshape_and_subtensor_never_mix() {
    // a reshape hop followed by a sub-tensor hop: the combined transform is
    // not expressible as one copy, so the chain must not collapse.
    let flat = TensorShape::new(1, 256, 1, 16);
    let big = TensorShape::new(1, 512, 1, 16);
    let mut graph = OwnedOpGraph::new();
    let a = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma());
    let e = graph.add_buffer(dram(flat)); // reshape of a
    let d2 = graph.add_op(dma());
    let g = graph.add_buffer(sram(flat));
    let d3 = graph.add_op(dma_at(TensorShape::new(0, 256, 0, 0)));
    let i = graph.add_buffer(dram(big)); // e placed into part of i
    link(&mut graph, a, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, g, d3, i);

    let before = graph.graph().clone();
    let result = run(&mut graph, &Unrestricted);
    assert!(!result.changed);
    assert_eq!(graph.graph(), &before);
}

#[test]
fn split_chains_collapse_onto_shared_source() {
    // m -> L -> i, then i is read twice: split into a and b through the
    // j/e staging pair, and directly into f.
    //
    //            m (Sram)                        m (Sram)
    //               |                               |
    //               L                               L
    //               |                               |
    //            i (Dram)                        i (Dram)
    //         /           \                   /     |     \
    //       K              H                 C      D      H
    //       |              |                 |      |      |
    //    j (Sram)          |              a (S)  b (S)  f (S)
    //       |              |
    //       G              |
    //       |              |
    //    e (Dram)       f (Sram)
    //  /        \
    // C          D
    // |          |
    // a (S)   b (S)
    let mut graph = OwnedOpGraph::new();
    let m = graph.add_buffer(sram(TALL));
    let op_l = graph.add_op(dma().with_operation_ids([1]));
    let i = graph.add_buffer(dram(TALL));
    let op_k = graph.add_op(dma().with_operation_ids([2]));
    let j = graph.add_buffer(sram(TALL));
    let op_g = graph.add_op(dma().with_operation_ids([3]));
    let e = graph.add_buffer(dram(TALL));
    let op_c = graph.add_op(dma_at(TensorShape::new(0, 16, 0, 0)).with_operation_ids([4]));
    let a = graph.add_buffer(sram(SHAPE));
    let op_d = graph.add_op(dma().with_operation_ids([5]));
    let b = graph.add_buffer(sram(SHAPE));
    let op_h = graph.add_op(dma());
    let f = graph.add_buffer(sram(SHAPE));
    link(&mut graph, m, op_l, i);
    link(&mut graph, i, op_k, j);
    link(&mut graph, j, op_g, e);
    link(&mut graph, e, op_c, a);
    link(&mut graph, e, op_d, b);
    link(&mut graph, i, op_h, f);

    let result = run(&mut graph, &Unrestricted);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 2);
    assert_eq!(graph.ops().len(), 4);
    assert_eq!(graph.buffers().len(), 5);
    // a and b now read straight from i; the j/e staging pair is gone.
    assert!(!graph.contains_buffer(j));
    assert!(!graph.contains_buffer(e));
    assert_eq!(graph.single_producer(a).unwrap(), Some(op_c));
    assert_eq!(graph.single_producer(b).unwrap(), Some(op_d));
    assert_eq!(graph.single_producer(f).unwrap(), Some(op_h));
    assert_eq!(offset_of(&graph, op_c), TensorShape::new(0, 16, 0, 0));
    assert_eq!(offset_of(&graph, op_d), TensorShape::ZERO);
    let ids: Vec<u32> = graph.op(op_c).unwrap().operation_ids.iter().copied().collect();
    assert_eq!(ids, vec![2, 3, 4]);
}

#[test]
fn nested_concat_accumulates_offsets_through_removed_hops() {
    // Two concat branches whose shared suffix itself writes at an offset:
    //
    //   a -> C (+0)  \
    //                 e -> G -> j -> K (+16) -> i
    //   b -> D (+16) /
    //
    // Collapsing must sum the per-hop offsets, landing a at +16 and b at +32
    // within i.
    let wide = TensorShape::new(1, 48, 16, 16);
    let mut graph = OwnedOpGraph::new();
    let a = graph.add_buffer(sram(SHAPE));
    let b = graph.add_buffer(sram(SHAPE));
    let op_c = graph.add_op(dma());
    let op_d = graph.add_op(dma_at(TensorShape::new(0, 16, 0, 0)));
    let e = graph.add_buffer(dram(TALL));
    let op_g = graph.add_op(dma());
    let j = graph.add_buffer(sram(TALL));
    let op_k = graph.add_op(dma_at(TensorShape::new(0, 16, 0, 0)));
    let i = graph.add_buffer(dram(wide));
    link(&mut graph, a, op_c, e);
    link(&mut graph, b, op_d, e);
    link(&mut graph, e, op_g, j);
    link(&mut graph, j, op_k, i);

    let result = run(&mut graph, &Unrestricted);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 2);
    assert_eq!(graph.ops().len(), 2);
    assert_eq!(graph.buffers().len(), 3);
    assert_eq!(offset_of(&graph, op_c), TensorShape::new(0, 16, 0, 0));
    assert_eq!(offset_of(&graph, op_d), TensorShape::new(0, 32, 0, 0));
    let mut producers = graph.producers(i).unwrap().to_vec();
    producers.sort();
    let mut expected = vec![op_c, op_d];
    expected.sort();
    assert_eq!(producers, expected);
}

#[test]
fn split_chains_survive_a_collapsed_shared_prefix() {
    // i -> A -> j -> B -> e -> C -> x -> D -> w, with w read into both s1
    // and s2. Direct copies into s1 and s2 are rejected, so both chains
    // shorten down to the same i..x prefix. The first collapse prunes j and
    // e out of that prefix; the second chain must still be handled cleanly
    // and must not collapse the prefix a second time.
    let mut graph = OwnedOpGraph::new();
    let i = graph.add_buffer(dram(SHAPE));
    let op_a = graph.add_op(dma());
    let j = graph.add_buffer(sram(SHAPE));
    let op_b = graph.add_op(dma());
    let e = graph.add_buffer(dram(SHAPE));
    let op_c = graph.add_op(dma());
    let x = graph.add_buffer(sram(SHAPE));
    let op_d = graph.add_op(dma());
    let w = graph.add_buffer(dram(SHAPE).with_debug_tag("blocked staging"));
    let op_e = graph.add_op(dma());
    let s1 = graph.add_buffer(sram(SHAPE).with_debug_tag("blocked left"));
    let op_f = graph.add_op(dma());
    let s2 = graph.add_buffer(sram(SHAPE).with_debug_tag("blocked right"));
    link(&mut graph, i, op_a, j);
    link(&mut graph, j, op_b, e);
    link(&mut graph, e, op_c, x);
    link(&mut graph, x, op_d, w);
    link(&mut graph, w, op_e, s1);
    link(&mut graph, w, op_f, s2);

    let result = run(&mut graph, &BlockTagged);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 1);
    // i -> C -> x -> D -> w -> {E -> s1, F -> s2}
    assert_eq!(graph.ops().len(), 4);
    assert_eq!(graph.buffers().len(), 5);
    assert!(!graph.contains_buffer(j));
    assert!(!graph.contains_buffer(e));
    assert!(!graph.contains_op(op_a));
    assert!(!graph.contains_op(op_b));
    assert_eq!(graph.single_producer(x).unwrap(), Some(op_c));
    assert_eq!(graph.consumers(i).unwrap(), &[(op_c, 0)]);
    assert_eq!(graph.single_producer(s1).unwrap(), Some(op_e));
    assert_eq!(graph.single_producer(s2).unwrap(), Some(op_f));
    assert_eq!(offset_of(&graph, op_c), TensorShape::ZERO);
}

#[test]
fn chain_shortens_until_the_copy_is_representable() {
    // c..m is a six-buffer chain whose full collapse is rejected, but the
    // four-buffer prefix c..i is accepted, so only that part collapses.
    let mut graph = OwnedOpGraph::new();
    let c = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma());
    let e = graph.add_buffer(dram(SHAPE));
    let d2 = graph.add_op(dma());
    let g = graph.add_buffer(sram(SHAPE));
    let d3 = graph.add_op(dma());
    let i = graph.add_buffer(dram(SHAPE));
    let d4 = graph.add_op(dma());
    let k = graph.add_buffer(sram(SHAPE));
    let d5 = graph.add_op(dma());
    let m = graph.add_buffer(dram(SHAPE).with_debug_tag("blocked far end"));
    link(&mut graph, c, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, g, d3, i);
    link(&mut graph, i, d4, k);
    link(&mut graph, k, d5, m);

    let result = run(&mut graph, &BlockTagged);
    assert!(result.changed);
    assert_eq!(result.chains_collapsed, 1);
    // c -> D1 -> i -> D4 -> k -> D5 -> m
    assert_eq!(graph.ops().len(), 3);
    assert_eq!(graph.buffers().len(), 4);
    assert_eq!(graph.single_producer(i).unwrap(), Some(d1));
    assert_eq!(graph.single_producer(m).unwrap(), Some(d5));
}

#[test]
fn pass_is_idempotent() {
    let mut graph = OwnedOpGraph::new();
    let c = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma());
    let e = graph.add_buffer(dram(SHAPE));
    let d2 = graph.add_op(dma());
    let g = graph.add_buffer(sram(SHAPE));
    let d3 = graph.add_op(dma());
    let i = graph.add_buffer(dram(SHAPE));
    link(&mut graph, c, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, g, d3, i);

    let first = run(&mut graph, &Unrestricted);
    assert!(first.changed);
    let after_first = graph.graph().clone();
    let second = run(&mut graph, &Unrestricted);
    assert!(!second.changed);
    assert_eq!(second.entities_removed, 0);
    assert_eq!(graph.graph(), &after_first);
}

#[test]
fn graphs_without_copy_chains_are_untouched() {
    let mut graph = OwnedOpGraph::new();
    let input = graph.add_buffer(dram(SHAPE));
    let d1 = graph.add_op(dma());
    let staged = graph.add_buffer(sram(SHAPE));
    let d2 = graph.add_op(dma());
    let output = graph.add_buffer(dram(SHAPE));
    link(&mut graph, input, d1, staged);
    link(&mut graph, staged, d2, output);

    let before = graph.graph().clone();
    let result = run(&mut graph, &Unrestricted);
    assert!(!result.changed);
    assert_eq!(result.chains_collapsed, 0);
    assert_eq!(graph.graph(), &before);
}

#[test]
fn mismatched_transfer_format_stops_a_chain() {
    // D2's transfer format deliberately differs from e's format, so the
    // reinterpreting copy must survive.
    let mut graph = OwnedOpGraph::new();
    let c = graph.add_buffer(sram(SHAPE));
    let d1 = graph.add_op(dma());
    let e = graph.add_buffer(dram(SHAPE));
    let d2 = graph.add_op(Op::dma(BufferFormat::Nhwcb));
    let g = graph.add_buffer(sram(SHAPE));
    let d3 = graph.add_op(dma());
    let i = graph.add_buffer(dram(SHAPE));
    link(&mut graph, c, d1, e);
    link(&mut graph, e, d2, g);
    link(&mut graph, g, d3, i);

    let before = graph.graph().clone();
    let result = run(&mut graph, &Unrestricted);
    assert!(!result.changed);
    assert_eq!(graph.graph(), &before);
}
