//! Back-end intermediate representation for an NPU compiler.
//!
//! The centre of the crate is [`OpGraph`], a non-intrusive dataflow graph
//! over two kinds of entity: *ops* (hardware actions such as DMA transfers
//! and convolution-engine invocations) and *buffers* (regions of DRAM or
//! SRAM holding tensor data). The graph alternates strictly between the two:
//! ops read buffers and write buffers, never each other. Connectivity lives
//! entirely in the container, so the same entities can appear in many
//! candidate graphs while plans are being explored; [`OwnedOpGraph`] pairs a
//! graph with owned entity storage for the phases that want a self-contained
//! value.
//!
//! On top of the container sit graph-rewriting passes (see [`passes`]),
//! currently [`RedundantCopyElimination`], which removes chains of DMAs that
//! copy the same data in and out of SRAM repeatedly.
//!
//! ```
//! use npu_ir::{Buffer, BufferFormat, Op, OwnedOpGraph, TensorShape};
//!
//! let shape = TensorShape::new(1, 16, 16, 16);
//! let mut graph = OwnedOpGraph::new();
//! let input = graph.add_buffer(Buffer::new_dram(BufferFormat::Nhwc, shape));
//! let dma = graph.add_op(Op::dma(BufferFormat::Nhwc));
//! let staged = graph.add_buffer(Buffer::new_sram(shape, shape));
//! graph.add_consumer(input, dma, 0)?;
//! graph.set_producer(staged, dma)?;
//! assert_eq!(graph.single_producer(staged)?, Some(dma));
//! # Ok::<(), npu_ir::GraphError>(())
//! ```

pub mod buffer;
pub mod graph;
pub mod op;
pub mod passes;
pub mod placement;
pub mod shape;

pub use buffer::{
    Buffer, BufferFormat, BufferId, BufferKind, BufferType, DataType, DramBuffer, Location,
    PackedBoundaryThickness, PleInputSramBuffer, SramBuffer, TraversalOrder,
};
pub use graph::{Consumer, EntityRef, GraphError, OpGraph, OwnedOpGraph};
pub use op::{DmaOp, MceOp, MceOperation, Op, OpId, OpKind, PleOp, PleOperation};
pub use passes::{GraphPass, PassContext, PassResult, RedundantCopyElimination};
pub use placement::{NpuPlacementRule, PlacementRule, Unrestricted};
pub use shape::TensorShape;
