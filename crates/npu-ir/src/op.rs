//! Op entity model: the hardware actions a graph schedules.
//!
//! Like buffers, ops are pure data holders; the graph container records how
//! they connect. The concrete kinds form a closed sum ([`OpKind`]): copy ops
//! carry the fields the copy-elimination pass rewrites, compute ops are
//! opaque to it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::buffer::{BufferFormat, TraversalOrder};
use crate::shape::TensorShape;

/// Stable identifier for an op. See [`crate::buffer::BufferId`] for the
/// global-uniqueness rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

static NEXT_OP_ID: AtomicU32 = AtomicU32::new(0);

impl OpId {
    /// Allocates a fresh, process-wide unique identifier.
    pub fn fresh() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op {}", self.0)
    }
}

/// A memory-to-memory copy between DRAM and SRAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaOp {
    /// The DRAM format this copy converts to/from (the SRAM side is always
    /// NHWCB). Normally matches the connected DRAM buffer's format, but a
    /// mismatch is used to deliberately reinterpret the data, e.g. for fully
    /// connected layers.
    pub transfer_format: BufferFormat,
    /// Offset into the DRAM tensor, for copies that read from or write into a
    /// sub-region of a larger logical tensor.
    pub offset: TensorShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MceOperation {
    Convolution,
    DepthwiseConvolution,
    FullyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PleOperation {
    Passthrough,
    Addition,
    AdditionRescale,
    AvgPool,
    MaxPool,
    Interleave,
    Transpose,
}

/// Width/height of the block the convolution engine processes at a time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    pub x: u32,
    pub y: u32,
}

/// A convolution-engine action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MceOp {
    pub operation: MceOperation,
    pub block_config: BlockConfig,
    pub input_stripe_shape: TensorShape,
    pub output_stripe_shape: TensorShape,
    pub weights_stripe_shape: TensorShape,
    pub order: TraversalOrder,
    pub stride: Stride,
    pub pad_left: u32,
    pub pad_top: u32,
}

/// A programmable element-wise engine action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PleOp {
    pub operation: PleOperation,
    pub block_config: BlockConfig,
    pub input_stripe_shapes: Vec<TensorShape>,
    pub output_stripe_shape: TensorShape,
    /// Whether this op also loads the kernel into the engine first.
    pub load_kernel: bool,
}

/// Placeholder for an operation the hardware cannot run but which still needs
/// to appear in performance estimates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateOnlyOp {
    pub reason: String,
}

/// Kind-specific part of an [`Op`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Dma(DmaOp),
    Mce(MceOp),
    Ple(PleOp),
    EstimateOnly(EstimateOnlyOp),
    Dummy,
}

/// One hardware action in the execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub debug_tag: String,
    /// IDs of the original network operations this op derives from, for
    /// diagnostics. Order-irrelevant and deduplicated.
    pub operation_ids: BTreeSet<u32>,
    pub kind: OpKind,
}

impl Op {
    pub fn dma(transfer_format: BufferFormat) -> Op {
        Op {
            debug_tag: String::from("DmaOp"),
            operation_ids: BTreeSet::new(),
            kind: OpKind::Dma(DmaOp {
                transfer_format,
                offset: TensorShape::ZERO,
            }),
        }
    }

    pub fn mce(mce: MceOp) -> Op {
        Op {
            debug_tag: String::from("MceOp"),
            operation_ids: BTreeSet::new(),
            kind: OpKind::Mce(mce),
        }
    }

    pub fn ple(ple: PleOp) -> Op {
        Op {
            debug_tag: String::from("PleOp"),
            operation_ids: BTreeSet::new(),
            kind: OpKind::Ple(ple),
        }
    }

    pub fn estimate_only(reason: impl Into<String>) -> Op {
        Op {
            debug_tag: String::from("EstimateOnlyOp"),
            operation_ids: BTreeSet::new(),
            kind: OpKind::EstimateOnly(EstimateOnlyOp {
                reason: reason.into(),
            }),
        }
    }

    pub fn dummy() -> Op {
        Op {
            debug_tag: String::from("DummyOp"),
            operation_ids: BTreeSet::new(),
            kind: OpKind::Dummy,
        }
    }

    pub fn with_debug_tag(mut self, tag: impl Into<String>) -> Op {
        self.debug_tag = tag.into();
        self
    }

    pub fn with_operation_ids<I: IntoIterator<Item = u32>>(mut self, ids: I) -> Op {
        self.operation_ids = ids.into_iter().collect();
        self
    }

    pub fn is_dma(&self) -> bool {
        matches!(self.kind, OpKind::Dma(_))
    }

    pub fn as_dma(&self) -> Option<&DmaOp> {
        match &self.kind {
            OpKind::Dma(dma) => Some(dma),
            _ => None,
        }
    }

    pub fn as_dma_mut(&mut self) -> Option<&mut DmaOp> {
        match &mut self.kind {
            OpKind::Dma(dma) => Some(dma),
            _ => None,
        }
    }
}
