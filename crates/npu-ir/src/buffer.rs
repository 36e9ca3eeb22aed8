//! Buffer entity model: logical tensors (or tensor stripes) resident in a
//! specific memory tier.
//!
//! Buffers are pure data holders with no graph awareness; connectivity lives
//! entirely in [`crate::graph::OpGraph`]. The concrete kinds form a closed sum
//! ([`BufferKind`]) so that tier-specific fields are only reachable once the
//! tier is known, instead of relying on runtime downcasts.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::shape::TensorShape;

/// Stable identifier for a buffer. Allocated from a global counter so that
/// identities stay unique across independently built graphs, which makes
/// merging graphs collision-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

static NEXT_BUFFER_ID: AtomicU32 = AtomicU32::new(0);

impl BufferId {
    /// Allocates a fresh, process-wide unique identifier.
    pub fn fresh() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// Memory tier a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Off-chip main memory.
    Dram,
    /// On-chip local memory.
    Sram,
    /// The compute engine's input staging memory, between the convolution
    /// engine and the programmable element-wise engine.
    PleInputSram,
}

/// Element layout of a buffer. The two FCAF variants are mutually exclusive
/// compressed DRAM encodings; SRAM buffers are always NHWCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Nhwc,
    Nchw,
    Nhwcb,
    FcafDeep,
    FcafWide,
    Weight,
}

impl BufferFormat {
    pub fn is_compressed(self) -> bool {
        matches!(self, BufferFormat::FcafDeep | BufferFormat::FcafWide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    UInt8Quantized,
    Int8Quantized,
    Int32Quantized,
}

/// The order in which stripes of a tensor are streamed through SRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraversalOrder {
    Xyz,
    Zxy,
}

/// Role of a DRAM buffer within the compiled network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Input,
    Output,
    Intermediate,
    ConstantDma,
    ConstantControlUnit,
}

/// How much boundary data from neighbouring stripes is packed into each
/// stripe slot of an SRAM buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackedBoundaryThickness {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl PackedBoundaryThickness {
    pub fn any_non_zero(&self) -> bool {
        self.left != 0 || self.top != 0 || self.right != 0 || self.bottom != 0
    }
}

/// Per-stripe location of one weight stripe inside an encoded weight blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsMetadata {
    pub offset: u32,
    pub size: u32,
}

/// Compressed weight payload produced by the weight encoder. Attached to DRAM
/// weight buffers and treated as opaque by every graph algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedWeights {
    pub data: Vec<u8>,
    pub max_size: u32,
    pub metadata: Vec<WeightsMetadata>,
    pub is_wide_filter: bool,
}

/// Fields specific to on-chip buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SramBuffer {
    pub stripe_shape: TensorShape,
    pub order: TraversalOrder,
    /// Size of a single stripe slot, in bytes.
    pub slot_size_in_bytes: u32,
    pub num_stripes: u32,
    /// How many times the tensor is loaded into this buffer. Normally 1, but
    /// some streaming strategies re-load the same data from DRAM.
    pub num_loads: u32,
    pub packed_boundary_thickness: PackedBoundaryThickness,
    pub forbid_fcaf_wide: bool,
}

/// Fields specific to off-chip buffers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DramBuffer {
    pub buffer_type: Option<BufferType>,
    /// Relevant only for weight buffers. Opaque to graph algorithms.
    pub encoded_weights: Option<Arc<EncodedWeights>>,
    /// Relevant only for constant buffers. Opaque to graph algorithms.
    pub constant_data: Option<Arc<Vec<u8>>>,
    /// Set for network input/output buffers, tracing back to the original
    /// network operation.
    pub operation_id: Option<u32>,
    pub producer_output_index: Option<u32>,
}

/// Fields specific to compute-input staging buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PleInputSramBuffer {
    pub stripe_shape: TensorShape,
    pub num_stripes: u32,
}

/// Tier-specific part of a [`Buffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferKind {
    Sram(SramBuffer),
    Dram(DramBuffer),
    PleInputSram(PleInputSramBuffer),
}

/// A logical tensor or tensor-stripe resident in a specific memory tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub debug_tag: String,
    pub data_type: DataType,
    pub format: BufferFormat,
    pub tensor_shape: TensorShape,
    /// Size of the entire buffer, in bytes. For DRAM buffers this is the size
    /// of the whole tensor; for SRAM buffers it is a rolling buffer and is
    /// usually smaller.
    pub size_in_bytes: u32,
    pub kind: BufferKind,
}

impl Buffer {
    /// Creates an SRAM buffer with the given shapes. SRAM buffers are always
    /// NHWCB; remaining fields start from neutral defaults and can be
    /// adjusted directly.
    pub fn new_sram(tensor_shape: TensorShape, stripe_shape: TensorShape) -> Buffer {
        Buffer {
            debug_tag: String::from("SramBuffer"),
            data_type: DataType::UInt8Quantized,
            format: BufferFormat::Nhwcb,
            tensor_shape,
            size_in_bytes: 0,
            kind: BufferKind::Sram(SramBuffer {
                stripe_shape,
                order: TraversalOrder::Xyz,
                slot_size_in_bytes: 0,
                num_stripes: 0,
                num_loads: 1,
                packed_boundary_thickness: PackedBoundaryThickness::default(),
                forbid_fcaf_wide: false,
            }),
        }
    }

    pub fn new_dram(format: BufferFormat, tensor_shape: TensorShape) -> Buffer {
        Buffer {
            debug_tag: String::from("DramBuffer"),
            data_type: DataType::UInt8Quantized,
            format,
            tensor_shape,
            size_in_bytes: 0,
            kind: BufferKind::Dram(DramBuffer::default()),
        }
    }

    pub fn new_ple_input_sram(tensor_shape: TensorShape, stripe_shape: TensorShape) -> Buffer {
        Buffer {
            debug_tag: String::from("PleInputSramBuffer"),
            data_type: DataType::UInt8Quantized,
            format: BufferFormat::Nhwcb,
            tensor_shape,
            size_in_bytes: 0,
            kind: BufferKind::PleInputSram(PleInputSramBuffer {
                stripe_shape,
                num_stripes: 0,
            }),
        }
    }

    pub fn with_debug_tag(mut self, tag: impl Into<String>) -> Buffer {
        self.debug_tag = tag.into();
        self
    }

    pub fn location(&self) -> Location {
        match self.kind {
            BufferKind::Sram(_) => Location::Sram,
            BufferKind::Dram(_) => Location::Dram,
            BufferKind::PleInputSram(_) => Location::PleInputSram,
        }
    }

    pub fn sram(&self) -> Option<&SramBuffer> {
        match &self.kind {
            BufferKind::Sram(sram) => Some(sram),
            _ => None,
        }
    }

    pub fn sram_mut(&mut self) -> Option<&mut SramBuffer> {
        match &mut self.kind {
            BufferKind::Sram(sram) => Some(sram),
            _ => None,
        }
    }

    pub fn dram(&self) -> Option<&DramBuffer> {
        match &self.kind {
            BufferKind::Dram(dram) => Some(dram),
            _ => None,
        }
    }

    pub fn dram_mut(&mut self) -> Option<&mut DramBuffer> {
        match &mut self.kind {
            BufferKind::Dram(dram) => Some(dram),
            _ => None,
        }
    }

    pub fn ple_input_sram(&self) -> Option<&PleInputSramBuffer> {
        match &self.kind {
            BufferKind::PleInputSram(ple) => Some(ple),
            _ => None,
        }
    }

    /// Whether this buffer holds the entire tensor, rather than streaming it
    /// through in stripes.
    pub fn is_full_tensor(&self) -> bool {
        match &self.kind {
            BufferKind::Dram(_) => true,
            BufferKind::Sram(sram) => (0..4).all(|axis| {
                sram.stripe_shape[axis] >= self.tensor_shape[axis]
            }),
            BufferKind::PleInputSram(_) => false,
        }
    }
}
