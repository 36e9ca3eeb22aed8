//! Placement/capacity rule: whether a direct DMA between an SRAM buffer and a
//! DRAM buffer is representable given the real memory geometry.
//!
//! The copy-elimination pass consumes this as a black box while re-validating
//! candidate chains; other compilation stages use it when picking DRAM
//! formats.

use crate::buffer::{Buffer, BufferFormat};
use crate::shape::TensorShape;

/// Hardware brick group geometry for NHWCB data.
pub const BRICK_GROUP_SHAPE: TensorShape = TensorShape([1, 8, 8, 16]);
/// Compression cell geometry for the FCAF_DEEP encoding.
pub const FCAF_DEEP_CELL_SHAPE: TensorShape = TensorShape([1, 8, 8, 32]);
/// Compression cell geometry for the FCAF_WIDE encoding.
pub const FCAF_WIDE_CELL_SHAPE: TensorShape = TensorShape([1, 8, 16, 16]);

/// Decides whether a single DMA can copy directly between an SRAM buffer and
/// (a sub-region of) a DRAM buffer.
pub trait PlacementRule {
    /// `dram_offset` is the combined offset of the copy into the DRAM tensor.
    /// Returns false when the copy is not representable, including when the
    /// buffers are not an SRAM/DRAM pair.
    fn allows_direct_copy(&self, sram: &Buffer, dram: &Buffer, dram_offset: TensorShape) -> bool;
}

/// Accepts every copy. Useful for tests and estimation-only flows where the
/// memory geometry is not modelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unrestricted;

impl PlacementRule for Unrestricted {
    fn allows_direct_copy(&self, _: &Buffer, _: &Buffer, _: TensorShape) -> bool {
        true
    }
}

/// The real NPU geometry rule: per-format offset alignment, depth-splitting
/// restrictions and compression cell compatibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct NpuPlacementRule;

impl PlacementRule for NpuPlacementRule {
    fn allows_direct_copy(&self, sram: &Buffer, dram: &Buffer, dram_offset: TensorShape) -> bool {
        let sram_fields = match sram.sram() {
            Some(fields) => fields,
            None => return false,
        };
        if dram.dram().is_none() {
            return false;
        }
        let dram_format = dram.format;
        let stripe_shape = sram_fields.stripe_shape;

        // A reshaping copy (same element count, different shape) must be
        // NHWC. The remaining checks then use the SRAM tensor shape, because
        // that is the shape the firmware command is built from.
        let mut dram_tensor_shape = dram.tensor_shape;
        if sram.tensor_shape != dram.tensor_shape
            && sram.tensor_shape.num_elements() == dram.tensor_shape.num_elements()
        {
            if dram_format != BufferFormat::Nhwc {
                return false;
            }
            dram_tensor_shape = sram.tensor_shape;
        }

        // An offset into the DRAM tensor must be aligned for the format.
        let required_multiple: TensorShape = match dram_format {
            BufferFormat::Nchw | BufferFormat::Nhwc => {
                // No channel offset, except that depth splitting is supported
                // when the width is 1.
                let channel_multiple = if dram_tensor_shape.width() == 1 {
                    1
                } else {
                    u32::MAX
                };
                TensorShape([1, 1, 1, channel_multiple])
            }
            BufferFormat::Nhwcb => BRICK_GROUP_SHAPE,
            BufferFormat::FcafWide => FCAF_WIDE_CELL_SHAPE,
            BufferFormat::FcafDeep => FCAF_DEEP_CELL_SHAPE,
            BufferFormat::Weight => return false,
        };
        for axis in 1..4 {
            if dram_offset[axis] % required_multiple[axis] != 0 {
                return false;
            }
        }

        // NHWC cannot split depth unless the width is 1.
        if dram_format == BufferFormat::Nhwc
            && stripe_shape.channels() < dram_tensor_shape.channels()
            && dram_tensor_shape.width() > 1
        {
            return false;
        }

        // The FCAF encodings require cell-compatible stripe shapes.
        if dram_format == BufferFormat::FcafDeep
            && !stripe_fits_cells(stripe_shape, FCAF_DEEP_CELL_SHAPE, dram_tensor_shape)
        {
            return false;
        }
        if dram_format == BufferFormat::FcafWide
            && !stripe_fits_cells(stripe_shape, FCAF_WIDE_CELL_SHAPE, dram_tensor_shape)
        {
            return false;
        }

        // Packed boundary data is only supported with NHWCB and FCAF.
        if !matches!(
            dram_format,
            BufferFormat::Nhwcb | BufferFormat::FcafDeep | BufferFormat::FcafWide
        ) && sram_fields.packed_boundary_thickness.any_non_zero()
        {
            return false;
        }

        if sram_fields.forbid_fcaf_wide && dram_format == BufferFormat::FcafWide {
            return false;
        }

        true
    }
}

/// Each of H/W/C of the stripe must be a whole number of compression cells,
/// or cover the full tensor in that axis.
fn stripe_fits_cells(
    stripe_shape: TensorShape,
    cell_shape: TensorShape,
    tensor_shape: TensorShape,
) -> bool {
    (1..4).all(|axis| {
        stripe_shape[axis] % cell_shape[axis] == 0 || stripe_shape[axis] >= tensor_shape[axis]
    })
}
