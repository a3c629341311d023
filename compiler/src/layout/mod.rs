//! Shared-Memory and Fragment Layouts
//!
//! Address permutations used when staging GEMM operand tiles through shared
//! memory, and the mapping of accumulator tiles onto warp registers.
//!
//! # Layout Families
//!
//! ```text
//! logical offset ──► SharedLayout ──► physical shared-memory offset
//!                    (RowMajor, ColumnMajor, Volta*, Ampere*)
//!
//! logical (i, j) ──► FragmentLayout ──► (owning thread, slot in thread)
//!                    (Accum32x32, Accum8x8)
//! ```
//!
//! Every swizzled layout splits the offset into a strided row and a
//! contiguous column, cuts both into vector / tile / partition indices at the
//! granularity of the native MMA fragment and XORs the finest partition
//! residuals so that the eight rows read by one `ldmatrix` phase land in
//! distinct banks. The XOR is applied to a fixed index, so each layout is a
//! permutation of its footprint.
//!
//! Dimensions are validated at construction time; a layout that exists is
//! always usable.

pub mod fragment;
pub mod swizzle;

pub use fragment::{Accum32x32, Accum8x8, FragmentLayout};
pub use swizzle::{
    AmpereSwizzle, ColumnMajor, OperandRole, RowMajor, SharedLayout, VoltaCongruous,
    VoltaCrosswise,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of layout variants understood by the code generator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutKind {
    RowMajor,
    ColumnMajor,
    VoltaBCongruous,
    VoltaCongruous,
    VoltaCrosswise,
    AmpereCongruous,
    AmpereCrosswise,
    Accum32x32,
    Accum8x8,
}

impl LayoutKind {
    /// Whether the variant permutes addresses (as opposed to padding rows)
    pub fn is_swizzled(&self) -> bool {
        matches!(
            self,
            LayoutKind::VoltaBCongruous
                | LayoutKind::VoltaCongruous
                | LayoutKind::VoltaCrosswise
                | LayoutKind::AmpereCongruous
                | LayoutKind::AmpereCrosswise
        )
    }

    /// Whether the variant maps accumulator coordinates to registers
    pub fn is_accumulator(&self) -> bool {
        matches!(self, LayoutKind::Accum32x32 | LayoutKind::Accum8x8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{layout:?} requires {dimension} to be a multiple of {multiple}, got {value}")]
    NotMultiple {
        layout: LayoutKind,
        dimension: &'static str,
        value: usize,
        multiple: usize,
    },

    #[error("{layout:?} requires a non-zero {dimension}")]
    ZeroExtent {
        layout: LayoutKind,
        dimension: &'static str,
    },
}

/// Validate a governing dimension against its hardware granularity
pub(crate) fn require_multiple(
    layout: LayoutKind,
    dimension: &'static str,
    value: usize,
    multiple: usize,
) -> Result<(), LayoutError> {
    if value == 0 {
        return Err(LayoutError::ZeroExtent { layout, dimension });
    }
    if value % multiple != 0 {
        return Err(LayoutError::NotMultiple {
            layout,
            dimension,
            value,
            multiple,
        });
    }
    Ok(())
}

/// XOR of two 1-bit indices
#[inline]
pub fn xor2x2(a: usize, b: usize) -> usize {
    (a + b) % 2
}

/// XOR of two 2-bit indices, bit by bit
#[inline]
pub fn xor4x4(a: usize, b: usize) -> usize {
    2 * xor2x2(a / 2, b / 2) + xor2x2(a % 2, b % 2)
}

/// Capability shared by every layout variant
pub trait Layout {
    fn kind(&self) -> LayoutKind;

    /// Whether bank conflicts are avoided by padding the row stride rather
    /// than by permuting addresses
    fn requires_padding(&self) -> bool {
        false
    }

    /// Physical row stride in elements; `None` for register layouts
    fn stride(&self) -> Option<usize>;

    /// Widest aligned contiguous access (in elements) that stays contiguous
    /// after addressing
    fn vectorization_width(&self) -> usize;

    /// CUTLASS shared-memory layout template implementing the same mapping
    fn smem_layout_name(&self) -> Option<String>;

    fn report(&self) -> LayoutReport {
        LayoutReport {
            kind: self.kind(),
            smem_layout_name: self.smem_layout_name(),
            stride: self.stride(),
            vectorization_width: self.vectorization_width(),
            requires_padding: self.requires_padding(),
        }
    }
}

/// What the code generator needs to know about a chosen layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutReport {
    pub kind: LayoutKind,
    pub smem_layout_name: Option<String>,
    pub stride: Option<usize>,
    pub vectorization_width: usize,
    pub requires_padding: bool,
}
