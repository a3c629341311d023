//! Shared-memory operand layouts
//!
//! One-dimensional address maps for GEMM operand tiles. `RowMajor` and
//! `ColumnMajor` keep the identity mapping and rely on stride padding; the
//! Volta and Ampere variants permute 128-bit vectors inside each row group.

use serde::{Deserialize, Serialize};

use super::{require_multiple, xor2x2, xor4x4, Layout, LayoutError, LayoutKind};

/// Which multiplicand a layout stages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandRole {
    A,
    B,
}

// =============================================================================
// Identity layouts
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMajor {
    ldm: usize,
    pad: usize,
}

impl RowMajor {
    pub fn new(ldm: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::RowMajor, "ldm", ldm, 1)?;
        Ok(Self { ldm, pad: 0 })
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    pub fn set_pad(&mut self, pad: usize) {
        self.pad = pad;
    }

    pub fn ldm(&self) -> usize {
        self.ldm
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    pub fn address(&self, offset: usize) -> usize {
        offset
    }
}

impl Layout for RowMajor {
    fn kind(&self) -> LayoutKind {
        LayoutKind::RowMajor
    }

    fn requires_padding(&self) -> bool {
        true
    }

    fn stride(&self) -> Option<usize> {
        Some(self.ldm + self.pad)
    }

    fn vectorization_width(&self) -> usize {
        gcd(gcd(8, self.ldm + self.pad), self.ldm)
    }

    fn smem_layout_name(&self) -> Option<String> {
        Some("cutlass::layout::RowMajor".to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMajor {
    ldm: usize,
}

impl ColumnMajor {
    pub fn new(ldm: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::ColumnMajor, "ldm", ldm, 1)?;
        Ok(Self { ldm })
    }

    pub fn ldm(&self) -> usize {
        self.ldm
    }

    pub fn address(&self, offset: usize) -> usize {
        offset
    }
}

impl Layout for ColumnMajor {
    fn kind(&self) -> LayoutKind {
        LayoutKind::ColumnMajor
    }

    fn requires_padding(&self) -> bool {
        true
    }

    fn stride(&self) -> Option<usize> {
        Some(self.ldm)
    }

    fn vectorization_width(&self) -> usize {
        gcd(8, self.ldm)
    }

    fn smem_layout_name(&self) -> Option<String> {
        Some("cutlass::layout::ColumnMajor".to_string())
    }
}

// =============================================================================
// Volta (SM70) multiplicand layouts
// =============================================================================

/// Volta congruous layout: the contiguous axis is the operand's M or N axis.
///
/// Vectors of 8 halves are grouped in 4-row × 8-vector tiles (64 halves =
/// all 32 banks per row). Inside a tile the row/vector pair is re-dealt so a
/// quad-pair access touches every bank once. Operand A and operand B split
/// the vector residual differently to match their quad-pair ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltaCongruous {
    ldm: usize,
    role: OperandRole,
}

impl VoltaCongruous {
    const ACCESS: usize = 8;
    const TILE_CONTIGUOUS: usize = 8;
    const TILE_STRIDED: usize = 4;

    pub fn new(ldm: usize, role: OperandRole) -> Result<Self, LayoutError> {
        let kind = Self::kind_for(role);
        require_multiple(kind, "ldm", ldm, 64)?;
        Ok(Self { ldm, role })
    }

    pub fn operand_a(ldm: usize) -> Result<Self, LayoutError> {
        Self::new(ldm, OperandRole::A)
    }

    pub fn operand_b(ldm: usize) -> Result<Self, LayoutError> {
        Self::new(ldm, OperandRole::B)
    }

    fn kind_for(role: OperandRole) -> LayoutKind {
        match role {
            OperandRole::A => LayoutKind::VoltaCongruous,
            OperandRole::B => LayoutKind::VoltaBCongruous,
        }
    }

    pub fn ldm(&self) -> usize {
        self.ldm
    }

    pub fn address(&self, offset: usize) -> usize {
        let (i, j) = (offset / self.ldm, offset % self.ldm);
        let vec_contiguous = j / Self::ACCESS;
        let tile_contiguous = vec_contiguous / Self::TILE_CONTIGUOUS;
        let tile_strided = i / Self::TILE_STRIDED;
        let residual_contiguous = vec_contiguous % Self::TILE_CONTIGUOUS;
        let residual_strided = i % Self::TILE_STRIDED;

        let (permuted_strided, permuted_contiguous) = match self.role {
            OperandRole::B => {
                let strided = residual_contiguous % 4;
                let contiguous =
                    (residual_contiguous / 4) * 4 + xor4x4(residual_strided, strided);
                (strided, contiguous)
            }
            OperandRole::A => {
                let strided = residual_contiguous / 2;
                let contiguous =
                    (residual_contiguous % 2) * 4 + xor4x4(residual_strided, strided);
                (strided, contiguous)
            }
        };

        let element_strided = permuted_strided + tile_strided * Self::TILE_STRIDED;
        let element_contiguous = j % Self::ACCESS
            + (permuted_contiguous + tile_contiguous * Self::TILE_CONTIGUOUS) * Self::ACCESS;
        element_strided * self.ldm + element_contiguous
    }
}

impl Layout for VoltaCongruous {
    fn kind(&self) -> LayoutKind {
        Self::kind_for(self.role)
    }

    fn stride(&self) -> Option<usize> {
        Some(self.ldm)
    }

    fn vectorization_width(&self) -> usize {
        Self::ACCESS
    }

    fn smem_layout_name(&self) -> Option<String> {
        let name = match self.role {
            OperandRole::A => "cutlass::layout::RowMajorVoltaTensorOpMultiplicandCongruous<16>",
            OperandRole::B => "cutlass::layout::RowMajorVoltaTensorOpMultiplicandBCongruous<16>",
        };
        Some(name.to_string())
    }
}

/// Volta crosswise layout: the contiguous axis is K.
///
/// The logical tile is `mblock` rows of `kblock` halves. Physically each
/// 4-element K vector becomes a row of `mblock` vectors, and the M index is
/// bit-shuffled within groups of 16 so consecutive K vectors rotate banks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltaCrosswise {
    mblock: usize,
    kblock: usize,
}

impl VoltaCrosswise {
    const ACCESS: usize = 4;

    pub fn new(mblock: usize, kblock: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::VoltaCrosswise, "mblock", mblock, 32)?;
        require_multiple(LayoutKind::VoltaCrosswise, "kblock", kblock, 32)?;
        Ok(Self { mblock, kblock })
    }

    pub fn mblock(&self) -> usize {
        self.mblock
    }

    pub fn kblock(&self) -> usize {
        self.kblock
    }

    pub fn address(&self, offset: usize) -> usize {
        let (i, j) = (offset / self.kblock, offset % self.kblock);
        let vec_contiguous = j / Self::ACCESS;
        let vec_strided = i;
        let within_tile = vec_contiguous % 8;

        let bit2 = xor2x2(
            xor2x2((vec_strided % 32) / 16, (vec_strided % 16) / 8),
            within_tile / 4,
        );
        let bit1 = xor2x2((vec_strided % 8) / 4, (within_tile % 4) / 2);
        let permuted =
            (vec_strided / 16) * 16 + (vec_strided % 4) * 4 + bit2 * 2 + bit1;

        j % Self::ACCESS + permuted * Self::ACCESS + vec_contiguous * self.mblock * Self::ACCESS
    }
}

impl Layout for VoltaCrosswise {
    fn kind(&self) -> LayoutKind {
        LayoutKind::VoltaCrosswise
    }

    fn stride(&self) -> Option<usize> {
        Some(self.mblock)
    }

    fn vectorization_width(&self) -> usize {
        Self::ACCESS
    }

    fn smem_layout_name(&self) -> Option<String> {
        Some(format!(
            "cutlass::layout::RowMajorVoltaTensorOpMultiplicandCrosswise<16, {}>",
            self.kblock
        ))
    }
}

// =============================================================================
// Ampere (SM80+) multiplicand layouts
// =============================================================================

/// Ampere tensor-op multiplicand layout.
///
/// Congruous (K-factor 1) and crosswise (K-factor 2) share one algorithm:
/// `kfactor` consecutive logical rows are folded into one physical row, the
/// folded row is cut into tiles of `8 / kfactor` vectors and each 4×4
/// partition of a tile is XOR-swizzled, then the partitions themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmpereSwizzle {
    ldm: usize,
    kfactor: usize,
}

impl AmpereSwizzle {
    const ACCESS: usize = 8;
    const PARTITION: usize = 4;

    /// M- or N-contiguous operand tile
    pub fn congruous(ldm: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::AmpereCongruous, "ldm", ldm, 64)?;
        Ok(Self { ldm, kfactor: 1 })
    }

    /// K-contiguous operand tile
    pub fn crosswise(ldm: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::AmpereCrosswise, "ldm", ldm, 32)?;
        Ok(Self { ldm, kfactor: 2 })
    }

    pub fn ldm(&self) -> usize {
        self.ldm
    }

    pub fn kfactor(&self) -> usize {
        self.kfactor
    }

    fn tile_vectors(&self) -> usize {
        8 / self.kfactor
    }

    pub fn address(&self, offset: usize) -> usize {
        let tile = self.tile_vectors();
        let (i, j) = (offset / self.ldm, offset % self.ldm);
        let vec_contiguous = j / Self::ACCESS;
        let vec_strided = i / self.kfactor;

        let tile_contiguous_idx = vec_contiguous / tile;
        let tile_contiguous_residual = vec_contiguous % tile + (i % self.kfactor) * tile;
        let tile_strided_residual = vec_strided % tile;

        let partition_contiguous_idx = tile_contiguous_residual / Self::PARTITION;
        let partition_strided_idx = tile_strided_residual / Self::PARTITION;
        let partition_contiguous_residual = tile_contiguous_residual % Self::PARTITION;
        let partition_strided_residual = tile_strided_residual % Self::PARTITION;

        let permuted_vec = xor4x4(partition_contiguous_residual, partition_strided_residual);
        let permuted_partition = xor2x2(partition_contiguous_idx, partition_strided_idx);

        let element_contiguous = Self::ACCESS
            * (permuted_vec
                + tile_contiguous_idx * tile * self.kfactor
                + permuted_partition * Self::PARTITION)
            + j % Self::ACCESS;

        vec_strided * self.ldm * self.kfactor + element_contiguous
    }
}

impl Layout for AmpereSwizzle {
    fn kind(&self) -> LayoutKind {
        if self.kfactor == 1 {
            LayoutKind::AmpereCongruous
        } else {
            LayoutKind::AmpereCrosswise
        }
    }

    fn stride(&self) -> Option<usize> {
        Some(self.ldm)
    }

    fn vectorization_width(&self) -> usize {
        Self::ACCESS
    }

    fn smem_layout_name(&self) -> Option<String> {
        let name = if self.kfactor == 1 {
            "cutlass::layout::RowMajorTensorOpMultiplicandCongruous<16, 64>"
        } else {
            "cutlass::layout::RowMajorTensorOpMultiplicandCrosswise<16, 32>"
        };
        Some(name.to_string())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Any one-dimensional shared-memory layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedLayout {
    RowMajor(RowMajor),
    ColumnMajor(ColumnMajor),
    VoltaCongruous(VoltaCongruous),
    VoltaCrosswise(VoltaCrosswise),
    Ampere(AmpereSwizzle),
}

impl SharedLayout {
    /// Physical offset of a logical offset
    pub fn address(&self, offset: usize) -> usize {
        match self {
            SharedLayout::RowMajor(l) => l.address(offset),
            SharedLayout::ColumnMajor(l) => l.address(offset),
            SharedLayout::VoltaCongruous(l) => l.address(offset),
            SharedLayout::VoltaCrosswise(l) => l.address(offset),
            SharedLayout::Ampere(l) => l.address(offset),
        }
    }

    /// Length of one logical row
    pub fn row_len(&self) -> usize {
        match self {
            SharedLayout::RowMajor(l) => l.ldm(),
            SharedLayout::ColumnMajor(l) => l.ldm(),
            SharedLayout::VoltaCongruous(l) => l.ldm(),
            SharedLayout::VoltaCrosswise(l) => l.kblock(),
            SharedLayout::Ampere(l) => l.ldm(),
        }
    }

    /// Number of logical rows the permutation is closed over
    pub fn row_granularity(&self) -> usize {
        match self {
            SharedLayout::RowMajor(_) | SharedLayout::ColumnMajor(_) => 1,
            SharedLayout::VoltaCongruous(_) => VoltaCongruous::TILE_STRIDED,
            SharedLayout::VoltaCrosswise(l) => l.mblock(),
            SharedLayout::Ampere(l) => l.kfactor(),
        }
    }

    /// Largest footprint in rows, for layouts laid out over one fixed block
    pub fn max_rows(&self) -> Option<usize> {
        match self {
            SharedLayout::VoltaCrosswise(l) => Some(l.mblock()),
            _ => None,
        }
    }

    /// Whether `rows` logical rows form a footprint the layout permutes
    pub fn accepts_rows(&self, rows: usize) -> bool {
        rows > 0
            && rows % self.row_granularity() == 0
            && self.max_rows().map_or(true, |max| rows <= max)
    }

    /// Elements covered by `rows` logical rows
    pub fn footprint(&self, rows: usize) -> usize {
        rows * self.row_len()
    }

    /// Physical offsets of every logical offset in a `rows`-row footprint
    pub fn permutation(&self, rows: usize) -> Vec<usize> {
        (0..self.footprint(rows)).map(|o| self.address(o)).collect()
    }

    /// Logical offset for every physical offset, or `None` when the map is
    /// not a bijection over the footprint
    pub fn inverse_table(&self, rows: usize) -> Option<Vec<usize>> {
        let size = self.footprint(rows);
        let mut inverse = vec![usize::MAX; size];
        for logical in 0..size {
            let physical = self.address(logical);
            if physical >= size || inverse[physical] != usize::MAX {
                return None;
            }
            inverse[physical] = logical;
        }
        Some(inverse)
    }

    pub fn is_bijective(&self, rows: usize) -> bool {
        self.inverse_table(rows).is_some()
    }

    fn inner(&self) -> &dyn Layout {
        match self {
            SharedLayout::RowMajor(l) => l,
            SharedLayout::ColumnMajor(l) => l,
            SharedLayout::VoltaCongruous(l) => l,
            SharedLayout::VoltaCrosswise(l) => l,
            SharedLayout::Ampere(l) => l,
        }
    }
}

impl Layout for SharedLayout {
    fn kind(&self) -> LayoutKind {
        self.inner().kind()
    }

    fn requires_padding(&self) -> bool {
        self.inner().requires_padding()
    }

    fn stride(&self) -> Option<usize> {
        self.inner().stride()
    }

    fn vectorization_width(&self) -> usize {
        self.inner().vectorization_width()
    }

    fn smem_layout_name(&self) -> Option<String> {
        self.inner().smem_layout_name()
    }
}

impl From<RowMajor> for SharedLayout {
    fn from(l: RowMajor) -> Self {
        SharedLayout::RowMajor(l)
    }
}

impl From<ColumnMajor> for SharedLayout {
    fn from(l: ColumnMajor) -> Self {
        SharedLayout::ColumnMajor(l)
    }
}

impl From<VoltaCongruous> for SharedLayout {
    fn from(l: VoltaCongruous) -> Self {
        SharedLayout::VoltaCongruous(l)
    }
}

impl From<VoltaCrosswise> for SharedLayout {
    fn from(l: VoltaCrosswise) -> Self {
        SharedLayout::VoltaCrosswise(l)
    }
}

impl From<AmpereSwizzle> for SharedLayout {
    fn from(l: AmpereSwizzle) -> Self {
        SharedLayout::Ampere(l)
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
