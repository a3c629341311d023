//! Accumulator fragment layouts
//!
//! Maps a logical `(i, j)` coordinate of a warp's accumulator tile to the
//! thread owning it and the slot inside that thread's registers. Tiles wider
//! than the native fragment are covered block by block, row-major over
//! blocks, each block taking the next run of slots.

use serde::{Deserialize, Serialize};

use super::{require_multiple, Layout, LayoutError, LayoutKind};

const WARP_THREADS: usize = 32;

/// Volta `mma.sync` 32×32 accumulator (quad-pair ownership)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accum32x32 {
    m: usize,
    n: usize,
}

impl Accum32x32 {
    const NATIVE: usize = 32;
    const SLOTS: usize = 32;

    pub fn new(m: usize, n: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::Accum32x32, "m", m, Self::NATIVE)?;
        require_multiple(LayoutKind::Accum32x32, "n", n, Self::NATIVE)?;
        Ok(Self { m, n })
    }

    fn map_native(i: usize, j: usize) -> (usize, usize) {
        let thread = i % 4 + ((i % 16) / 8) * 4 + ((j % 16) / 8) * 8 + (i / 16) * 16;
        let slot = j % 4 + (j / 16) * 4 + ((i % 8) / 4) * 8 + ((j % 8) / 4) * 16;
        (thread, slot)
    }

    /// `(thread, slot)` holding element `(i, j)`
    pub fn address(&self, i: usize, j: usize) -> (usize, usize) {
        let (thread, slot) = Self::map_native(i % Self::NATIVE, j % Self::NATIVE);
        let block = (i / Self::NATIVE) * (self.n / Self::NATIVE) + j / Self::NATIVE;
        (thread, slot + block * Self::SLOTS)
    }
}

impl Layout for Accum32x32 {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Accum32x32
    }

    fn stride(&self) -> Option<usize> {
        None
    }

    fn vectorization_width(&self) -> usize {
        4
    }

    fn smem_layout_name(&self) -> Option<String> {
        None
    }
}

/// 8×8 accumulator quadrant of the `m16n8` MMA (two adjacent columns per thread)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accum8x8 {
    m: usize,
    n: usize,
}

impl Accum8x8 {
    const NATIVE: usize = 8;
    const SLOTS: usize = 2;

    pub fn new(m: usize, n: usize) -> Result<Self, LayoutError> {
        require_multiple(LayoutKind::Accum8x8, "m", m, Self::NATIVE)?;
        require_multiple(LayoutKind::Accum8x8, "n", n, Self::NATIVE)?;
        Ok(Self { m, n })
    }

    fn map_native(i: usize, j: usize) -> (usize, usize) {
        (i * 4 + j / 2, j % 2)
    }

    /// `(thread, slot)` holding element `(i, j)`
    pub fn address(&self, i: usize, j: usize) -> (usize, usize) {
        let (thread, slot) = Self::map_native(i % Self::NATIVE, j % Self::NATIVE);
        let block = (i / Self::NATIVE) * (self.n / Self::NATIVE) + j / Self::NATIVE;
        (thread, slot + block * Self::SLOTS)
    }
}

impl Layout for Accum8x8 {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Accum8x8
    }

    fn stride(&self) -> Option<usize> {
        None
    }

    fn vectorization_width(&self) -> usize {
        2
    }

    fn smem_layout_name(&self) -> Option<String> {
        None
    }
}

/// Any accumulator layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentLayout {
    Accum32x32(Accum32x32),
    Accum8x8(Accum8x8),
}

impl FragmentLayout {
    pub fn address(&self, i: usize, j: usize) -> (usize, usize) {
        match self {
            FragmentLayout::Accum32x32(l) => l.address(i, j),
            FragmentLayout::Accum8x8(l) => l.address(i, j),
        }
    }

    /// Logical `(m, n)` extent
    pub fn shape(&self) -> (usize, usize) {
        match self {
            FragmentLayout::Accum32x32(l) => (l.m, l.n),
            FragmentLayout::Accum8x8(l) => (l.m, l.n),
        }
    }

    pub fn threads(&self) -> usize {
        WARP_THREADS
    }

    pub fn slots_per_thread(&self) -> usize {
        let (m, n) = self.shape();
        m * n / WARP_THREADS
    }

    /// Whether every `(thread, slot)` pair is hit exactly once
    pub fn is_bijective(&self) -> bool {
        let (m, n) = self.shape();
        let slots = self.slots_per_thread();
        let mut seen = vec![false; WARP_THREADS * slots];
        for i in 0..m {
            for j in 0..n {
                let (thread, slot) = self.address(i, j);
                if thread >= WARP_THREADS || slot >= slots {
                    return false;
                }
                let index = thread * slots + slot;
                if seen[index] {
                    return false;
                }
                seen[index] = true;
            }
        }
        true
    }

    fn inner(&self) -> &dyn Layout {
        match self {
            FragmentLayout::Accum32x32(l) => l,
            FragmentLayout::Accum8x8(l) => l,
        }
    }
}

impl Layout for FragmentLayout {
    fn kind(&self) -> LayoutKind {
        self.inner().kind()
    }

    fn stride(&self) -> Option<usize> {
        None
    }

    fn vectorization_width(&self) -> usize {
        self.inner().vectorization_width()
    }

    fn smem_layout_name(&self) -> Option<String> {
        None
    }
}

impl From<Accum32x32> for FragmentLayout {
    fn from(l: Accum32x32) -> Self {
        FragmentLayout::Accum32x32(l)
    }
}

impl From<Accum8x8> for FragmentLayout {
    fn from(l: Accum8x8) -> Self {
        FragmentLayout::Accum8x8(l)
    }
}
