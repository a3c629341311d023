//! Block Traversal Order
//!
//! How the linear block index is remapped onto the output tile grid. A
//! panel sweep walks `panel_width` rows (or columns) at a time so that the
//! blocks resident together share operand tiles in L2.
//!
//! ```text
//! Row2D, rows = 4, cols = 3, panel_width = 2
//!
//!        col 0  col 1  col 2
//! row 0    0      2      4
//! row 1    1      3      5
//! row 2    6      8     10
//! row 3    7      9     11
//! ```

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rasterization {
    /// Plain row-major block order
    #[default]
    None,
    /// Panels of `panel_width` rows, columns swept inside each panel
    #[serde(rename = "row_2d")]
    Row2D {
        rows: usize,
        cols: usize,
        panel_width: usize,
    },
    /// Panels of `panel_width` columns, rows swept inside each panel
    #[serde(rename = "column_2d")]
    Column2D {
        rows: usize,
        cols: usize,
        panel_width: usize,
    },
}

impl Rasterization {
    pub fn is_none(&self) -> bool {
        matches!(self, Rasterization::None)
    }

    /// Number of blocks in the grid, `None` for plain order
    pub fn grid_size(&self) -> Option<usize> {
        match *self {
            Rasterization::None => None,
            Rasterization::Row2D { rows, cols, .. } | Rasterization::Column2D { rows, cols, .. } => {
                Some(rows * cols)
            }
        }
    }

    /// Tile `(row, col)` processed by block `block_idx`.
    ///
    /// Plain order has no grid shape of its own and returns `None`, as does
    /// an index outside the grid.
    pub fn remap(&self, block_idx: usize) -> Option<(usize, usize)> {
        match *self {
            Rasterization::None => None,
            Rasterization::Row2D {
                rows,
                cols,
                panel_width,
            } => panel_remap(block_idx, rows, cols, panel_width),
            Rasterization::Column2D {
                rows,
                cols,
                panel_width,
            } => panel_remap(block_idx, cols, rows, panel_width).map(|(c, r)| (r, c)),
        }
    }
}

/// Panels of `width` along `major`, swept along `minor`
fn panel_remap(
    block_idx: usize,
    major: usize,
    minor: usize,
    width: usize,
) -> Option<(usize, usize)> {
    if block_idx >= major * minor || width == 0 {
        return None;
    }
    let panel = block_idx / (width * minor);
    let first = panel * width;
    // The last panel may be narrower
    let span = width.min(major - first);
    let local = block_idx - first * minor;
    Some((first + local % span, local / span))
}
