//! Candidate and resolved tile configurations

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arch::GpuArch;
use crate::graph::NodeId;

use super::common::product;

/// Block tile per node, the input of one candidate evaluation
pub type TileMap = BTreeMap<NodeId, Vec<usize>>;

/// Padded stride on a single axis of a staged buffer.
///
/// Axis `ax` steps by `stride` elements instead of the packed product of the
/// trailing extents; axes before it are packed on top of the padded one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stride {
    stride: usize,
    ax: Option<usize>,
}

impl Stride {
    pub fn new(stride: usize, ax: usize) -> Self {
        Self {
            stride,
            ax: Some(ax),
        }
    }

    /// No padding
    pub fn invalid() -> Self {
        Self { stride: 1, ax: None }
    }

    pub fn is_valid(&self) -> bool {
        self.ax.is_some()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn ax(&self) -> Option<usize> {
        self.ax
    }

    /// Per-axis element strides of `shape` laid out under this stride
    pub fn compute_strides_from_shape(&self, shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = if Some(i) == self.ax {
                self.stride
            } else {
                strides[i + 1] * shape[i + 1]
            };
        }
        strides
    }

    /// Elements occupied by `shape` including padding
    pub fn compute_elements_from_shape(&self, shape: &[usize]) -> usize {
        match self.ax {
            Some(ax) if ax < shape.len() => product(&shape[..=ax]) * self.stride,
            _ => product(shape),
        }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Padded strides a node asks for, keyed by output argument index and by
/// input tensor name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrideMaps {
    pub output: BTreeMap<usize, Stride>,
    pub tensors: BTreeMap<String, Stride>,
}

/// Per-node state of a candidate under evaluation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTile {
    pub tile: Vec<usize>,
    /// Step per reduction axis
    pub rstep: Vec<usize>,
    /// Whether the pipelined tensor-core backend is usable
    pub pipelined: bool,
    pub output_strides: BTreeMap<usize, Stride>,
    pub tensor_strides: BTreeMap<String, Stride>,
    pub cached_tensors: Vec<String>,
    /// Shared memory of one block (bytes)
    pub smem: usize,
}

impl NodeTile {
    pub fn new(tile: Vec<usize>, rstep: Vec<usize>) -> Self {
        Self {
            tile,
            rstep,
            ..Self::default()
        }
    }

    pub fn set_strides(&mut self, maps: StrideMaps) {
        self.output_strides = maps.output;
        self.tensor_strides = maps.tensors;
    }

    pub fn tensor_stride(&self, tensor: &str) -> Stride {
        self.tensor_strides.get(tensor).copied().unwrap_or_default()
    }
}

/// A fully estimated candidate. Built fresh for each tile assignment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TileDict {
    pub nodes: BTreeMap<NodeId, NodeTile>,
    /// Shared memory of one block summed over the fused nodes (bytes)
    pub smem_cost: usize,
    /// Global memory traffic of the whole kernel (bytes)
    pub traffic: usize,
    pub grid_size: usize,
    pub block_per_sm: usize,
    pub num_wave: usize,
}

impl TileDict {
    pub fn get(&self, node: NodeId) -> Option<&NodeTile> {
        self.nodes.get(&node)
    }

    pub fn tile(&self, node: NodeId) -> Option<&[usize]> {
        self.nodes.get(&node).map(|nt| nt.tile.as_slice())
    }
}

/// Resolved configuration handed to code generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeId,
    pub name: String,
    pub block: Vec<usize>,
    /// Threads per axis, non-tensor-core nodes only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread: Vec<usize>,
    /// Warp tile, tensor-core nodes only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warp: Vec<usize>,
    pub rstep: Vec<usize>,
    /// Target generation when the node runs on tensor cores
    pub use_tc: Option<GpuArch>,
    /// Native `(M, N, K)` instruction shape
    pub wmma: Option<[usize; 3]>,
    pub use_pipelined: bool,
    pub fast_decoding: bool,
    pub cached_tensors: Vec<String>,
    pub schedule_stages: Vec<String>,
    pub output_strides: BTreeMap<usize, Stride>,
    pub tensor_strides: BTreeMap<String, Stride>,
}

/// Tunable constants of the tensor-core policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcPolicyOptions {
    /// K granularity of the native instruction
    pub wmma_k: usize,
    /// Elements added to the padded stride of staged operands
    pub stride_offset: usize,
    /// Reduction extents at or below this never use the pipelined backend
    pub pipeline_min_reduce: usize,
    /// `(M, N)` fragment shapes a block tile must be divisible by
    pub fragment_shapes: Vec<[usize; 2]>,
    pub min_raster_waves: usize,
    pub max_panel_width: usize,
    /// Upper bound of the generic reduction step
    pub default_rstep_limit: usize,
}

impl Default for TcPolicyOptions {
    fn default() -> Self {
        Self {
            wmma_k: 16,
            stride_offset: 8,
            pipeline_min_reduce: 64,
            fragment_shapes: vec![[16, 16], [8, 32], [32, 8]],
            min_raster_waves: 4,
            max_panel_width: 16,
            default_rstep_limit: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_from_shape() {
        let stride = Stride::new(40, 0);
        assert_eq!(stride.compute_strides_from_shape(&[64, 32]), vec![40, 1]);
        assert_eq!(stride.compute_elements_from_shape(&[64, 32]), 64 * 40);

        let inner = Stride::new(72, 1);
        assert_eq!(inner.compute_strides_from_shape(&[4, 16, 64]), vec![16 * 72, 72, 1]);
        assert_eq!(inner.compute_elements_from_shape(&[4, 16, 64]), 4 * 16 * 72);
    }

    #[test]
    fn test_invalid_stride_is_packed() {
        let stride = Stride::invalid();
        assert!(!stride.is_valid());
        assert_eq!(stride.compute_strides_from_shape(&[8, 4, 2]), vec![8, 2, 1]);
        assert_eq!(stride.compute_elements_from_shape(&[8, 4, 2]), 64);
        assert_eq!(Stride::default(), stride);
    }

    #[test]
    fn test_missing_tensor_stride_defaults_to_invalid() {
        let nt = NodeTile::new(vec![64, 64], vec![32]);
        assert_eq!(nt.tensor_stride("A"), Stride::invalid());
    }

    #[test]
    fn test_options_partial_json() {
        let opts: TcPolicyOptions = serde_json::from_str(r#"{"stride_offset": 16}"#).unwrap();
        assert_eq!(opts.stride_offset, 16);
        assert_eq!(opts.wmma_k, 16);
        assert_eq!(opts.fragment_shapes.len(), 3);
    }
}
