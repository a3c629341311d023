//! Generic tile policy
//!
//! Hooks that hold for any contraction node: reduction steps are divisors of
//! the reduction extent, staged buffers are packed, threads are spread over
//! the output axes.

use log::trace;

use crate::arch::Arch;
use crate::graph::{Graph, Node};

use super::common::{factorize, get_all_factors};
use super::config::{NodeConfig, NodeTile, StrideMaps, TileMap};
use super::TilePolicy;

pub const DEFAULT_RSTEP_LIMIT: usize = 32;

#[derive(Clone, Debug)]
pub struct DefaultPolicy {
    graph: Graph,
    arch: Arch,
    rstep_limit: usize,
}

impl DefaultPolicy {
    pub fn new(graph: Graph, arch: Arch) -> Self {
        Self {
            graph,
            arch,
            rstep_limit: DEFAULT_RSTEP_LIMIT,
        }
    }

    pub fn with_rstep_limit(mut self, limit: usize) -> Self {
        self.rstep_limit = limit.max(1);
        self
    }

    /// Shapes staged in shared memory per input. Fused inputs are staged
    /// whole along the reduction axes.
    pub fn staged_input_shapes(&self, node: &Node, nt: &NodeTile) -> Vec<Vec<usize>> {
        let stepped = node.propagate_reduction_inputs(&nt.tile, &nt.rstep);
        let full = node.propagate_inputs(&nt.tile);
        node.inputs
            .iter()
            .zip(stepped.into_iter().zip(full))
            .map(|(edge, (stepped, full))| if edge.is_placeholder() { stepped } else { full })
            .collect()
    }
}

impl TilePolicy for DefaultPolicy {
    fn kind(&self) -> &'static str {
        "default"
    }

    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn arch(&self) -> &Arch {
        &self.arch
    }

    fn check_tile_shape_isvalid(&self, tile_map: &TileMap) -> bool {
        for node in self.graph.nodes() {
            let Some(tile) = tile_map.get(&node.id) else {
                trace!("no tile for node {}", node.name);
                return false;
            };
            if tile.len() != node.ndim() {
                trace!(
                    "tile {:?} has rank {}, node {} has rank {}",
                    tile,
                    tile.len(),
                    node.name,
                    node.ndim()
                );
                return false;
            }
            if tile.iter().zip(&node.space).any(|(&t, &dim)| t == 0 || t > dim) {
                trace!("tile {:?} out of range for {} {:?}", tile, node.name, node.space);
                return false;
            }
        }
        true
    }

    fn get_node_reduce_step_candidates(&self, node: &Node) -> Vec<Vec<usize>> {
        node.reduce.iter().map(|r| get_all_factors(r.extent)).collect()
    }

    fn assign_reduce_step(&self, node: &Node) -> Vec<usize> {
        node.reduce
            .iter()
            .map(|r| {
                get_all_factors(r.extent)
                    .into_iter()
                    .filter(|&f| f <= self.rstep_limit)
                    .max()
                    .unwrap_or(1)
            })
            .collect()
    }

    fn compute_node_stride_map(&self, _node: &Node, _nt: &NodeTile) -> StrideMaps {
        StrideMaps::default()
    }

    fn infer_node_smem_usage(&self, node: &Node, nt: &NodeTile) -> (usize, Vec<String>) {
        let shapes = self.staged_input_shapes(node, nt);
        let elements: usize = node
            .inputs
            .iter()
            .zip(&shapes)
            .map(|(edge, shape)| nt.tensor_stride(&edge.tensor).compute_elements_from_shape(shape))
            .sum();
        let cached = node.inputs.iter().map(|edge| edge.tensor.clone()).collect();
        (elements * node.dtype.size_bytes(), cached)
    }

    fn assign_block_size(
        &self,
        node: &Node,
        nt: &NodeTile,
        block_size: usize,
    ) -> Option<NodeConfig> {
        if block_size == 0 {
            return None;
        }
        let tile = &nt.tile;
        let mut thread = vec![1; tile.len()];
        // Largest factor first, onto the axis with the most work left per thread
        for factor in factorize(block_size).into_iter().rev() {
            let axis = (0..tile.len())
                .filter(|&i| tile[i] % (thread[i] * factor) == 0)
                .max_by_key(|&i| (tile[i] / thread[i], std::cmp::Reverse(i)))?;
            thread[axis] *= factor;
        }

        Some(NodeConfig {
            node: node.id,
            name: node.name.clone(),
            block: tile.clone(),
            thread,
            warp: Vec::new(),
            rstep: nt.rstep.clone(),
            use_tc: None,
            wmma: None,
            use_pipelined: false,
            fast_decoding: node.fast_decoding,
            cached_tensors: nt.cached_tensors.clone(),
            schedule_stages: node.schedule_stages.clone(),
            output_strides: nt.output_strides.clone(),
            tensor_strides: nt.tensor_strides.clone(),
        })
    }
}
