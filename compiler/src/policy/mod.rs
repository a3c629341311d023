//! Tile Search Policies
//!
//! A policy judges one candidate tile assignment for the nodes of a fused
//! kernel and, when the candidate is feasible, resolves it into per-node
//! configurations for code generation.
//!
//! The search itself is owned by the caller. Every hook here is a pure
//! function of the graph, the hardware description and the candidate, so
//! candidates can be evaluated in parallel. An infeasible candidate is
//! reported as `None` (or `false`), never as an error.
//!
//! - [`DefaultPolicy`] implements the generic hooks.
//! - [`TcPolicy`] overrides them for tensor-core nodes.

pub mod common;
pub mod config;
pub mod default;
pub mod tc;

pub use config::{NodeConfig, NodeTile, Stride, StrideMaps, TcPolicyOptions, TileDict, TileMap};
pub use default::DefaultPolicy;
pub use tc::{LayoutReports, OperandLayouts, Plan, TcPolicy, TcStrides, WarpPartition};

use log::{debug, trace};

use crate::arch::Arch;
use crate::graph::{Graph, Node};
use crate::rasterization::Rasterization;

use common::{ceil_div, product};

/// Hooks of the tile search.
///
/// `evaluate` and `emit_config` drive the hooks in a fixed order; policies
/// override the hooks, not the drivers.
pub trait TilePolicy: Send + Sync {
    /// A short identifier for this policy type.
    fn kind(&self) -> &'static str;

    fn graph(&self) -> &Graph;

    fn arch(&self) -> &Arch;

    /// Whether every node's tile is structurally acceptable
    fn check_tile_shape_isvalid(&self, tile_map: &TileMap) -> bool;

    /// Legal steps per reduction axis
    fn get_node_reduce_step_candidates(&self, node: &Node) -> Vec<Vec<usize>>;

    /// Initial step per reduction axis
    fn assign_reduce_step(&self, node: &Node) -> Vec<usize>;

    /// Whether the pipelined tensor-core backend can run this tile
    fn use_pipelined(&self, _node: &Node, _tile: &[usize]) -> bool {
        false
    }

    /// Padded strides for the node's staged buffers
    fn compute_node_stride_map(&self, node: &Node, nt: &NodeTile) -> StrideMaps;

    /// Shared memory of one block (bytes) and the tensors it caches
    fn infer_node_smem_usage(&self, node: &Node, nt: &NodeTile) -> (usize, Vec<String>);

    /// Split a block of `block_size` threads over the tile
    fn assign_block_size(&self, node: &Node, nt: &NodeTile, block_size: usize)
        -> Option<NodeConfig>;

    fn plan_rasterization(&self, _td: &TileDict) -> Rasterization {
        Rasterization::None
    }

    /// Estimate a candidate; `None` when it is infeasible
    fn evaluate(&self, tile_map: &TileMap) -> Option<TileDict> {
        if !self.check_tile_shape_isvalid(tile_map) {
            return None;
        }
        let arch = self.arch();
        let nodes = self.graph().nodes();
        let mut td = TileDict::default();

        for (index, node) in nodes.iter().enumerate() {
            let tile = tile_map.get(&node.id)?.clone();
            let mut nt = NodeTile::new(tile, self.assign_reduce_step(node));
            nt.pipelined = self.use_pipelined(node, &nt.tile);
            let strides = self.compute_node_stride_map(node, &nt);
            nt.set_strides(strides);
            let (smem, cached) = self.infer_node_smem_usage(node, &nt);
            nt.smem = smem;
            nt.cached_tensors = cached;

            let is_output = index + 1 == nodes.len();
            td.smem_cost += smem;
            td.traffic += global_traffic(node, &nt.tile, is_output);
            if is_output {
                td.grid_size = grid_size(node, &nt.tile);
            }
            td.nodes.insert(node.id, nt);
        }

        if td.smem_cost > arch.smem_capacity {
            trace!(
                "{}: candidate needs {} bytes of shared memory, capacity is {}",
                self.kind(),
                td.smem_cost,
                arch.smem_capacity
            );
            return None;
        }
        td.block_per_sm = match td.smem_cost {
            0 => arch.max_blocks_per_sm,
            smem => (arch.smem_capacity / smem).min(arch.max_blocks_per_sm),
        };
        td.num_wave = ceil_div(td.grid_size, arch.sm_count * td.block_per_sm);
        Some(td)
    }

    /// Resolve every node of an evaluated candidate
    fn emit_config(&self, td: &TileDict, block_size: usize) -> Option<Vec<NodeConfig>> {
        let mut configs = Vec::with_capacity(self.graph().len());
        for node in self.graph().nodes() {
            let nt = td.get(node.id)?;
            let Some(config) = self.assign_block_size(node, nt, block_size) else {
                trace!(
                    "{}: no thread assignment of {} threads for {} with tile {:?}",
                    self.kind(),
                    block_size,
                    node.name,
                    nt.tile
                );
                return None;
            };
            debug!("{}: resolved {}: {:?}", self.kind(), node.name, config);
            configs.push(config);
        }
        Some(configs)
    }
}

/// Number of blocks launched for a node
pub fn grid_size(node: &Node, tile: &[usize]) -> usize {
    node.space
        .iter()
        .zip(tile)
        .map(|(&dim, &t)| ceil_div(dim, t))
        .product()
}

/// Bytes moved between global memory and the node's blocks
pub fn global_traffic(node: &Node, tile: &[usize], is_output: bool) -> usize {
    let shapes = node.propagate_inputs(tile);
    let mut elements: usize = node
        .inputs
        .iter()
        .zip(&shapes)
        .filter(|(edge, _)| edge.is_placeholder())
        .map(|(_, shape)| product(shape))
        .sum();
    if is_output {
        elements += product(tile);
    }
    grid_size(node, tile) * elements * node.dtype.size_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_and_traffic() {
        let node = Node::matmul(0, "gemm", 256, 128, 64, false);
        assert_eq!(grid_size(&node, &[64, 64]), 8);
        // Per block: A 64x64, B 64x64, C 64x64 half-precision elements
        assert_eq!(global_traffic(&node, &[64, 64], true), 8 * 3 * 4096 * 2);
        assert_eq!(global_traffic(&node, &[64, 64], false), 8 * 2 * 4096 * 2);
    }

    #[test]
    fn test_fused_input_has_no_global_traffic() {
        let node = Node::matmul(1, "gemm", 64, 64, 64, false).with_producer(0, 0);
        assert_eq!(global_traffic(&node, &[64, 64], false), 4096 * 2);
    }

    #[test]
    fn test_fused_kernel_traffic() {
        let producer = Node::matmul(0, "p", 64, 64, 64, false).without_tensor_core();
        let consumer = Node::matmul(1, "c", 64, 64, 64, false)
            .without_tensor_core()
            .with_producer(0, 0);
        let graph = Graph::new(vec![producer, consumer]).unwrap();
        let p = DefaultPolicy::new(graph, Arch::default());
        let td = p
            .evaluate(&TileMap::from([(0, vec![64, 64]), (1, vec![64, 64])]))
            .unwrap();
        // Producer reads A and B; consumer reads B and writes C
        assert_eq!(td.traffic, (2 * 4096 + 2 * 4096) * 2);
        assert_eq!(td.grid_size, 1);
    }
}
