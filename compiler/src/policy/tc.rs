//! Tensor-Core Tiling Policy
//!
//! Overrides the generic hooks for nodes tagged with tensor-core M/N axes:
//!
//! - block tiles must be divisible by a native fragment shape and must
//!   divide the iteration space exactly;
//! - reduction steps are multiples of the instruction's K granularity;
//! - staged operands get a padded stride unless a swizzled layout is used;
//! - warps are laid out by a greedy search over the M/N axes;
//! - the pipelined backend double-buffers shared memory on Ampere and newer.
//!
//! Non-tensor-core nodes fall through to [`DefaultPolicy`].

use std::collections::BTreeMap;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::arch::{Arch, Platform};
use crate::graph::{Graph, Node, NodeId, TcNode};
use crate::layout::{
    Accum32x32, Accum8x8, AmpereSwizzle, FragmentLayout, Layout, LayoutError, LayoutReport,
    OperandRole, RowMajor, SharedLayout, VoltaCongruous, VoltaCrosswise,
};
use crate::rasterization::Rasterization;

use super::common::{ceil_div, factorize, get_all_factors, product};
use super::config::{NodeConfig, NodeTile, Stride, StrideMaps, TcPolicyOptions, TileDict, TileMap};
use super::default::DefaultPolicy;
use super::TilePolicy;

/// Padded strides of operand A, operand B and the output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcStrides {
    pub a: Stride,
    pub b: Stride,
    pub c: Stride,
}

/// Result of the warp search
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpPartition {
    /// Native `(M, N, K)` instruction shape the warp tile is built from
    pub wmma: [usize; 3],
    pub warp: Vec<usize>,
}

/// Layouts chosen for one tensor-core node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperandLayouts {
    pub a: SharedLayout,
    pub b: SharedLayout,
    pub accumulator: FragmentLayout,
}

impl OperandLayouts {
    pub fn reports(&self) -> LayoutReports {
        LayoutReports {
            a: self.a.report(),
            b: self.b.report(),
            accumulator: self.accumulator.report(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutReports {
    pub a: LayoutReport,
    pub b: LayoutReport,
    pub accumulator: LayoutReport,
}

/// Everything code generation needs for one feasible candidate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub configs: Vec<NodeConfig>,
    pub layouts: BTreeMap<NodeId, LayoutReports>,
    pub rasterization: Rasterization,
    pub smem_cost: usize,
    pub traffic: usize,
    pub num_wave: usize,
}

#[derive(Clone, Debug)]
pub struct TcPolicy {
    base: DefaultPolicy,
    options: TcPolicyOptions,
}

impl TcPolicy {
    pub fn new(graph: Graph, arch: Arch) -> Self {
        Self::with_options(graph, arch, TcPolicyOptions::default())
    }

    pub fn with_options(graph: Graph, arch: Arch, options: TcPolicyOptions) -> Self {
        let base = DefaultPolicy::new(graph, arch).with_rstep_limit(options.default_rstep_limit);
        Self { base, options }
    }

    pub fn options(&self) -> &TcPolicyOptions {
        &self.options
    }

    pub fn base(&self) -> &DefaultPolicy {
        &self.base
    }

    /// Padded strides of the staged operands and the output tile.
    ///
    /// The padded axis is the outer of the two MMA axes of each tensor; it
    /// steps by the packed trailing extent plus `stride_offset`. An empty
    /// `rstep` stages the full reduction extent. `None` when the tile rank
    /// does not match the node.
    pub fn compute_strides(
        &self,
        tc: TcNode<'_>,
        tile: &[usize],
        rstep: &[usize],
    ) -> Option<TcStrides> {
        let axes = tc.axes();
        if tile.len() != tc.node().ndim() {
            trace!(
                "{}: tile {:?} does not match rank {}",
                tc.node().name,
                tile,
                tc.node().ndim()
            );
            return None;
        }
        let shapes = tc.node().propagate_reduction_inputs(tile, rstep);
        let offset = self.options.stride_offset;
        let padded = |shape: &[usize], high: usize| {
            let trailing = shape.get(high + 1..).map_or(1, product);
            Stride::new(trailing + offset, high)
        };
        Some(TcStrides {
            a: padded(shapes[0].as_slice(), axes.a_m.min(axes.a_k)),
            b: padded(shapes[1].as_slice(), axes.b_n.min(axes.b_k)),
            c: padded(tile, axes.c_m.min(axes.c_n)),
        })
    }

    /// Whether the pipelined backend can run `tile`
    pub fn usable(&self, tc: TcNode<'_>, tile: &[usize]) -> bool {
        let node = tc.node();
        let axes = tc.axes();
        let Some((tile_m, tile_n)) = mn_extents(tile, axes.c_m, axes.c_n) else {
            return false;
        };
        let [mma_m, mma_n, _] = self.arch().pipelined_mma;

        if tile_m % mma_m != 0 || tile_n % mma_n != 0 {
            trace!(
                "{}: tile {}x{} not a multiple of the {}x{} warp MMA",
                node.name,
                tile_m,
                tile_n,
                mma_m,
                mma_n
            );
            return false;
        }
        if !node.inputs.iter().all(|edge| edge.is_placeholder()) {
            trace!("{}: fused input cannot be pipelined", node.name);
            return false;
        }
        if !node
            .reduce
            .iter()
            .all(|r| r.extent > self.options.pipeline_min_reduce)
        {
            trace!("{}: reduction too short to pipeline", node.name);
            return false;
        }
        let batched = tile
            .iter()
            .enumerate()
            .any(|(i, &t)| i != axes.c_m && i != axes.c_n && t != 1);
        if batched {
            trace!("{}: batched tile {:?} cannot be pipelined", node.name, tile);
            return false;
        }
        true
    }

    /// Per operand, whether a swizzled shared-memory layout fits the tile.
    ///
    /// A K-contiguous operand needs the K step and its M/N extent to be
    /// multiples of 32; otherwise its M/N extent must be a multiple of 64.
    pub fn layout_ok(&self, tc: TcNode<'_>, tile: &[usize], rstep: &[usize]) -> [bool; 2] {
        let axes = tc.axes();
        let Some((tile_m, tile_n)) = mn_extents(tile, axes.c_m, axes.c_n) else {
            return [false, false];
        };
        let tile_k = tile_k(tc.node(), rstep);
        let fits = |k_contiguous: bool, extent: usize| {
            if k_contiguous {
                tile_k % 32 == 0 && extent % 32 == 0
            } else {
                extent % 64 == 0
            }
        };
        [
            fits(axes.a_is_k_contiguous(), tile_m),
            fits(axes.b_is_k_contiguous(), tile_n),
        ]
    }

    /// Greedy warp layout for `block_size` threads over `tile`.
    ///
    /// Starts from the native instruction tile and multiplies it by the
    /// factors of the warp-tile count, largest first, each time along the
    /// M or N axis with the lowest shared-memory read score. Other axes of
    /// the warp tile stay 1.
    pub fn assign_warp_tile(
        &self,
        tc: TcNode<'_>,
        tile: &[usize],
        block_size: usize,
        pipelined: bool,
    ) -> Option<WarpPartition> {
        let node = tc.node();
        let axes = tc.axes();
        let warp_size = self.arch().warp_size;
        if block_size == 0 || block_size % warp_size != 0 {
            trace!(
                "{}: block size {} is not a multiple of the warp size {}",
                node.name,
                block_size,
                warp_size
            );
            return None;
        }
        let warps = block_size / warp_size;
        let (tile_m, tile_n) = mn_extents(tile, axes.c_m, axes.c_n)?;

        let k = self.options.wmma_k;
        let wmma = if pipelined {
            self.arch().pipelined_mma
        } else if tile_m > tile_n {
            [32, 8, k]
        } else if tile_m < tile_n {
            [8, 32, k]
        } else {
            [16, 16, k]
        };
        if tile_m % wmma[0] != 0 || tile_n % wmma[1] != 0 {
            trace!("{}: tile {:?} not divisible by wmma {:?}", node.name, tile, wmma);
            return None;
        }

        let mut warp = vec![1; tile.len()];
        warp[axes.c_m] = wmma[0];
        warp[axes.c_n] = wmma[1];
        // Warps only split the M/N plane; ties go to the lower axis
        let mn_axes = [axes.c_m.min(axes.c_n), axes.c_m.max(axes.c_n)];
        let space = (tile_m / wmma[0]) * (tile_n / wmma[1]);
        if space % warps != 0 {
            trace!(
                "{}: {} instruction tiles do not split over {} warps",
                node.name,
                space,
                warps
            );
            return None;
        }

        for factor in factorize(space / warps).into_iter().rev() {
            let mut best: Option<(f64, usize)> = None;
            for axis in mn_axes {
                if tile[axis] % (warp[axis] * factor) != 0 {
                    continue;
                }
                warp[axis] *= factor;
                let score = self.warp_score(node, tile, &warp);
                warp[axis] /= factor;
                if best.map_or(true, |(s, _)| score < s) {
                    best = Some((score, axis));
                }
            }
            let Some((_, axis)) = best else {
                trace!(
                    "{}: no axis of {:?} takes factor {} of warp tile {:?}",
                    node.name,
                    tile,
                    factor,
                    warp
                );
                return None;
            };
            warp[axis] *= factor;
        }

        Some(WarpPartition { wmma, warp })
    }

    /// Shared-memory elements read per unit bandwidth for a warp tile; lower
    /// is better
    fn warp_score(&self, node: &Node, tile: &[usize], warp: &[usize]) -> f64 {
        let warp_grid: Vec<usize> = tile.iter().zip(warp).map(|(&t, &w)| ceil_div(t, w)).collect();
        let shapes = node.propagate_inputs(&warp_grid);
        let bandwidth = self.arch().shared_bandwidth();
        shapes.iter().map(|s| product(s) as f64 / bandwidth).sum()
    }

    /// Shared-memory layouts for both operands and the accumulator.
    ///
    /// Operands take a swizzled layout when the pipelined backend is in use
    /// and the tile admits one, and a padded row-major layout otherwise.
    pub fn select_layouts(
        &self,
        tc: TcNode<'_>,
        nt: &NodeTile,
        config: &NodeConfig,
    ) -> Result<OperandLayouts, LayoutError> {
        let node = tc.node();
        let axes = tc.axes();
        let extent = |tile: &[usize], axis: usize| tile.get(axis).copied().unwrap_or(0);
        let tile_m = extent(nt.tile.as_slice(), axes.c_m);
        let tile_n = extent(nt.tile.as_slice(), axes.c_n);
        let tile_k = tile_k(node, &nt.rstep);
        let swizzle = self.layout_ok(tc, &nt.tile, &nt.rstep);
        let staged = self.base.staged_input_shapes(node, nt);

        let a = self.operand_layout(
            OperandRole::A,
            nt.pipelined && swizzle[0],
            axes.a_is_k_contiguous(),
            (tile_m, tile_k),
            &staged[0],
            nt.tensor_stride(&node.inputs[0].tensor),
        )?;
        let b = self.operand_layout(
            OperandRole::B,
            nt.pipelined && swizzle[1],
            axes.b_is_k_contiguous(),
            (tile_n, tile_k),
            &staged[1],
            nt.tensor_stride(&node.inputs[1].tensor),
        )?;

        let warp_m = extent(config.warp.as_slice(), axes.c_m);
        let warp_n = extent(config.warp.as_slice(), axes.c_n);
        let accumulator: FragmentLayout = if self.arch().target.uses_volta_layouts()
            && warp_m % 32 == 0
            && warp_n % 32 == 0
        {
            Accum32x32::new(warp_m, warp_n)?.into()
        } else {
            Accum8x8::new(warp_m, warp_n)?.into()
        };

        debug!(
            "{}: layouts A={:?} B={:?} C={:?}",
            node.name,
            a.kind(),
            b.kind(),
            accumulator.kind()
        );
        Ok(OperandLayouts { a, b, accumulator })
    }

    fn operand_layout(
        &self,
        role: OperandRole,
        swizzle: bool,
        k_contiguous: bool,
        (extent, tile_k): (usize, usize),
        staged: &[usize],
        stride: Stride,
    ) -> Result<SharedLayout, LayoutError> {
        if swizzle {
            let ampere = self.arch().is_ampere_or_newer();
            return Ok(match (ampere, k_contiguous) {
                (true, true) => AmpereSwizzle::crosswise(tile_k)?.into(),
                (true, false) => AmpereSwizzle::congruous(extent)?.into(),
                (false, true) => VoltaCrosswise::new(extent, tile_k)?.into(),
                (false, false) => VoltaCongruous::new(extent, role)?.into(),
            });
        }
        let (ldm, pad) = match stride.ax() {
            Some(ax) if ax < staged.len() => {
                let ldm = product(&staged[ax + 1..]);
                (ldm, stride.stride().saturating_sub(ldm))
            }
            _ => (staged.last().copied().unwrap_or(0), 0),
        };
        Ok(RowMajor::new(ldm)?.with_pad(pad).into())
    }

    /// Evaluate, resolve and lay out one candidate.
    ///
    /// `Ok(None)` means the candidate is infeasible.
    pub fn plan(&self, tile_map: &TileMap, block_size: usize) -> Result<Option<Plan>, LayoutError> {
        let Some(td) = self.evaluate(tile_map) else {
            return Ok(None);
        };
        let Some(configs) = self.emit_config(&td, block_size) else {
            return Ok(None);
        };
        let mut layouts = BTreeMap::new();
        for (node, config) in self.graph().nodes().iter().zip(&configs) {
            let (Ok(tc), Some(nt)) = (node.as_tensor_core(), td.get(node.id)) else {
                continue;
            };
            layouts.insert(node.id, self.select_layouts(tc, nt, config)?.reports());
        }
        let rasterization = self.plan_rasterization(&td);
        debug!("plan: {:?}, {} wave(s)", rasterization, td.num_wave);
        Ok(Some(Plan {
            configs,
            layouts,
            rasterization,
            smem_cost: td.smem_cost,
            traffic: td.traffic,
            num_wave: td.num_wave,
        }))
    }
}

fn mn_extents(tile: &[usize], c_m: usize, c_n: usize) -> Option<(usize, usize)> {
    Some((*tile.get(c_m)?, *tile.get(c_n)?))
}

/// K step of the first reduction axis, full extent when unset
fn tile_k(node: &Node, rstep: &[usize]) -> usize {
    rstep
        .first()
        .copied()
        .or_else(|| node.reduce.first().map(|r| r.extent))
        .unwrap_or(0)
}

impl TilePolicy for TcPolicy {
    fn kind(&self) -> &'static str {
        "tensor_core"
    }

    fn graph(&self) -> &Graph {
        self.base.graph()
    }

    fn arch(&self) -> &Arch {
        self.base.arch()
    }

    fn check_tile_shape_isvalid(&self, tile_map: &TileMap) -> bool {
        if !self.base.check_tile_shape_isvalid(tile_map) {
            return false;
        }
        for node in self.graph().nodes() {
            let (Some([ax_m, ax_n]), Some(tile)) = (node.tensor_core, tile_map.get(&node.id)) else {
                continue;
            };
            let (block_m, block_n) = (tile[ax_m], tile[ax_n]);
            let fragment_fits = self
                .options
                .fragment_shapes
                .iter()
                .any(|&[m, n]| block_m.checked_rem(m) == Some(0) && block_n.checked_rem(n) == Some(0));
            if !fragment_fits {
                trace!(
                    "{}: {}x{} fits none of the fragments {:?}",
                    node.name,
                    block_m,
                    block_n,
                    self.options.fragment_shapes
                );
                return false;
            }
            if tile.iter().zip(&node.space).any(|(&t, &dim)| dim % t != 0) {
                trace!(
                    "{}: ragged tile {:?} over {:?}",
                    node.name,
                    tile,
                    node.space
                );
                return false;
            }
        }
        true
    }

    fn get_node_reduce_step_candidates(&self, node: &Node) -> Vec<Vec<usize>> {
        if !node.is_tensor_core() {
            return self.base.get_node_reduce_step_candidates(node);
        }
        let k = self.options.wmma_k;
        node.reduce
            .iter()
            .map(|r| {
                if r.extent % k == 0 {
                    get_all_factors(r.extent / k).into_iter().map(|f| f * k).collect()
                } else {
                    get_all_factors(r.extent)
                }
            })
            .collect()
    }

    fn assign_reduce_step(&self, node: &Node) -> Vec<usize> {
        if !node.is_tensor_core() {
            return self.base.assign_reduce_step(node);
        }
        let k = self.options.wmma_k;
        let mut steps = Vec::with_capacity(node.reduce.len());
        for r in &node.reduce {
            if r.extent % k != 0 {
                // Padded up to the instruction granularity
                steps.push(if r.extent < 2 * k { k } else { 2 * k });
            } else if r.extent % (2 * k) == 0 {
                steps.push(2 * k);
            } else {
                return self.base.assign_reduce_step(node);
            }
        }
        steps
    }

    fn use_pipelined(&self, node: &Node, tile: &[usize]) -> bool {
        if self.arch().platform != Platform::Cuda {
            return false;
        }
        node.as_tensor_core()
            .map_or(false, |tc| self.usable(tc, tile))
    }

    fn compute_node_stride_map(&self, node: &Node, nt: &NodeTile) -> StrideMaps {
        let Ok(tc) = node.as_tensor_core() else {
            return self.base.compute_node_stride_map(node, nt);
        };
        let (Some(stepped), Some(full)) = (
            self.compute_strides(tc, &nt.tile, &nt.rstep),
            self.compute_strides(tc, &nt.tile, &[]),
        ) else {
            return self.base.compute_node_stride_map(node, nt);
        };
        let swizzle = self.layout_ok(tc, &nt.tile, &nt.rstep);

        let mut maps = StrideMaps::default();
        maps.output.insert(node.inputs.len(), stepped.c);
        let operands = [(stepped.a, full.a), (stepped.b, full.b)];
        for (i, (stride, stride_full)) in operands.into_iter().enumerate() {
            if nt.pipelined && swizzle[i] {
                continue;
            }
            let edge = &node.inputs[i];
            // Fused inputs stay resident for the whole reduction
            let stride = if edge.is_placeholder() {
                stride
            } else {
                stride_full
            };
            maps.tensors.insert(edge.tensor.clone(), stride);
        }
        maps
    }

    fn infer_node_smem_usage(&self, node: &Node, nt: &NodeTile) -> (usize, Vec<String>) {
        let (value, cached) = self.base.infer_node_smem_usage(node, nt);
        let double_buffer =
            node.is_tensor_core() && nt.pipelined && self.arch().is_ampere_or_newer();
        if double_buffer {
            (value * 2, cached)
        } else {
            (value, cached)
        }
    }

    fn assign_block_size(
        &self,
        node: &Node,
        nt: &NodeTile,
        block_size: usize,
    ) -> Option<NodeConfig> {
        let Ok(tc) = node.as_tensor_core() else {
            return self.base.assign_block_size(node, nt, block_size);
        };
        let partition = self.assign_warp_tile(tc, &nt.tile, block_size, nt.pipelined)?;
        Some(NodeConfig {
            node: node.id,
            name: node.name.clone(),
            block: nt.tile.clone(),
            thread: Vec::new(),
            warp: partition.warp,
            rstep: nt.rstep.clone(),
            use_tc: Some(self.arch().target),
            wmma: Some(partition.wmma),
            use_pipelined: nt.pipelined,
            fast_decoding: node.fast_decoding,
            cached_tensors: nt.cached_tensors.clone(),
            schedule_stages: node.schedule_stages.clone(),
            output_strides: nt.output_strides.clone(),
            tensor_strides: nt.tensor_strides.clone(),
        })
    }

    fn plan_rasterization(&self, td: &TileDict) -> Rasterization {
        let arch = self.arch();
        if self.graph().len() > 1 {
            return Rasterization::None;
        }
        if td.num_wave < self.options.min_raster_waves {
            return Rasterization::None;
        }
        if !arch.is_ampere_or_newer() {
            return Rasterization::None;
        }
        for node in self.graph().nodes() {
            let (Some([ax_m, ax_n]), Some(tile)) = (node.tensor_core, td.tile(node.id)) else {
                continue;
            };
            // TODO: plan panels over the two innermost axes of batched tiles
            if tile.len() != 2 {
                continue;
            }
            let rows = ceil_div(node.space[ax_m], tile[ax_m]);
            let cols = ceil_div(node.space[ax_n], tile[ax_n]);
            let panel = (arch.l2_cache_bytes as f64 / td.traffic as f64).round();
            let panel_width = panel.clamp(1.0, self.options.max_panel_width as f64) as usize;
            return if tile[ax_m] >= tile[ax_n] {
                Rasterization::Row2D {
                    rows,
                    cols,
                    panel_width,
                }
            } else {
                Rasterization::Column2D {
                    rows,
                    cols,
                    panel_width,
                }
            };
        }
        Rasterization::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GpuArch;
    use crate::layout::LayoutKind;

    fn policy_for(node: Node, target: GpuArch) -> TcPolicy {
        TcPolicy::new(Graph::single(node).unwrap(), Arch::preset(target))
    }

    fn gemm_policy(target: GpuArch) -> TcPolicy {
        policy_for(Node::matmul(0, "gemm", 128, 128, 256, false), target)
    }

    fn tiles(tile: &[usize]) -> TileMap {
        TileMap::from([(0, tile.to_vec())])
    }

    #[test]
    fn test_compute_strides() {
        let p = gemm_policy(GpuArch::Sm80);
        let tc = p.graph().nodes()[0].as_tensor_core().unwrap();

        let stepped = p.compute_strides(tc, &[64, 64], &[32]).unwrap();
        assert_eq!(stepped.a, Stride::new(32 + 8, 0));
        assert_eq!(stepped.b, Stride::new(64 + 8, 0));
        assert_eq!(stepped.c, Stride::new(64 + 8, 0));

        let full = p.compute_strides(tc, &[64, 64], &[]).unwrap();
        assert_eq!(full.a, Stride::new(256 + 8, 0));
        assert_eq!(full.b, Stride::new(64 + 8, 0));

        assert!(p.compute_strides(tc, &[64], &[]).is_none());
        assert!(p.compute_strides(tc, &[1, 64, 64], &[32]).is_none());
    }

    #[test]
    fn test_usable_conditions() {
        let p = gemm_policy(GpuArch::Sm80);
        let tc = p.graph().nodes()[0].as_tensor_core().unwrap();
        assert!(p.usable(tc, &[64, 64]));
        // 8 is not a multiple of the 16-wide pipelined MMA
        assert!(!p.usable(tc, &[8, 64]));

        let short = Node::matmul(0, "short", 128, 128, 64, false);
        assert!(!p.usable(short.as_tensor_core().unwrap(), &[64, 64]));

        let fused = Node::matmul(1, "fused", 128, 128, 256, false).with_producer(0, 0);
        assert!(!p.usable(fused.as_tensor_core().unwrap(), &[64, 64]));

        let bmm = Node::batched_matmul(0, "bmm", 4, 128, 128, 256);
        let tc = bmm.as_tensor_core().unwrap();
        assert!(p.usable(tc, &[1, 64, 64]));
        assert!(!p.usable(tc, &[2, 64, 64]));
    }

    #[test]
    fn test_pipelining_is_cuda_only() {
        let mut arch = Arch::preset(GpuArch::Sm80);
        arch.platform = Platform::Rocm;
        let node = Node::matmul(0, "gemm", 128, 128, 256, false);
        let p = TcPolicy::new(Graph::single(node).unwrap(), arch);
        assert!(!p.use_pipelined(&p.graph().nodes()[0], &[64, 64]));
    }

    #[test]
    fn test_layout_ok_orientations() {
        let p = gemm_policy(GpuArch::Sm80);
        // A is MxK, B is KxN
        let nn = Node::matmul(0, "nn", 128, 128, 256, false);
        let tc = nn.as_tensor_core().unwrap();
        assert_eq!(p.layout_ok(tc, &[64, 64], &[32]), [true, true]);
        assert_eq!(p.layout_ok(tc, &[64, 32], &[32]), [true, false]);
        assert_eq!(p.layout_ok(tc, &[64, 64], &[16]), [false, true]);

        // B is NxK
        let nt = Node::matmul(0, "nt", 128, 128, 256, true);
        let tc = nt.as_tensor_core().unwrap();
        assert_eq!(p.layout_ok(tc, &[64, 32], &[32]), [true, true]);
    }

    #[test]
    fn test_reduce_step_rules() {
        let p = gemm_policy(GpuArch::Sm80);
        let step = |k| p.assign_reduce_step(&Node::matmul(0, "g", 64, 64, k, false));
        assert_eq!(step(24), vec![16]);
        assert_eq!(step(40), vec![32]);
        assert_eq!(step(256), vec![32]);
        // Multiple of 16 but not 32: generic divisor search
        assert_eq!(step(48), vec![24]);

        let plain = Node::matmul(0, "g", 64, 64, 24, false).without_tensor_core();
        assert_eq!(p.assign_reduce_step(&plain), vec![24]);
    }

    #[test]
    fn test_reduce_step_candidates() {
        let p = gemm_policy(GpuArch::Sm80);
        let node = Node::matmul(0, "g", 64, 64, 64, false);
        assert_eq!(
            p.get_node_reduce_step_candidates(&node),
            vec![vec![16, 32, 64]]
        );
        let odd = Node::matmul(0, "g", 64, 64, 24, false);
        assert_eq!(
            p.get_node_reduce_step_candidates(&odd),
            vec![vec![1, 2, 3, 4, 6, 8, 12, 24]]
        );
    }

    #[test]
    fn test_tile_shape_gate() {
        let p = gemm_policy(GpuArch::Sm80);
        assert!(p.check_tile_shape_isvalid(&tiles(&[64, 64])));
        assert!(p.check_tile_shape_isvalid(&tiles(&[32, 8])));
        assert!(p.check_tile_shape_isvalid(&tiles(&[8, 32])));
        assert!(!p.check_tile_shape_isvalid(&tiles(&[8, 8])));
        assert!(!p.check_tile_shape_isvalid(&tiles(&[48, 64])));
    }

    #[test]
    fn test_stride_map_skips_swizzled_operands() {
        let p = gemm_policy(GpuArch::Sm80);
        let node = &p.graph().nodes()[0];
        let td = p.evaluate(&tiles(&[64, 64])).unwrap();
        let nt = td.get(0).unwrap();
        assert!(nt.pipelined);
        assert!(nt.tensor_strides.is_empty());
        assert_eq!(nt.output_strides.get(&2), Some(&Stride::new(72, 0)));

        // Same tile without pipelining keeps both padded strides
        let mut unpipelined = nt.clone();
        unpipelined.pipelined = false;
        let maps = p.compute_node_stride_map(node, &unpipelined);
        assert_eq!(maps.tensors.get("A"), Some(&Stride::new(40, 0)));
        assert_eq!(maps.tensors.get("B"), Some(&Stride::new(72, 0)));
    }

    #[test]
    fn test_fused_input_uses_full_stride() {
        let producer = Node::matmul(0, "p", 128, 256, 64, false);
        let consumer = Node::matmul(1, "c", 128, 128, 256, false).with_producer(0, 0);
        let graph = Graph::new(vec![producer, consumer]).unwrap();
        let p = TcPolicy::new(graph, Arch::preset(GpuArch::Sm80));
        let node = &p.graph().nodes()[1];
        let nt = NodeTile::new(vec![64, 64], vec![32]);
        let maps = p.compute_node_stride_map(node, &nt);
        assert_eq!(maps.tensors.get("A"), Some(&Stride::new(256 + 8, 0)));
        assert_eq!(maps.tensors.get("B"), Some(&Stride::new(64 + 8, 0)));
    }

    #[test]
    fn test_double_buffering() {
        let p = gemm_policy(GpuArch::Sm80);
        let node = &p.graph().nodes()[0];
        let td = p.evaluate(&tiles(&[64, 64])).unwrap();
        let nt = td.get(0).unwrap();
        let (single, _) = p.base().infer_node_smem_usage(node, nt);
        assert_eq!(single, (64 * 32 + 32 * 64) * 2);
        assert_eq!(nt.smem, single * 2);

        let volta = gemm_policy(GpuArch::Sm75);
        let td = volta.evaluate(&tiles(&[64, 64])).unwrap();
        let nt = td.get(0).unwrap();
        assert!(nt.pipelined);
        assert_eq!(nt.smem, volta.base().infer_node_smem_usage(node, nt).0);
    }

    #[test]
    fn test_warp_tile_search() {
        let p = gemm_policy(GpuArch::Sm80);
        let tc = p.graph().nodes()[0].as_tensor_core().unwrap();

        let pipelined = p.assign_warp_tile(tc, &[64, 64], 128, true).unwrap();
        assert_eq!(pipelined.wmma, [16, 8, 16]);
        assert_eq!(pipelined.warp, vec![32, 32]);

        let wide = p.assign_warp_tile(tc, &[32, 128], 128, false).unwrap();
        assert_eq!(wide.wmma, [8, 32, 16]);
        assert_eq!(wide.warp.iter().product::<usize>() * 4, 32 * 128);

        assert!(p.assign_warp_tile(tc, &[64, 64], 100, true).is_none());
        // 16 instruction tiles cannot feed 32 warps
        assert!(p.assign_warp_tile(tc, &[64, 64], 1024, false).is_none());
    }

    #[test]
    fn test_warp_tile_stays_in_one_batch() {
        let bmm = Node::batched_matmul(0, "bmm", 4, 128, 128, 256);
        let p = policy_for(bmm, GpuArch::Sm80);
        let tc = p.graph().nodes()[0].as_tensor_core().unwrap();

        let partition = p.assign_warp_tile(tc, &[2, 64, 64], 128, false).unwrap();
        assert_eq!(partition.wmma, [16, 16, 16]);
        assert_eq!(partition.warp, vec![1, 32, 32]);

        // The M/N plane holds 4 instruction tiles, too few for 8 warps
        assert!(p.assign_warp_tile(tc, &[4, 32, 32], 256, false).is_none());

        let td = p.evaluate(&tiles(&[2, 64, 64])).unwrap();
        let configs = p.emit_config(&td, 128).unwrap();
        assert_eq!(configs[0].warp[0], 1);
    }

    #[test]
    fn test_select_layouts() {
        let p = gemm_policy(GpuArch::Sm80);
        let node = &p.graph().nodes()[0];
        let td = p.evaluate(&tiles(&[64, 64])).unwrap();
        let configs = p.emit_config(&td, 128).unwrap();
        let layouts = p
            .select_layouts(node.as_tensor_core().unwrap(), td.get(0).unwrap(), &configs[0])
            .unwrap();
        assert_eq!(layouts.a.kind(), LayoutKind::AmpereCrosswise);
        assert_eq!(layouts.b.kind(), LayoutKind::AmpereCongruous);
        assert_eq!(layouts.accumulator.kind(), LayoutKind::Accum8x8);

        let mut nt = td.get(0).unwrap().clone();
        nt.pipelined = false;
        nt.set_strides(p.compute_node_stride_map(node, &nt));
        let padded = p
            .select_layouts(node.as_tensor_core().unwrap(), &nt, &configs[0])
            .unwrap();
        assert_eq!(padded.a.kind(), LayoutKind::RowMajor);
        assert_eq!(padded.a.stride(), Some(40));
        assert_eq!(padded.b.stride(), Some(72));
    }

    #[test]
    fn test_volta_layouts() {
        let p = gemm_policy(GpuArch::Sm70);
        let node = &p.graph().nodes()[0];
        let td = p.evaluate(&tiles(&[64, 64])).unwrap();
        let configs = p.emit_config(&td, 128).unwrap();
        assert_eq!(configs[0].warp, vec![32, 32]);
        let layouts = p
            .select_layouts(node.as_tensor_core().unwrap(), td.get(0).unwrap(), &configs[0])
            .unwrap();
        assert_eq!(layouts.a.kind(), LayoutKind::VoltaCrosswise);
        assert_eq!(layouts.b.kind(), LayoutKind::VoltaBCongruous);
        assert_eq!(layouts.accumulator.kind(), LayoutKind::Accum32x32);
    }

    #[test]
    fn test_rasterization_plan() {
        let node = Node::matmul(0, "gemm", 4096, 4096, 4096, false);
        let p = policy_for(node, GpuArch::Sm80);
        let mut td = TileDict::default();
        td.nodes.insert(0, NodeTile::new(vec![128, 64], vec![32]));
        td.traffic = 8 * 1024 * 1024;
        td.num_wave = 5;
        assert_eq!(
            p.plan_rasterization(&td),
            Rasterization::Row2D {
                rows: 32,
                cols: 64,
                panel_width: 3
            }
        );

        td.nodes.insert(0, NodeTile::new(vec![64, 128], vec![32]));
        assert!(matches!(
            p.plan_rasterization(&td),
            Rasterization::Column2D { rows: 64, cols: 32, .. }
        ));

        td.num_wave = 3;
        assert_eq!(p.plan_rasterization(&td), Rasterization::None);
    }

    #[test]
    fn test_plan_end_to_end() {
        let p = gemm_policy(GpuArch::Sm80);
        let plan = p.plan(&tiles(&[64, 64]), 128).unwrap().unwrap();
        assert_eq!(plan.configs.len(), 1);
        assert_eq!(plan.configs[0].use_tc, Some(GpuArch::Sm80));
        assert!(plan.layouts.contains_key(&0));
        assert_eq!(plan.rasterization, Rasterization::None);

        assert!(p.plan(&tiles(&[48, 64]), 128).unwrap().is_none());
    }
}
