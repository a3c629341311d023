//! Tensor-core kernel planning library.
//!
//! Chooses, for GEMM-like compute-graph nodes running on GPU tensor cores,
//! the block tile, warp tile, reduction step, padded strides, shared-memory
//! layouts and block traversal order that the kernel generator lowers.

pub mod arch;
pub mod graph;
pub mod layout;
pub mod policy;
pub mod rasterization;

pub use arch::{Arch, ArchError, DataType, GpuArch, Platform};
pub use graph::{Graph, GraphError, Node, TcNode};
pub use layout::{FragmentLayout, Layout, LayoutError, LayoutKind, SharedLayout};
pub use policy::{DefaultPolicy, NodeConfig, Plan, TcPolicy, TcPolicyOptions, TileDict, TilePolicy};
pub use rasterization::Rasterization;
