//! Compute graph seen by the tiling policy
//!
//! A node is an einsum-style contraction: an output iteration space, a list
//! of reduction axes and, per input, the axes indexing it. That is enough to
//! propagate a block tile to the operand tiles it reads, which is all the
//! policy needs from the surrounding compiler.
//!
//! Tensor-core nodes carry the pair of output axes that play the M and N
//! roles. Input 0 is operand A (indexed by M), input 1 is operand B
//! (indexed by N).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::DataType;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {0} is not a tensor-core node")]
    NotTensorCore(String),

    #[error("tensor-core node {node} has no operand {operand} indexed by the {axis} axis")]
    MissingOperand {
        node: String,
        operand: &'static str,
        axis: &'static str,
    },

    #[error("node {node}: axis {axis} out of range for rank {rank}")]
    AxisOutOfRange {
        node: String,
        axis: usize,
        rank: usize,
    },

    #[error("node {node}: input {tensor} refers to reduction axis {axis}, node has {count}")]
    UnknownReduceAxis {
        node: String,
        tensor: String,
        axis: usize,
        count: usize,
    },

    #[error("node {node}: extent of {what} must be positive")]
    ZeroExtent { node: String, what: String },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("node {node} reads from node {producer}, which is not defined before it")]
    UnknownProducer { node: String, producer: NodeId },

    #[error("graph has no nodes")]
    EmptyGraph,
}

/// Axis of an input tensor, expressed in the node's iteration space
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRef {
    /// Output axis by position
    Space(usize),
    /// Reduction axis by position
    Reduce(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceAxis {
    pub name: String,
    pub extent: usize,
}

/// Where an input comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    /// Kernel argument read from global memory
    #[default]
    Placeholder,
    /// Output of another node fused into the same kernel
    Node(NodeId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEdge {
    /// Tensor name, also the key of its stride entry
    pub tensor: String,
    pub axes: Vec<AxisRef>,
    #[serde(default)]
    pub src: EdgeSource,
}

impl InputEdge {
    pub fn is_placeholder(&self) -> bool {
        self.src == EdgeSource::Placeholder
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Output iteration-space extents
    pub space: Vec<usize>,
    #[serde(default)]
    pub reduce: Vec<ReduceAxis>,
    pub inputs: Vec<InputEdge>,
    pub output: String,
    #[serde(default)]
    pub dtype: DataType,
    /// Output axes playing the M and N roles of a tensor-core MMA
    #[serde(default)]
    pub tensor_core: Option<[usize; 2]>,
    #[serde(default)]
    pub fast_decoding: bool,
    #[serde(default)]
    pub schedule_stages: Vec<String>,
}

impl Node {
    /// `C[m, n] = A[m, k] * B[k, n]`, or `B[n, k]` when `trans_b`
    pub fn matmul(id: NodeId, name: &str, m: usize, n: usize, k: usize, trans_b: bool) -> Self {
        let b_axes = if trans_b {
            vec![AxisRef::Space(1), AxisRef::Reduce(0)]
        } else {
            vec![AxisRef::Reduce(0), AxisRef::Space(1)]
        };
        Self {
            id,
            name: name.to_string(),
            space: vec![m, n],
            reduce: vec![ReduceAxis {
                name: "k".to_string(),
                extent: k,
            }],
            inputs: vec![
                InputEdge {
                    tensor: "A".to_string(),
                    axes: vec![AxisRef::Space(0), AxisRef::Reduce(0)],
                    src: EdgeSource::Placeholder,
                },
                InputEdge {
                    tensor: "B".to_string(),
                    axes: b_axes,
                    src: EdgeSource::Placeholder,
                },
            ],
            output: "C".to_string(),
            dtype: DataType::Half,
            tensor_core: Some([0, 1]),
            fast_decoding: false,
            schedule_stages: vec![name.to_string()],
        }
    }

    /// `C[b, m, n] = A[b, m, k] * B[b, k, n]`
    pub fn batched_matmul(id: NodeId, name: &str, batch: usize, m: usize, n: usize, k: usize) -> Self {
        let mut node = Self::matmul(id, name, m, n, k, false);
        node.space = vec![batch, m, n];
        node.inputs[0].axes = vec![AxisRef::Space(0), AxisRef::Space(1), AxisRef::Reduce(0)];
        node.inputs[1].axes = vec![AxisRef::Space(0), AxisRef::Reduce(0), AxisRef::Space(2)];
        node.tensor_core = Some([1, 2]);
        node
    }

    pub fn without_tensor_core(mut self) -> Self {
        self.tensor_core = None;
        self
    }

    pub fn with_producer(mut self, input: usize, producer: NodeId) -> Self {
        if let Some(edge) = self.inputs.get_mut(input) {
            edge.src = EdgeSource::Node(producer);
        }
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn ndim(&self) -> usize {
        self.space.len()
    }

    pub fn is_tensor_core(&self) -> bool {
        self.tensor_core.is_some()
    }

    pub fn reduce_extents(&self) -> Vec<usize> {
        self.reduce.iter().map(|r| r.extent).collect()
    }

    /// Operand tiles read by a block tile, reduction axes at full extent
    pub fn propagate_inputs(&self, tile: &[usize]) -> Vec<Vec<usize>> {
        self.propagate_reduction_inputs(tile, &[])
    }

    /// Operand tiles read by one reduction step of a block tile. An empty
    /// `rstep` means the full reduction extent.
    pub fn propagate_reduction_inputs(&self, tile: &[usize], rstep: &[usize]) -> Vec<Vec<usize>> {
        self.inputs
            .iter()
            .map(|edge| {
                edge.axes
                    .iter()
                    .map(|axis| match *axis {
                        AxisRef::Space(i) => tile[i],
                        AxisRef::Reduce(r) => rstep
                            .get(r)
                            .copied()
                            .unwrap_or(self.reduce[r].extent),
                    })
                    .collect()
            })
            .collect()
    }

    /// Check that every axis reference resolves
    pub fn validate(&self) -> Result<(), GraphError> {
        let rank = self.ndim();
        if let Some(dim) = self.space.iter().position(|&d| d == 0) {
            return Err(GraphError::ZeroExtent {
                node: self.name.clone(),
                what: format!("space axis {dim}"),
            });
        }
        if let Some(axis) = self.reduce.iter().find(|r| r.extent == 0) {
            return Err(GraphError::ZeroExtent {
                node: self.name.clone(),
                what: format!("reduction axis {}", axis.name),
            });
        }
        for edge in &self.inputs {
            for axis in &edge.axes {
                match *axis {
                    AxisRef::Space(i) if i >= rank => {
                        return Err(GraphError::AxisOutOfRange {
                            node: self.name.clone(),
                            axis: i,
                            rank,
                        })
                    }
                    AxisRef::Reduce(r) if r >= self.reduce.len() => {
                        return Err(GraphError::UnknownReduceAxis {
                            node: self.name.clone(),
                            tensor: edge.tensor.clone(),
                            axis: r,
                            count: self.reduce.len(),
                        })
                    }
                    _ => {}
                }
            }
        }
        if let Some([m, n]) = self.tensor_core {
            for axis in [m, n] {
                if axis >= rank {
                    return Err(GraphError::AxisOutOfRange {
                        node: self.name.clone(),
                        axis,
                        rank,
                    });
                }
            }
            self.infer_tensorcore_axis()?;
        }
        Ok(())
    }

    /// View this node as a tensor-core node
    pub fn as_tensor_core(&self) -> Result<TcNode<'_>, GraphError> {
        let axes = self.infer_tensorcore_axis()?;
        Ok(TcNode { node: self, axes })
    }

    fn infer_tensorcore_axis(&self) -> Result<TensorCoreAxes, GraphError> {
        let [c_m, c_n] = self
            .tensor_core
            .ok_or_else(|| GraphError::NotTensorCore(self.name.clone()))?;
        let missing = |operand, axis| GraphError::MissingOperand {
            node: self.name.clone(),
            operand,
            axis,
        };

        let a = self.inputs.first().ok_or_else(|| missing("A", "M"))?;
        let b = self.inputs.get(1).ok_or_else(|| missing("B", "N"))?;

        let a_m = position(&a.axes, AxisRef::Space(c_m)).ok_or_else(|| missing("A", "M"))?;
        let (a_k, k_axis) = a
            .axes
            .iter()
            .enumerate()
            .find_map(|(pos, axis)| match axis {
                AxisRef::Reduce(_) => Some((pos, *axis)),
                AxisRef::Space(_) => None,
            })
            .ok_or_else(|| missing("A", "K"))?;
        let b_n = position(&b.axes, AxisRef::Space(c_n)).ok_or_else(|| missing("B", "N"))?;
        let b_k = position(&b.axes, k_axis).ok_or_else(|| missing("B", "K"))?;

        Ok(TensorCoreAxes {
            a_m,
            a_k,
            b_k,
            b_n,
            c_m,
            c_n,
        })
    }
}

fn position(axes: &[AxisRef], target: AxisRef) -> Option<usize> {
    axes.iter().position(|&a| a == target)
}

/// Positions of the MMA roles inside each operand's shape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorCoreAxes {
    pub a_m: usize,
    pub a_k: usize,
    pub b_k: usize,
    pub b_n: usize,
    pub c_m: usize,
    pub c_n: usize,
}

impl TensorCoreAxes {
    /// Operand A stored M-major with K contiguous
    pub fn a_is_k_contiguous(&self) -> bool {
        self.a_m < self.a_k
    }

    /// Operand B stored N-major with K contiguous
    pub fn b_is_k_contiguous(&self) -> bool {
        self.b_n < self.b_k
    }
}

/// A node known to be a tensor-core node
#[derive(Clone, Copy, Debug)]
pub struct TcNode<'a> {
    node: &'a Node,
    axes: TensorCoreAxes,
}

impl<'a> TcNode<'a> {
    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn axes(&self) -> TensorCoreAxes {
        self.axes
    }
}

/// Validated, topologically ordered set of nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Node>", into = "Vec<Node>")]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>) -> Result<Self, GraphError> {
        if nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        let mut defined = HashSet::new();
        for node in &nodes {
            node.validate()?;
            for edge in &node.inputs {
                if let EdgeSource::Node(producer) = edge.src {
                    if !defined.contains(&producer) {
                        return Err(GraphError::UnknownProducer {
                            node: node.name.clone(),
                            producer,
                        });
                    }
                }
            }
            if !defined.insert(node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
        }
        Ok(Self { nodes })
    }

    pub fn single(node: Node) -> Result<Self, GraphError> {
        Self::new(vec![node])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl TryFrom<Vec<Node>> for Graph {
    type Error = GraphError;

    fn try_from(nodes: Vec<Node>) -> Result<Self, Self::Error> {
        Graph::new(nodes)
    }
}

impl From<Graph> for Vec<Node> {
    fn from(graph: Graph) -> Self {
        graph.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_propagation() {
        let node = Node::matmul(0, "gemm", 128, 256, 512, false);
        let full = node.propagate_inputs(&[64, 32]);
        assert_eq!(full, vec![vec![64, 512], vec![512, 32]]);

        let stepped = node.propagate_reduction_inputs(&[64, 32], &[32]);
        assert_eq!(stepped, vec![vec![64, 32], vec![32, 32]]);
    }

    #[test]
    fn test_tensor_core_axes() {
        let nt = Node::matmul(0, "nt", 64, 64, 64, true);
        let axes = nt.as_tensor_core().unwrap().axes();
        assert_eq!((axes.a_m, axes.a_k), (0, 1));
        assert_eq!((axes.b_k, axes.b_n), (1, 0));
        assert!(axes.a_is_k_contiguous());
        assert!(axes.b_is_k_contiguous());

        let nn = Node::matmul(0, "nn", 64, 64, 64, false);
        assert!(!nn.as_tensor_core().unwrap().axes().b_is_k_contiguous());

        let bmm = Node::batched_matmul(0, "bmm", 4, 64, 64, 64);
        let axes = bmm.as_tensor_core().unwrap().axes();
        assert_eq!((axes.c_m, axes.c_n), (1, 2));
        assert_eq!((axes.a_m, axes.a_k, axes.b_k, axes.b_n), (1, 2, 1, 2));
    }

    #[test]
    fn test_not_tensor_core() {
        let node = Node::matmul(0, "plain", 64, 64, 64, false).without_tensor_core();
        assert_eq!(
            node.as_tensor_core().unwrap_err(),
            GraphError::NotTensorCore("plain".to_string())
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut node = Node::matmul(0, "bad", 64, 64, 64, false);
        node.inputs[1].axes = vec![AxisRef::Reduce(3), AxisRef::Space(1)];
        assert!(matches!(
            node.validate(),
            Err(GraphError::UnknownReduceAxis { axis: 3, .. })
        ));

        let mut node = Node::matmul(0, "bad", 64, 64, 64, false);
        node.inputs[0].axes = vec![AxisRef::Reduce(0)];
        assert!(matches!(
            node.validate(),
            Err(GraphError::MissingOperand { operand: "A", .. })
        ));

        let mut node = Node::matmul(0, "bad", 64, 64, 64, false);
        node.space[1] = 0;
        assert!(matches!(node.validate(), Err(GraphError::ZeroExtent { .. })));
    }

    #[test]
    fn test_graph_ordering() {
        let producer = Node::matmul(0, "p", 64, 64, 64, false);
        let consumer = Node::matmul(1, "c", 64, 64, 64, false).with_producer(0, 0);
        assert!(Graph::new(vec![producer.clone(), consumer.clone()]).is_ok());
        assert!(matches!(
            Graph::new(vec![consumer, producer.clone()]),
            Err(GraphError::UnknownProducer { producer: 0, .. })
        ));
        assert_eq!(
            Graph::new(vec![producer.clone(), producer]),
            Err(GraphError::DuplicateNode(0))
        );
        assert_eq!(Graph::new(vec![]), Err(GraphError::EmptyGraph));
    }

    #[test]
    fn test_graph_json_validates() {
        let graph = Graph::single(Node::matmul(0, "gemm", 128, 128, 256, true)).unwrap();
        let json = serde_json::to_string(&graph).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);

        let broken = json.replace("\"space\":[128,128]", "\"space\":[128]");
        assert!(serde_json::from_str::<Graph>(&broken).is_err());
    }
}
