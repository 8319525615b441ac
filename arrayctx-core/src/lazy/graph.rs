use std::{
    any::Any,
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock, RwLockReadGuard,
    },
};

use crate::{func::ScalarFn, storage::DeviceArray, DType, Error, Result};

#[derive(Clone)]
pub(crate) enum NodeOp {
    /// Named input with no data, bound when a compiled program runs.
    Placeholder { name: String },
    /// Concrete data captured into the graph; holds a `DeviceArray<T>`.
    Data(Arc<dyn Any + Send + Sync>),
    Zeros,
    Apply { func: ScalarFn, args: Vec<usize> },
    /// Same elements under the node's shape.
    Reshape { arg: usize },
    Transpose { arg: usize, axes: Vec<usize> },
}

impl NodeOp {
    /// Nodes this one reads.
    pub(crate) fn args(&self) -> &[usize] {
        match self {
            NodeOp::Apply { args, .. } => args,
            NodeOp::Reshape { arg } | NodeOp::Transpose { arg, .. } => std::slice::from_ref(arg),
            NodeOp::Placeholder { .. } | NodeOp::Data(_) | NodeOp::Zeros => &[],
        }
    }
}

#[derive(Clone)]
pub(crate) struct Node {
    pub(crate) op: NodeOp,
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: &'static str,
}

impl Node {
    pub(crate) fn kind(&self) -> &'static str {
        match self.op {
            NodeOp::Placeholder { .. } => "placeholder",
            NodeOp::Data(_) => "data-wrapper node",
            NodeOp::Zeros => "zeros node",
            NodeOp::Apply { .. } | NodeOp::Reshape { .. } | NodeOp::Transpose { .. } => {
                "expression node"
            }
        }
    }

    pub(crate) fn data<T: DType>(&self) -> Option<&DeviceArray<T>> {
        match &self.op {
            NodeOp::Data(data) => data.downcast_ref::<DeviceArray<T>>(),
            _ => None,
        }
    }
}

static NAMESPACE_ID: AtomicUsize = AtomicUsize::new(0);

/// The append-only node store shared by all arrays of one lazy context.
#[derive(Clone)]
pub(crate) struct Namespace {
    id: usize,
    nodes: Arc<RwLock<Vec<Node>>>,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Self {
            id: NAMESPACE_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn nodes(&self) -> RwLockReadGuard<'_, Vec<Node>> {
        self.nodes.read().unwrap()
    }

    pub(crate) fn node(&self, id: usize) -> Node {
        self.nodes()[id].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes().len()
    }

    fn push(&self, node: Node) -> usize {
        let mut nodes = self.nodes.write().unwrap();
        nodes.push(node);
        nodes.len() - 1
    }

    pub(crate) fn placeholder<T: DType>(&self, name: &str, shape: &[usize]) -> Result<SymbolicArray<T>> {
        let clash = self
            .nodes()
            .iter()
            .any(|n| matches!(&n.op, NodeOp::Placeholder { name: other } if other == name));
        if clash {
            return Err(Error::contract(format!(
                "placeholder `{name}` already exists in this namespace"
            )));
        }
        Ok(self.add(
            NodeOp::Placeholder {
                name: name.to_string(),
            },
            shape,
        ))
    }

    pub(crate) fn data<T: DType>(&self, ary: DeviceArray<T>) -> SymbolicArray<T> {
        let shape = ary.shape().to_vec();
        self.add(NodeOp::Data(Arc::new(ary)), &shape)
    }

    pub(crate) fn zeros<T: DType>(&self, shape: &[usize]) -> SymbolicArray<T> {
        self.add(NodeOp::Zeros, shape)
    }

    pub(crate) fn apply<T: DType>(&self, func: ScalarFn, args: Vec<usize>, shape: &[usize]) -> SymbolicArray<T> {
        self.add(NodeOp::Apply { func, args }, shape)
    }

    pub(crate) fn reshape<T: DType>(&self, arg: usize, shape: &[usize]) -> SymbolicArray<T> {
        self.add(NodeOp::Reshape { arg }, shape)
    }

    /// `axes` must already be a permutation of the argument's axes.
    pub(crate) fn transpose<T: DType>(&self, arg: usize, axes: Vec<usize>, shape: &[usize]) -> SymbolicArray<T> {
        self.add(NodeOp::Transpose { arg, axes }, shape)
    }

    fn add<T: DType>(&self, op: NodeOp, shape: &[usize]) -> SymbolicArray<T> {
        let id = self.push(Node {
            op,
            shape: shape.to_vec(),
            dtype: T::NAME,
        });
        SymbolicArray::from_node(id, shape.to_vec(), self.clone())
    }
}

/// A handle to one node of a lazy context's graph.
pub struct SymbolicArray<T: DType> {
    pub(crate) id: usize,
    shape: Vec<usize>,
    pub(crate) ns: Namespace,
    _ghost: PhantomData<T>,
}

impl<T: DType> Clone for SymbolicArray<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shape: self.shape.clone(),
            ns: self.ns.clone(),
            _ghost: PhantomData,
        }
    }
}

impl<T: DType> SymbolicArray<T> {
    pub(crate) fn from_node(id: usize, shape: Vec<usize>, ns: Namespace) -> Self {
        Self {
            id,
            shape,
            ns,
            _ghost: PhantomData,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.ns.node(self.id).op, NodeOp::Placeholder { .. })
    }

    pub fn is_data_wrapper(&self) -> bool {
        matches!(self.ns.node(self.id).op, NodeOp::Data(_))
    }
}

impl<T: DType> std::fmt::Debug for SymbolicArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolicArray")
            .field("id", &self.id)
            .field("kind", &self.ns.node(self.id).kind())
            .field("dtype", &T::NAME)
            .field("shape", &self.shape)
            .finish()
    }
}
