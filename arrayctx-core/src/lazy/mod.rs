//! The lazy backend: operations build a dataflow graph that only runs when a result
//! is frozen or a compiled operator is called.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ndarray::ArrayD;

use crate::{
    config::LazyConfig,
    context::{ArrayContext, ArrayLike, CompiledFn, KernelArg},
    device::CommandQueue,
    dof_array::DofArray,
    kernel::{ArgInfo, Expr, Kernel, KernelCache},
    pool::MemoryPool,
    storage::{check_reshape, permutation, transposed_shape, DeviceArray},
    DType, Error, Result,
};

mod compiled;
mod graph;
mod lower;

pub use compiled::CompiledOperator;
pub use graph::SymbolicArray;
pub use lower::Program;

use graph::{Namespace, NodeOp};
use lower::generate_program;

/// Array handle of a [`LazyContext`].
pub enum LazyArray<T: DType> {
    Symbolic(SymbolicArray<T>),
    /// Concrete data that has not been captured into the graph yet.
    Concrete(DeviceArray<T>),
}

impl<T: DType> Clone for LazyArray<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Symbolic(s) => Self::Symbolic(s.clone()),
            Self::Concrete(c) => Self::Concrete(c.clone()),
        }
    }
}

impl<T: DType> std::fmt::Debug for LazyArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symbolic(s) => std::fmt::Debug::fmt(s, f),
            Self::Concrete(c) => std::fmt::Debug::fmt(c, f),
        }
    }
}

impl<T: DType> LazyArray<T> {
    pub fn as_symbolic(&self) -> Option<&SymbolicArray<T>> {
        match self {
            Self::Symbolic(s) => Some(s),
            Self::Concrete(_) => None,
        }
    }

    pub fn as_concrete(&self) -> Option<&DeviceArray<T>> {
        match self {
            Self::Symbolic(_) => None,
            Self::Concrete(c) => Some(c),
        }
    }
}

impl<T: DType> ArrayLike for LazyArray<T> {
    fn shape(&self) -> &[usize] {
        match self {
            Self::Symbolic(s) => s.shape(),
            Self::Concrete(c) => c.shape(),
        }
    }

    fn is_frozen(&self) -> bool {
        match self {
            Self::Symbolic(_) => false,
            Self::Concrete(c) => c.is_frozen(),
        }
    }

    fn conj(&self) -> Result<Self> {
        match self {
            Self::Symbolic(_) => Ok(self.clone()),
            Self::Concrete(c) => Ok(Self::Concrete(c.conj()?)),
        }
    }
}

struct LazyInner {
    queue: CommandQueue,
    pool: Option<MemoryPool>,
    ns: Namespace,
    kernels: KernelCache,
    traces: AtomicUsize,
}

/// Array context that records operations into a graph.
///
/// All arrays of one context live in a single namespace. [`ArrayContext::freeze`]
/// lowers the part of the graph a result depends on and runs it; [`LazyContext::trace`]
/// lowers a whole function once into a reusable [`CompiledOperator`].
#[derive(Clone)]
pub struct LazyContext(Arc<LazyInner>);

impl LazyContext {
    pub fn new(queue: CommandQueue) -> Self {
        Self::with_config(queue, LazyConfig::default())
    }

    pub fn with_config(queue: CommandQueue, config: LazyConfig) -> Self {
        let pool = config.allocator.resolve(queue.device());
        Self(Arc::new(LazyInner {
            queue,
            pool,
            ns: Namespace::new(),
            kernels: KernelCache::new(),
            traces: AtomicUsize::new(0),
        }))
    }

    pub fn pool(&self) -> Option<&MemoryPool> {
        self.0.pool.as_ref()
    }

    /// Number of nodes recorded so far.
    pub fn graph_len(&self) -> usize {
        self.0.ns.len()
    }

    #[cfg(test)]
    pub(crate) fn namespace(&self) -> &Namespace {
        &self.0.ns
    }

    /// Capture concrete data as a data-wrapper node.
    pub(crate) fn wrap<T: DType>(&self, ary: DeviceArray<T>) -> SymbolicArray<T> {
        self.0.ns.data(ary.with_queue(Some(self.0.queue.clone())))
    }

    /// A symbolic array from this context, capturing concrete inputs first.
    fn to_symbolic<T: DType>(&self, ary: &LazyArray<T>, what: &str) -> Result<SymbolicArray<T>> {
        match ary {
            LazyArray::Symbolic(s) if s.ns.id() == self.0.ns.id() => Ok(s.clone()),
            LazyArray::Symbolic(_) => Err(Error::contract(format!(
                "{what}: array belongs to a different lazy context"
            ))),
            LazyArray::Concrete(c) => {
                log::debug!("{what}: capturing concrete {:?} array into the graph", c.shape());
                self.thaw_device(c)
            }
        }
    }

    fn thaw_device<T: DType>(&self, ary: &DeviceArray<T>) -> Result<SymbolicArray<T>> {
        match ary.queue() {
            Some(queue) if *queue != self.0.queue => Err(Error::contract(
                "thaw: array is still bound to another context's queue, freeze it first",
            )),
            _ => Ok(self.wrap(ary.clone())),
        }
    }

    /// Lower and run the graph a node depends on.
    fn evaluate<T: DType>(&self, sym: &SymbolicArray<T>) -> Result<DeviceArray<T>> {
        let node = sym.ns.node(sym.id);
        match &node.op {
            NodeOp::Data(_) => {
                let ary = node
                    .data::<T>()
                    .ok_or_else(|| Error::msg("data node holds a different element type"))?;
                ary.wait()?;
                Ok(ary.clone())
            }
            NodeOp::Placeholder { name } => Err(Error::contract(format!(
                "cannot freeze placeholder `{name}`, it has no data"
            ))),
            NodeOp::Zeros
            | NodeOp::Apply { .. }
            | NodeOp::Reshape { .. }
            | NodeOp::Transpose { .. } => {
                let program = Arc::new(generate_program::<T>(
                    &sym.ns,
                    &[("_actx_freeze_out".to_string(), sym.id)],
                    "_actx_freeze",
                )?);
                if let Some((name, _)) = program.inputs().first() {
                    return Err(Error::contract(format!(
                        "cannot freeze an array that depends on placeholder `{name}`"
                    )));
                }
                let (event, mut outs) =
                    program.execute(&self.0.queue, self.0.pool.as_ref(), &HashMap::new())?;
                event.wait()?;
                outs.pop()
                    .ok_or_else(|| Error::msg("freeze program produced no output"))
            }
        }
    }

    /// Trace `f` over placeholders shaped like `input_like` and lower the result
    /// once.
    ///
    /// Placeholders are named `<prefix>_inp_<field>_<group>` and outputs
    /// `<prefix>_out_<field>_<group>`, where the prefix is unique per trace.
    pub fn trace<T, F>(&self, f: F, input_like: &[DofArray<LazyArray<T>>]) -> Result<CompiledOperator<T>>
    where
        T: DType,
        F: FnOnce(&Self, &[DofArray<LazyArray<T>>]) -> Result<Vec<DofArray<LazyArray<T>>>>,
    {
        let prefix = format!("_actx_{}", self.0.traces.fetch_add(1, Ordering::Relaxed));

        let placeholders = input_like
            .iter()
            .enumerate()
            .map(|(i, field)| {
                field
                    .iter()
                    .enumerate()
                    .map(|(j, like)| {
                        let name = format!("{prefix}_inp_{i}_{j}");
                        Ok(LazyArray::Symbolic(
                            self.0.ns.placeholder::<T>(&name, like.shape())?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(DofArray::from_list)
            })
            .collect::<Result<Vec<_>>>()?;
        let input_spec = input_like.iter().map(DofArray::len).collect();

        let outputs = f(self, &placeholders)?;
        let output_spec: Vec<usize> = outputs.iter().map(DofArray::len).collect();

        let mut named = Vec::new();
        for (i, field) in outputs.iter().enumerate() {
            for (j, ary) in field.iter().enumerate() {
                let name = format!("{prefix}_out_{i}_{j}");
                let sym = self.to_symbolic(ary, &name)?;
                named.push((name, sym.id));
            }
        }

        let program = generate_program::<T>(&self.0.ns, &named, &format!("{prefix}_entry"))?;
        log::debug!(
            "compiled `{}`: inputs {input_spec:?}, outputs {output_spec:?}",
            program.entrypoint()
        );
        Ok(CompiledOperator::new(
            self.clone(),
            Arc::new(program),
            prefix,
            input_spec,
            output_spec,
        ))
    }

    pub(crate) fn run_program<T: DType>(
        &self,
        program: &Arc<Program<T>>,
        inputs: &HashMap<String, DeviceArray<T>>,
    ) -> Result<Vec<DeviceArray<T>>> {
        let (event, outs) = program.execute(&self.0.queue, self.0.pool.as_ref(), inputs)?;
        event.wait()?;
        Ok(outs)
    }
}

impl ArrayContext for LazyContext {
    type Array<T: DType> = LazyArray<T>;

    const BACKEND: &'static str = "lazy";

    fn queue(&self) -> &CommandQueue {
        &self.0.queue
    }

    fn empty<T: DType>(&self, _shape: &[usize]) -> Result<LazyArray<T>> {
        Err(Error::unsupported("empty", Self::BACKEND))
    }

    fn zeros<T: DType>(&self, shape: &[usize]) -> Result<LazyArray<T>> {
        Ok(LazyArray::Symbolic(self.0.ns.zeros(shape)))
    }

    fn from_host<T: DType>(&self, host: &ArrayD<T>) -> Result<LazyArray<T>> {
        let ary = DeviceArray::from_host(host, self.0.pool.as_ref(), self.0.queue.clone());
        Ok(LazyArray::Symbolic(self.wrap(ary)))
    }

    fn to_host<T: DType>(&self, ary: &LazyArray<T>) -> Result<ArrayD<T>> {
        if ary.is_frozen() {
            return Err(Error::contract(
                "to_host: array is frozen, thaw it into a context first",
            ));
        }
        self.freeze(ary)?.to_host()
    }

    fn call_kernel<T: DType>(
        &self,
        kernel: &Arc<Kernel>,
        args: &[(&str, KernelArg<LazyArray<T>>)],
    ) -> Result<HashMap<String, LazyArray<T>>> {
        kernel.check_options()?;

        let mut symbols = HashMap::new();
        let mut infos = Vec::with_capacity(args.len());
        for (name, arg) in args {
            match arg {
                KernelArg::Array(ary) => {
                    let sym = self.to_symbolic(ary, &format!("argument `{name}` of `{}`", kernel.name()))?;
                    symbols.insert(name.to_string(), sym);
                }
                KernelArg::Size(n) => infos.push((*name, ArgInfo::Size(*n))),
            }
        }
        for (name, sym) in &symbols {
            infos.push((name.as_str(), ArgInfo::Array(sym.shape())));
        }
        let extents = kernel.bind(&infos)?;

        let mut env: HashMap<String, usize> =
            symbols.iter().map(|(name, sym)| (name.clone(), sym.id)).collect();
        let mut outputs = HashMap::new();
        for stmt in kernel.statements() {
            let sym = self.splice::<T>(&stmt.expr, &env, &extents)?;
            env.insert(stmt.output.clone(), sym.id);
            outputs.insert(stmt.output.clone(), LazyArray::Symbolic(sym));
        }
        Ok(outputs)
    }

    fn reshape<T: DType>(&self, ary: &LazyArray<T>, shape: &[usize]) -> Result<LazyArray<T>> {
        if ary.is_frozen() {
            return Err(Error::contract("reshape: array is frozen, thaw it into a context first"));
        }
        check_reshape(ary.shape(), shape)?;
        let sym = self.to_symbolic(ary, "reshape")?;
        Ok(LazyArray::Symbolic(self.0.ns.reshape(sym.id, shape)))
    }

    fn transpose<T: DType>(&self, ary: &LazyArray<T>, axes: Option<&[usize]>) -> Result<LazyArray<T>> {
        if ary.is_frozen() {
            return Err(Error::contract("transpose: array is frozen, thaw it into a context first"));
        }
        let axes = permutation(ary.shape().len(), axes)?;
        let shape = transposed_shape(ary.shape(), &axes);
        let sym = self.to_symbolic(ary, "transpose")?;
        Ok(LazyArray::Symbolic(self.0.ns.transpose(sym.id, axes, &shape)))
    }

    fn freeze<T: DType>(&self, ary: &LazyArray<T>) -> Result<DeviceArray<T>> {
        let result = match ary {
            LazyArray::Concrete(c) => {
                c.wait()?;
                c.clone()
            }
            LazyArray::Symbolic(s) => self.evaluate(s)?,
        };
        Ok(result.with_queue(None))
    }

    fn thaw<T: DType>(&self, ary: &DeviceArray<T>) -> Result<LazyArray<T>> {
        Ok(LazyArray::Symbolic(self.thaw_device(ary)?))
    }

    fn compile<T, F>(
        &self,
        f: F,
        input_like: &[DofArray<LazyArray<T>>],
    ) -> Result<CompiledFn<LazyArray<T>>>
    where
        T: DType,
        F: Fn(&Self, &[DofArray<LazyArray<T>>]) -> Result<Vec<DofArray<LazyArray<T>>>>
            + 'static,
    {
        let op = self.trace(f, input_like)?;
        Ok(Box::new(move |args: &[DofArray<LazyArray<T>>]| op.call(args)))
    }

    fn kernel_cache(&self) -> &KernelCache {
        &self.0.kernels
    }
}

impl LazyContext {
    /// Add the nodes computing `expr` to the graph.
    fn splice<T: DType>(
        &self,
        expr: &Expr,
        env: &HashMap<String, usize>,
        shape: &[usize],
    ) -> Result<SymbolicArray<T>> {
        match expr {
            Expr::Arg(name) => {
                let id = *env
                    .get(name)
                    .ok_or_else(|| Error::msg(format!("unbound kernel argument `{name}`")))?;
                let node = self.0.ns.node(id);
                if node.dtype != T::NAME {
                    return Err(Error::TypeMismatch {
                        argument: name.clone(),
                        expected: T::NAME.to_string(),
                        got: node.dtype.to_string(),
                    }
                    .bt());
                }
                Ok(SymbolicArray::from_node(id, node.shape, self.0.ns.clone()))
            }
            Expr::Call(func, args) => {
                let args = args
                    .iter()
                    .map(|a| self.splice::<T>(a, env, shape).map(|s| s.id))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.0.ns.apply(*func, args, shape))
            }
        }
    }
}
