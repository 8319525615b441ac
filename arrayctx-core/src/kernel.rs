//! Logical kernels and their execution on a command queue.
//!
//! A [`Kernel`] is a list of elementwise assignments over a dense index domain.
//! Scheduling it with an optional [`Tiling`] yields a [`ScheduledKernel`] whose
//! launch runs on a queue; with a tiling, work-groups along the group axis run in
//! parallel.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use rayon::prelude::*;

use crate::{
    device::{CommandQueue, Event},
    func::ScalarFn,
    storage::{read_all, Buffer},
    DType, Error, Result,
};

/// Names and symbolic upper bounds of a kernel's loop indices, outermost first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexDomain {
    inames: Vec<String>,
    bounds: Vec<String>,
}

impl IndexDomain {
    pub fn new<I, S>(axes: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let (inames, bounds) = axes
            .into_iter()
            .map(|(i, n)| (i.into(), n.into()))
            .unzip();
        Self { inames, bounds }
    }

    /// `i0..i{rank-1}` bounded by `n0..n{rank-1}`.
    pub fn dense(rank: usize) -> Self {
        Self::new((0..rank).map(|d| (format!("i{d}"), format!("n{d}"))))
    }

    pub fn rank(&self) -> usize {
        self.inames.len()
    }

    pub fn inames(&self) -> &[String] {
        &self.inames
    }

    pub fn bounds(&self) -> &[String] {
        &self.bounds
    }

    pub fn contains(&self, iname: &str) -> bool {
        self.position(iname).is_some()
    }

    pub fn position(&self, iname: &str) -> Option<usize> {
        self.inames.iter().position(|i| i == iname)
    }
}

/// Right-hand side of an assignment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    /// An array argument, or the output of an earlier assignment.
    Arg(String),
    Call(ScalarFn, Vec<Expr>),
}

impl Expr {
    pub fn arg(name: impl Into<String>) -> Self {
        Self::Arg(name.into())
    }

    pub fn call(func: ScalarFn, args: Vec<Expr>) -> Self {
        Self::Call(func, args)
    }

    fn visit_args<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Self::Arg(name) => f(name),
            Self::Call(_, args) => {
                for a in args {
                    a.visit_args(f);
                }
            }
        }
    }

    fn check_arity(&self) -> Result<()> {
        if let Self::Call(func, args) = self {
            func.check_arity(args.len())?;
            args.iter().try_for_each(Expr::check_arity)?;
        }
        Ok(())
    }
}

/// `output[i0, i1, ...] = expr[i0, i1, ...]`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Assignment {
    pub output: String,
    pub expr: Expr,
}

impl Assignment {
    pub fn new(output: impl Into<String>, expr: Expr) -> Self {
        Self {
            output: output.into(),
            expr,
        }
    }
}

/// Execution options the array contexts depend on.
///
/// `return_dict`: outputs come back as a name-to-array mapping.
/// `no_host_conversion`: arguments stay on the device and are never converted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct KernelOptions {
    pub return_dict: bool,
    pub no_host_conversion: bool,
}

impl KernelOptions {
    pub const REQUIRED: Self = Self {
        return_dict: true,
        no_host_conversion: true,
    };
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Kernel {
    name: String,
    domain: IndexDomain,
    statements: Vec<Assignment>,
    options: KernelOptions,
}

/// Build a kernel with the options every array context requires.
pub fn make_kernel(
    name: impl Into<String>,
    domain: IndexDomain,
    statements: Vec<Assignment>,
) -> Result<Kernel> {
    Kernel::new(name, domain, statements, KernelOptions::REQUIRED)
}

/// The canonical single-assignment kernel `out = func(inp0, inp1, ...)` over a
/// dense domain of the given rank.
pub fn elementwise_kernel(func: ScalarFn, nargs: usize, rank: usize) -> Result<Kernel> {
    func.check_arity(nargs)?;
    let args = (0..nargs).map(|i| Expr::arg(format!("inp{i}"))).collect();
    make_kernel(
        format!("actx_special_{}", func.device_name()),
        IndexDomain::dense(rank),
        vec![Assignment::new("out", Expr::call(func, args))],
    )
}

/// Shape information for one kernel argument at bind time.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ArgInfo<'a> {
    Array(&'a [usize]),
    Size(usize),
}

fn missing(what: String, expected: &str) -> Error {
    Error::ShapeMismatch {
        what,
        expected: expected.to_string(),
        got: "nothing".to_string(),
    }
    .bt()
}

impl Kernel {
    pub fn new(
        name: impl Into<String>,
        domain: IndexDomain,
        statements: Vec<Assignment>,
        options: KernelOptions,
    ) -> Result<Self> {
        let name = name.into();
        if statements.is_empty() {
            crate::bail!("kernel `{name}` has no statements");
        }
        for (i, stmt) in statements.iter().enumerate() {
            stmt.expr.check_arity()?;
            if statements[..i].iter().any(|s| s.output == stmt.output) {
                crate::bail!("kernel `{name}` assigns `{}` twice", stmt.output);
            }
        }
        Ok(Self {
            name,
            domain,
            statements,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &IndexDomain {
        &self.domain
    }

    pub fn statements(&self) -> &[Assignment] {
        &self.statements
    }

    pub fn options(&self) -> KernelOptions {
        self.options
    }

    /// Array arguments read by the kernel, in order of first use. Outputs of
    /// earlier statements are not arguments.
    pub fn inputs(&self) -> Vec<&str> {
        let mut inputs: Vec<&str> = Vec::new();
        for (i, stmt) in self.statements.iter().enumerate() {
            let earlier = &self.statements[..i];
            stmt.expr.visit_args(&mut |name| {
                if !inputs.contains(&name) && !earlier.iter().any(|s| s.output == name) {
                    inputs.push(name);
                }
            });
        }
        inputs
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().map(|s| s.output.as_str())
    }

    pub(crate) fn check_options(&self) -> Result<()> {
        if self.options != KernelOptions::REQUIRED {
            return Err(Error::contract(format!(
                "kernel `{}` must be built with return_dict and no_host_conversion \
                 (use make_kernel), got {:?}",
                self.name, self.options
            )));
        }
        Ok(())
    }

    /// Check the arguments against the kernel and resolve the domain extents.
    pub(crate) fn bind(&self, args: &[(&str, ArgInfo<'_>)]) -> Result<Vec<usize>> {
        let rank = self.domain.rank();
        let inputs = self.inputs();
        for (name, _) in args {
            if !inputs.contains(name) && !self.domain.bounds.iter().any(|b| b == name) {
                crate::bail!("kernel `{}` has no argument `{name}`", self.name);
            }
        }

        let mut extents: Vec<Option<usize>> = self
            .domain
            .bounds
            .iter()
            .map(|bound| {
                args.iter().find_map(|(name, info)| match info {
                    ArgInfo::Size(n) if name == bound => Some(*n),
                    _ => None,
                })
            })
            .collect();

        for input in inputs {
            let shape = match args.iter().find(|(name, _)| *name == input) {
                Some((_, ArgInfo::Array(shape))) => *shape,
                Some((_, ArgInfo::Size(_))) => {
                    return Err(Error::TypeMismatch {
                        argument: input.to_string(),
                        expected: "array".to_string(),
                        got: "size".to_string(),
                    }
                    .bt())
                }
                None => return Err(missing(format!("argument `{input}`"), "an array")),
            };
            if shape.len() != rank {
                return Err(Error::shape_mismatch(
                    format!("rank of argument `{input}`"),
                    rank,
                    shape.len(),
                ));
            }
            for (d, &n) in shape.iter().enumerate() {
                match extents[d] {
                    None => extents[d] = Some(n),
                    Some(known) if known != n => {
                        return Err(Error::shape_mismatch(
                            format!("argument `{input}` along `{}`", self.domain.inames[d]),
                            known,
                            n,
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        extents
            .into_iter()
            .zip(&self.domain.bounds)
            .map(|(n, bound)| n.ok_or_else(|| missing(format!("size `{bound}`"), "a value")))
            .collect()
    }

    /// Lower to an executable kernel, optionally tiled into work-groups.
    pub fn schedule(self: &Arc<Self>, tiling: Option<Tiling>) -> Result<ScheduledKernel> {
        let group_axis = match &tiling {
            Some(t) => {
                let axis = self.domain.position(&t.group_iname).ok_or_else(|| {
                    Error::msg(format!(
                        "kernel `{}` has no iname `{}`",
                        self.name, t.group_iname
                    ))
                })?;
                if let Some(local) = &t.local_iname {
                    if !self.domain.contains(local) {
                        crate::bail!("kernel `{}` has no iname `{local}`", self.name);
                    }
                }
                if t.local_size == 0 {
                    crate::bail!("local size must be positive");
                }
                Some(axis)
            }
            None => None,
        };

        let inputs = self.inputs();
        let mut outputs: Vec<&str> = Vec::new();
        let body = self
            .statements
            .iter()
            .map(|stmt| {
                let compiled = Lowered::lower(&stmt.expr, &inputs, &outputs);
                outputs.push(&stmt.output);
                compiled
            })
            .collect();

        Ok(ScheduledKernel {
            kernel: self.clone(),
            tiling,
            group_axis,
            body,
        })
    }
}

/// Work-group decomposition of a kernel's domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tiling {
    /// Each index along this axis is one work-group.
    pub group_iname: String,
    /// The axis split into lanes of `local_size` within a group.
    pub local_iname: Option<String>,
    pub local_size: usize,
}

#[derive(Debug)]
enum Lowered {
    Input(usize),
    Local(usize),
    Call(ScalarFn, Vec<Lowered>),
}

impl Lowered {
    fn lower(expr: &Expr, inputs: &[&str], locals: &[&str]) -> Self {
        match expr {
            Expr::Arg(name) => match locals.iter().position(|l| *l == name.as_str()) {
                Some(j) => Self::Local(j),
                // Every non-local name is in `inputs`, see Kernel::inputs.
                None => Self::Input(
                    inputs
                        .iter()
                        .position(|i| *i == name.as_str())
                        .unwrap_or(0),
                ),
            },
            Expr::Call(func, args) => Self::Call(
                *func,
                args.iter().map(|a| Self::lower(a, inputs, locals)).collect(),
            ),
        }
    }

    fn eval<T: DType>(&self, k: usize, inputs: &[&[T]], locals: &[f64]) -> f64 {
        match self {
            Self::Input(i) => inputs[*i][k].to_f64(),
            Self::Local(j) => locals[*j],
            Self::Call(func, args) => {
                let mut vals = [0f64; 3];
                for (arg, val) in args.iter().zip(vals.iter_mut()) {
                    *val = arg.eval(k, inputs, locals);
                }
                func.eval(&vals[..args.len()])
            }
        }
    }
}

/// A kernel ready to launch.
#[derive(Debug)]
pub struct ScheduledKernel {
    kernel: Arc<Kernel>,
    tiling: Option<Tiling>,
    group_axis: Option<usize>,
    body: Vec<Lowered>,
}

impl ScheduledKernel {
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn tiling(&self) -> Option<&Tiling> {
        self.tiling.as_ref()
    }

    /// Evaluate every statement over the domain. Inputs are ordered as
    /// [`Kernel::inputs`], outputs as [`Kernel::outputs`].
    pub(crate) fn run<T: DType>(&self, inputs: &[&[T]], outputs: &mut [&mut [T]], extents: &[usize]) {
        let total: usize = extents.iter().product();
        if total == 0 {
            return;
        }
        let (chunk, local_size) = match (self.group_axis, &self.tiling) {
            (Some(axis), Some(t)) => (
                extents[axis + 1..].iter().product::<usize>().max(1),
                t.local_size,
            ),
            _ => (total, total),
        };
        let ngroups = total.div_ceil(chunk);

        let mut groups: Vec<Vec<&mut [T]>> = (0..ngroups)
            .map(|_| Vec::with_capacity(outputs.len()))
            .collect();
        for out in outputs.iter_mut() {
            for (g, c) in out[..total].chunks_mut(chunk).enumerate() {
                groups[g].push(c);
            }
        }

        let work_group = |(g, mut outs): (usize, Vec<&mut [T]>)| {
            let mut locals = vec![0f64; self.body.len()];
            let base = g * chunk;
            let len = chunk.min(total - base);
            for lane0 in (0..len).step_by(local_size) {
                for off in lane0..(lane0 + local_size).min(len) {
                    for (j, stmt) in self.body.iter().enumerate() {
                        let val = stmt.eval(base + off, inputs, &locals);
                        locals[j] = val;
                    }
                    for (out, val) in outs.iter_mut().zip(&locals) {
                        out[off] = T::from_f64(*val);
                    }
                }
            }
        };

        if self.tiling.is_some() {
            groups.into_par_iter().enumerate().for_each(work_group);
        } else {
            groups.into_iter().enumerate().for_each(work_group);
        }
    }

    /// Enqueue on `queue`. `inputs` and `outputs` follow the order of
    /// [`ScheduledKernel::run`].
    pub(crate) fn launch<T: DType>(
        self: &Arc<Self>,
        queue: &CommandQueue,
        inputs: Vec<Arc<Buffer<T>>>,
        outputs: Vec<Arc<Buffer<T>>>,
        extents: Vec<usize>,
    ) -> Result<Event> {
        let this = self.clone();
        log::trace!(
            "dispatching `{}` over {extents:?} on queue {}",
            self.kernel.name,
            queue.id()
        );
        queue.enqueue(&self.kernel.name, move || {
            let (guards, index) = read_all(&inputs)?;
            let ins: Vec<&[T]> = index.iter().map(|&i| guards[i].as_slice()).collect();
            let mut out_guards = outputs
                .iter()
                .map(|b| b.write())
                .collect::<Result<Vec<_>>>()?;
            let mut outs: Vec<&mut [T]> = out_guards.iter_mut().map(|g| g.as_mut_slice()).collect();
            this.run(&ins, &mut outs, &extents);
            Ok(())
        })
    }
}

/// Memoizes the canonical elementwise kernels of one context.
#[derive(Default)]
pub struct KernelCache {
    kernels: RwLock<HashMap<(ScalarFn, usize, usize), Arc<Kernel>>>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kernel for `func` applied to `nargs` arrays of rank `rank`. Repeated
    /// calls return the same `Arc`.
    pub fn get(&self, func: ScalarFn, nargs: usize, rank: usize) -> Result<Arc<Kernel>> {
        let key = (func, nargs, rank);
        if let Some(kernel) = self.kernels.read().unwrap().get(&key) {
            return Ok(kernel.clone());
        }

        let mut kernels = self.kernels.write().unwrap();
        if let Some(kernel) = kernels.get(&key) {
            return Ok(kernel.clone());
        }
        let kernel = Arc::new(elementwise_kernel(func, nargs, rank)?);
        log::debug!("kernel cache miss: built `{}` for rank {rank}", kernel.name());
        kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub fn len(&self) -> usize {
        self.kernels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
