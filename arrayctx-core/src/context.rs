use std::{collections::HashMap, sync::Arc};

use ndarray::ArrayD;

use crate::{
    device::CommandQueue,
    dof_array::{DofArray, Vectorize},
    kernel::{Kernel, KernelCache},
    numpy::Np,
    storage::DeviceArray,
    DType, Error, Result,
};

/// What every array handle of a context can report about itself.
pub trait ArrayLike: Clone {
    fn shape(&self) -> &[usize];

    /// Frozen arrays are detached from any context and take no part in arithmetic.
    fn is_frozen(&self) -> bool;

    /// Complex conjugate. Fails on a frozen array.
    fn conj(&self) -> Result<Self>;

    fn size(&self) -> usize {
        self.shape().iter().product()
    }
}

/// A named argument to [`ArrayContext::call_kernel`].
#[derive(Clone, Debug)]
pub enum KernelArg<A> {
    Array(A),
    /// Value for one of the kernel's symbolic loop bounds.
    Size(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Min,
    Max,
}

/// Order of a vector norm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NormOrd {
    /// `(sum |x|^p)^(1/p)`, `p > 0`.
    P(f64),
    /// `max |x|`
    Inf,
}

impl Default for NormOrd {
    fn default() -> Self {
        Self::P(2.0)
    }
}

/// A compiled function over DOF arrays, as returned by [`ArrayContext::compile`].
pub type CompiledFn<A> = Box<dyn Fn(&[DofArray<A>]) -> Result<Vec<DofArray<A>>>>;

/// The interface numerical code is written against.
///
/// Implementations decide when work runs: [`EagerContext`](crate::EagerContext)
/// dispatches every operation to its queue right away, while
/// [`LazyContext`](crate::LazyContext) records a graph and runs it on
/// [`freeze`](ArrayContext::freeze) or inside a compiled operator.
///
/// Contexts are cheap handles: clones share queue, caches and state.
pub trait ArrayContext: Clone + Sized {
    /// The array handle this context computes with.
    type Array<T: DType>: ArrayLike + Vectorize<Self::Array<T>>;

    /// Short name used in error messages.
    const BACKEND: &'static str;

    fn queue(&self) -> &CommandQueue;

    /// An array of unspecified content.
    fn empty<T: DType>(&self, shape: &[usize]) -> Result<Self::Array<T>>;

    fn zeros<T: DType>(&self, shape: &[usize]) -> Result<Self::Array<T>>;

    fn empty_like<T: DType>(&self, ary: &Self::Array<T>) -> Result<Self::Array<T>> {
        self.empty(ary.shape())
    }

    fn zeros_like<T: DType>(&self, ary: &Self::Array<T>) -> Result<Self::Array<T>> {
        self.zeros(ary.shape())
    }

    /// Copy a host array to the device. The result is thawed.
    fn from_host<T: DType>(&self, host: &ArrayD<T>) -> Result<Self::Array<T>>;

    /// Copy a thawed array back to the host.
    fn to_host<T: DType>(&self, ary: &Self::Array<T>) -> Result<ArrayD<T>>;

    /// The same elements, read in row-major order, under `shape`.
    fn reshape<T: DType>(&self, ary: &Self::Array<T>, shape: &[usize]) -> Result<Self::Array<T>>;

    /// Permute the axes of `ary`; `None` reverses them.
    fn transpose<T: DType>(
        &self,
        ary: &Self::Array<T>,
        axes: Option<&[usize]>,
    ) -> Result<Self::Array<T>>;

    /// Execute `kernel` with the named arguments and return its outputs by name.
    ///
    /// The kernel must carry [`KernelOptions::REQUIRED`](crate::KernelOptions::REQUIRED).
    fn call_kernel<T: DType>(
        &self,
        kernel: &Arc<Kernel>,
        args: &[(&str, KernelArg<Self::Array<T>>)],
    ) -> Result<HashMap<String, Self::Array<T>>>;

    /// Wait for pending work and return a detached copy-free handle. Idempotent.
    fn freeze<T: DType>(&self, ary: &Self::Array<T>) -> Result<DeviceArray<T>>;

    /// Bind a frozen array to this context.
    fn thaw<T: DType>(&self, ary: &DeviceArray<T>) -> Result<Self::Array<T>>;

    /// Turn `f` into a reusable callable over DOF arrays shaped like `input_like`.
    ///
    /// `f` gets the context to build its operations with; it must be free of side
    /// effects and its control flow must not depend on array values.
    fn compile<T, F>(
        &self,
        f: F,
        input_like: &[DofArray<Self::Array<T>>],
    ) -> Result<CompiledFn<Self::Array<T>>>
    where
        T: DType,
        F: Fn(&Self, &[DofArray<Self::Array<T>>]) -> Result<Vec<DofArray<Self::Array<T>>>>
            + 'static;

    /// The elementwise kernels this context has built so far.
    fn kernel_cache(&self) -> &KernelCache;

    /// The elementwise function namespace.
    fn np(&self) -> Np<'_, Self> {
        Np::new(self)
    }

    /// Reduce one array. `None` for min/max over zero elements.
    fn reduce<T: DType>(&self, _ary: &Self::Array<T>, op: Reduction) -> Result<Option<T>> {
        let name = match op {
            Reduction::Sum => "sum",
            Reduction::Min => "min",
            Reduction::Max => "max",
        };
        Err(Error::unsupported(name, Self::BACKEND))
    }

    fn norm<T: DType>(&self, _ary: &Self::Array<T>, _ord: NormOrd) -> Result<f64> {
        Err(Error::unsupported("linalg.norm", Self::BACKEND))
    }

    /// Join arrays along their first axis.
    fn concatenate<T: DType>(&self, _arys: &[&Self::Array<T>]) -> Result<Self::Array<T>> {
        Err(Error::unsupported("concatenate", Self::BACKEND))
    }
}
