//! A numpy-flavored namespace of elementwise functions, layout changes, reductions
//! and norms that works on any container of a context's arrays.

use crate::{
    context::{ArrayContext, ArrayLike, KernelArg, NormOrd, Reduction},
    dof_array::{Layout, Vectorize},
    func::ScalarFn,
    storage::{nan_max, nan_min},
    Context, DType, Error, Result,
};

/// Returned by [`ArrayContext::np`].
///
/// Every method accepts a bare array, a [`DofArray`](crate::DofArray) or a `Vec` of
/// such containers, and returns the same structure. All arguments of one call must
/// share the same layout and leaf shapes.
pub struct Np<'a, C: ArrayContext> {
    actx: &'a C,
}

macro_rules! unary {
    ($($name:ident => $func:ident),* $(,)?) => {
        $(
            pub fn $name<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<V> {
                self.apply::<T, V>(ScalarFn::$func, &[x])
            }
        )*
    };
}

macro_rules! binary {
    ($($name:ident => $func:ident),* $(,)?) => {
        $(
            pub fn $name<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V, y: &V) -> Result<V> {
                self.apply::<T, V>(ScalarFn::$func, &[x, y])
            }
        )*
    };
}

impl<'a, C: ArrayContext> Np<'a, C> {
    pub(crate) fn new(actx: &'a C) -> Self {
        Self { actx }
    }

    /// Call a function by its numpy name.
    pub fn call<T: DType, V: Vectorize<C::Array<T>>>(&self, name: &str, args: &[&V]) -> Result<V> {
        match name {
            "conj" | "conjugate" => match args {
                [x] => self.conjugate::<T, V>(x),
                _ => Err(Error::ArgumentCount {
                    function: name.to_string(),
                    expected: 1,
                    got: args.len(),
                }
                .bt()),
            },
            _ => self.apply::<T, V>(ScalarFn::lookup(name)?, args),
        }
    }

    /// Apply `func` leaf by leaf through the context's kernel cache.
    pub fn apply<T: DType, V: Vectorize<C::Array<T>>>(&self, func: ScalarFn, args: &[&V]) -> Result<V> {
        func.check_arity(args.len())?;
        let layout = Vectorize::<C::Array<T>>::layout(args[0]);
        for (i, arg) in args.iter().enumerate().skip(1) {
            let other = Vectorize::<C::Array<T>>::layout(*arg);
            if other != layout {
                return Err(Error::shape_mismatch(
                    format!("layout of argument {i} to `{}`", func.device_name()),
                    &layout,
                    other,
                ));
            }
        }

        let leaves: Vec<Vec<&C::Array<T>>> = args
            .iter()
            .map(|a| Vectorize::<C::Array<T>>::leaves(*a))
            .collect();
        let results = (0..leaves[0].len())
            .map(|k| {
                let group: Vec<&C::Array<T>> = leaves.iter().map(|l| l[k]).collect();
                self.apply_leaf(func, &group)
            })
            .collect::<Result<Vec<_>>>()?;
        V::from_leaves(&layout, &mut results.into_iter())
    }

    fn apply_leaf<T: DType>(&self, func: ScalarFn, args: &[&C::Array<T>]) -> Result<C::Array<T>> {
        let shape = args[0].shape();
        for (i, arg) in args.iter().enumerate() {
            if arg.is_frozen() {
                return Err(Error::contract(format!(
                    "argument {i} to `{}` is frozen, thaw it first",
                    func.device_name()
                )));
            }
            if arg.shape() != shape {
                return Err(Error::shape_mismatch(
                    format!("argument {i} to `{}`", func.device_name()),
                    shape,
                    arg.shape(),
                ));
            }
        }

        let kernel = self
            .actx
            .kernel_cache()
            .get(func, args.len(), shape.len())?;
        let names: Vec<String> = (0..args.len())
            .map(|i| format!("inp{i}"))
            .chain((0..shape.len()).map(|d| format!("n{d}")))
            .collect();
        let kernel_args: Vec<(&str, KernelArg<C::Array<T>>)> = names
            .iter()
            .zip(
                args.iter()
                    .map(|a| KernelArg::Array((*a).clone()))
                    .chain(shape.iter().map(|n| KernelArg::Size(*n))),
            )
            .map(|(name, arg)| (name.as_str(), arg))
            .collect();
        self.actx
            .call_kernel(&kernel, &kernel_args)?
            .remove("out")
            .context("elementwise kernel returned no `out`")
    }

    unary!(
        sin => Sin,
        cos => Cos,
        tan => Tan,
        arcsin => Asin,
        arccos => Acos,
        arctan => Atan,
        degrees => Degrees,
        rad2deg => Degrees,
        radians => Radians,
        deg2rad => Radians,
        sinh => Sinh,
        cosh => Cosh,
        tanh => Tanh,
        arcsinh => Asinh,
        arccosh => Acosh,
        arctanh => Atanh,
        floor => Floor,
        ceil => Ceil,
        trunc => Trunc,
        fix => Trunc,
        rint => Rint,
        around => Rint,
        round_ => Rint,
        exp => Exp,
        expm1 => Expm1,
        exp2 => Exp2,
        log => Log,
        log10 => Log10,
        log2 => Log2,
        log1p => Log1p,
        reciprocal => Reciprocal,
        negative => Negative,
        positive => Positive,
        square => Square,
        sqrt => Sqrt,
        cbrt => Cbrt,
        absolute => Absolute,
        abs => Absolute,
        fabs => Absolute,
        sign => Sign,
        signbit => Signbit,
        sinc => Sinc,
    );

    binary!(
        arctan2 => Atan2,
        hypot => Hypot,
        logaddexp => LogAddExp,
        logaddexp2 => LogAddExp2,
        add => Add,
        subtract => Subtract,
        multiply => Multiply,
        divide => Divide,
        true_divide => Divide,
        power => Power,
        float_power => Power,
        fmod => Fmod,
        remainder => Remainder,
        floor_divide => FloorDivide,
        maximum => Maximum,
        minimum => Minimum,
        fmax => Fmax,
        fmin => Fmin,
        copysign => Copysign,
        heaviside => Heaviside,
    );

    /// `then` where `criterion` is non-zero, `else_` elsewhere.
    pub fn where_<T: DType, V: Vectorize<C::Array<T>>>(
        &self,
        criterion: &V,
        then: &V,
        else_: &V,
    ) -> Result<V> {
        self.apply::<T, V>(ScalarFn::Where, &[criterion, then, else_])
    }

    /// `x` limited to `[lo, hi]` elementwise.
    pub fn clip<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V, lo: &V, hi: &V) -> Result<V> {
        self.apply::<T, V>(ScalarFn::Clip, &[x, lo, hi])
    }

    fn map_leaves<T, V, F>(&self, x: &V, f: F) -> Result<V>
    where
        T: DType,
        V: Vectorize<C::Array<T>>,
        F: FnMut(&C::Array<T>) -> Result<C::Array<T>>,
    {
        let layout = Vectorize::<C::Array<T>>::layout(x);
        let leaves = Vectorize::<C::Array<T>>::leaves(x)
            .into_iter()
            .map(f)
            .collect::<Result<Vec<_>>>()?;
        V::from_leaves(&layout, &mut leaves.into_iter())
    }

    /// Conjugate through each array's own `conj`; no kernel is involved.
    pub fn conjugate<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<V> {
        self.map_leaves::<T, V, _>(x, ArrayLike::conj)
    }

    /// Give every leaf of `x` the shape `shape`, keeping row-major element order.
    pub fn reshape<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V, shape: &[usize]) -> Result<V> {
        self.map_leaves::<T, V, _>(x, |leaf| self.actx.reshape(leaf, shape))
    }

    /// Permute the axes of every leaf of `x`; `None` reverses them.
    pub fn transpose<T: DType, V: Vectorize<C::Array<T>>>(
        &self,
        x: &V,
        axes: Option<&[usize]>,
    ) -> Result<V> {
        self.map_leaves::<T, V, _>(x, |leaf| self.actx.transpose(leaf, axes))
    }

    pub fn conj<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<V> {
        self.conjugate::<T, V>(x)
    }

    fn reduce_leaves<T: DType, V: Vectorize<C::Array<T>>>(
        &self,
        x: &V,
        op: Reduction,
    ) -> Result<Option<T>> {
        let mut acc: Option<T> = None;
        for leaf in Vectorize::<C::Array<T>>::leaves(x) {
            let Some(val) = self.actx.reduce(leaf, op)? else {
                continue;
            };
            acc = Some(match (acc, op) {
                (None, _) => val,
                (Some(a), Reduction::Sum) => a + val,
                (Some(a), Reduction::Min) => nan_min(a, val),
                (Some(a), Reduction::Max) => nan_max(a, val),
            });
        }
        Ok(acc)
    }

    /// Sum over every element of every leaf.
    pub fn sum<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<T> {
        Ok(self
            .reduce_leaves::<T, V>(x, Reduction::Sum)?
            .unwrap_or(T::ZERO))
    }

    pub fn min<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<T> {
        self.reduce_leaves::<T, V>(x, Reduction::Min)?
            .context("zero-size reduction `min` has no identity")
    }

    pub fn max<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V) -> Result<T> {
        self.reduce_leaves::<T, V>(x, Reduction::Max)?
            .context("zero-size reduction `max` has no identity")
    }

    /// Join arrays along their first axis.
    pub fn concatenate<T: DType>(&self, arys: &[&C::Array<T>]) -> Result<C::Array<T>> {
        self.actx.concatenate(arys)
    }

    pub fn linalg(&self) -> Linalg<'a, C> {
        Linalg { actx: self.actx }
    }
}

/// `np.linalg`
pub struct Linalg<'a, C: ArrayContext> {
    actx: &'a C,
}

impl<C: ArrayContext> Linalg<'_, C> {
    /// Vector norm over all leaves of `x`.
    ///
    /// For a [`DofArray`](crate::DofArray) this is the norm of the per-group norms,
    /// which equals the norm of all entries taken together. Empty input has norm 0.
    pub fn norm<T: DType, V: Vectorize<C::Array<T>>>(&self, x: &V, ord: NormOrd) -> Result<f64> {
        if let NormOrd::P(p) = ord {
            if p.is_nan() || p <= 0.0 {
                crate::bail!("norm order must be positive, got {p}");
            }
        }
        let leaves = Vectorize::<C::Array<T>>::leaves(x);
        if let Layout::Leaf = Vectorize::<C::Array<T>>::layout(x) {
            return self.actx.norm(leaves[0], ord);
        }

        let norms = leaves
            .into_iter()
            .map(|leaf| self.actx.norm(leaf, ord))
            .collect::<Result<Vec<f64>>>()?;
        Ok(match ord {
            NormOrd::Inf => norms.into_iter().fold(0.0, nan_max),
            NormOrd::P(p) => norms.iter().map(|n| n.powf(p)).sum::<f64>().powf(1.0 / p),
        })
    }
}
