//! The catalog of elementwise scalar functions the kernel generator can emit.
//!
//! Names follow numpy spelling at the user-facing side ([`ScalarFn::lookup`]) and
//! C spelling on the device side ([`ScalarFn::device_name`]).

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarFn {
    Sin,
    Cos,
    Tan,
    Sinc,
    Asin,
    Acos,
    Atan,
    Atan2,
    Hypot,
    Degrees,
    Radians,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Floor,
    Ceil,
    Trunc,
    Rint,
    Exp,
    Expm1,
    Exp2,
    Log,
    Log10,
    Log2,
    Log1p,
    LogAddExp,
    LogAddExp2,
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Fmod,
    Remainder,
    FloorDivide,
    Reciprocal,
    Negative,
    Positive,
    Square,
    Sqrt,
    Cbrt,
    Absolute,
    Sign,
    Signbit,
    Maximum,
    Minimum,
    Fmax,
    Fmin,
    Copysign,
    Heaviside,
    Where,
    Clip,
}

/// numpy name -> function. Several names may share one function.
const CATALOG: &[(&str, ScalarFn)] = &[
    ("sin", ScalarFn::Sin),
    ("cos", ScalarFn::Cos),
    ("tan", ScalarFn::Tan),
    ("sinc", ScalarFn::Sinc),
    ("arcsin", ScalarFn::Asin),
    ("arccos", ScalarFn::Acos),
    ("arctan", ScalarFn::Atan),
    ("arctan2", ScalarFn::Atan2),
    ("hypot", ScalarFn::Hypot),
    ("degrees", ScalarFn::Degrees),
    ("rad2deg", ScalarFn::Degrees),
    ("radians", ScalarFn::Radians),
    ("deg2rad", ScalarFn::Radians),
    ("sinh", ScalarFn::Sinh),
    ("cosh", ScalarFn::Cosh),
    ("tanh", ScalarFn::Tanh),
    ("arcsinh", ScalarFn::Asinh),
    ("arccosh", ScalarFn::Acosh),
    ("arctanh", ScalarFn::Atanh),
    ("floor", ScalarFn::Floor),
    ("ceil", ScalarFn::Ceil),
    ("trunc", ScalarFn::Trunc),
    ("fix", ScalarFn::Trunc),
    ("rint", ScalarFn::Rint),
    ("around", ScalarFn::Rint),
    ("round_", ScalarFn::Rint),
    ("exp", ScalarFn::Exp),
    ("expm1", ScalarFn::Expm1),
    ("exp2", ScalarFn::Exp2),
    ("log", ScalarFn::Log),
    ("log10", ScalarFn::Log10),
    ("log2", ScalarFn::Log2),
    ("log1p", ScalarFn::Log1p),
    ("logaddexp", ScalarFn::LogAddExp),
    ("logaddexp2", ScalarFn::LogAddExp2),
    ("add", ScalarFn::Add),
    ("subtract", ScalarFn::Subtract),
    ("multiply", ScalarFn::Multiply),
    ("divide", ScalarFn::Divide),
    ("true_divide", ScalarFn::Divide),
    ("power", ScalarFn::Power),
    ("float_power", ScalarFn::Power),
    ("fmod", ScalarFn::Fmod),
    ("remainder", ScalarFn::Remainder),
    ("mod", ScalarFn::Remainder),
    ("floor_divide", ScalarFn::FloorDivide),
    ("reciprocal", ScalarFn::Reciprocal),
    ("negative", ScalarFn::Negative),
    ("positive", ScalarFn::Positive),
    ("square", ScalarFn::Square),
    ("sqrt", ScalarFn::Sqrt),
    ("cbrt", ScalarFn::Cbrt),
    ("absolute", ScalarFn::Absolute),
    ("abs", ScalarFn::Absolute),
    ("fabs", ScalarFn::Absolute),
    ("sign", ScalarFn::Sign),
    ("signbit", ScalarFn::Signbit),
    ("maximum", ScalarFn::Maximum),
    ("minimum", ScalarFn::Minimum),
    ("fmax", ScalarFn::Fmax),
    ("fmin", ScalarFn::Fmin),
    ("copysign", ScalarFn::Copysign),
    ("heaviside", ScalarFn::Heaviside),
    ("where", ScalarFn::Where),
    ("clip", ScalarFn::Clip),
];

/// Old C-style spellings of the inverse trig functions, with their numpy names.
const DEPRECATED: &[(&str, &str)] = &[
    ("asin", "arcsin"),
    ("acos", "arccos"),
    ("atan", "arctan"),
    ("atan2", "arctan2"),
    ("asinh", "arcsinh"),
    ("acosh", "arccosh"),
    ("atanh", "arctanh"),
];

impl ScalarFn {
    /// Resolve a numpy-style function name.
    ///
    /// Deprecated C spellings (`asin`, ...) are accepted with a warning and map to
    /// the same function as their numpy name. Anything outside the catalog is an
    /// [`Error::UnsupportedFunction`].
    pub fn lookup(name: &str) -> Result<Self> {
        if let Some((_, func)) = CATALOG.iter().find(|(n, _)| *n == name) {
            return Ok(*func);
        }
        if let Some((_, numpy_name)) = DEPRECATED.iter().find(|(n, _)| *n == name) {
            log::warn!(
                "'{name}' in the elementwise namespace is deprecated, use '{numpy_name}' as in numpy"
            );
            return Self::lookup(numpy_name);
        }
        Err(Error::UnsupportedFunction(name.to_string()).bt())
    }

    /// Every name [`ScalarFn::lookup`] accepts without a deprecation warning.
    pub fn catalog() -> impl Iterator<Item = (&'static str, ScalarFn)> {
        CATALOG.iter().copied()
    }

    /// The name the kernel generator uses for this function.
    pub fn device_name(&self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Sinc => "sinc",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Atan2 => "atan2",
            Self::Hypot => "hypot",
            Self::Degrees => "degrees",
            Self::Radians => "radians",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Asinh => "asinh",
            Self::Acosh => "acosh",
            Self::Atanh => "atanh",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Trunc => "trunc",
            Self::Rint => "rint",
            Self::Exp => "exp",
            Self::Expm1 => "expm1",
            Self::Exp2 => "exp2",
            Self::Log => "log",
            Self::Log10 => "log10",
            Self::Log2 => "log2",
            Self::Log1p => "log1p",
            Self::LogAddExp => "logaddexp",
            Self::LogAddExp2 => "logaddexp2",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Power => "pow",
            Self::Fmod => "fmod",
            Self::Remainder => "remainder",
            Self::FloorDivide => "floor_divide",
            Self::Reciprocal => "reciprocal",
            Self::Negative => "negative",
            Self::Positive => "positive",
            Self::Square => "square",
            Self::Sqrt => "sqrt",
            Self::Cbrt => "cbrt",
            Self::Absolute => "fabs",
            Self::Sign => "sign",
            Self::Signbit => "signbit",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
            Self::Fmax => "fmax",
            Self::Fmin => "fmin",
            Self::Copysign => "copysign",
            Self::Heaviside => "heaviside",
            Self::Where => "where",
            Self::Clip => "clip",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Self::Atan2
            | Self::Hypot
            | Self::LogAddExp
            | Self::LogAddExp2
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Power
            | Self::Fmod
            | Self::Remainder
            | Self::FloorDivide
            | Self::Maximum
            | Self::Minimum
            | Self::Fmax
            | Self::Fmin
            | Self::Copysign
            | Self::Heaviside => 2,
            Self::Where | Self::Clip => 3,
            _ => 1,
        }
    }

    pub(crate) fn check_arity(&self, got: usize) -> Result<()> {
        if got != self.arity() {
            return Err(Error::ArgumentCount {
                function: self.device_name().to_string(),
                expected: self.arity(),
                got,
            }
            .bt());
        }
        Ok(())
    }

    /// Evaluate on one element. `args.len()` must equal [`ScalarFn::arity`].
    pub fn eval(&self, args: &[f64]) -> f64 {
        let x = args[0];
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Sinc => {
                if x == 0.0 {
                    1.0
                } else {
                    let y = std::f64::consts::PI * x;
                    y.sin() / y
                }
            }
            Self::Asin => x.asin(),
            Self::Acos => x.acos(),
            Self::Atan => x.atan(),
            Self::Atan2 => x.atan2(args[1]),
            Self::Hypot => x.hypot(args[1]),
            Self::Degrees => x.to_degrees(),
            Self::Radians => x.to_radians(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
            Self::Asinh => x.asinh(),
            Self::Acosh => x.acosh(),
            Self::Atanh => x.atanh(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::Trunc => x.trunc(),
            Self::Rint => rint(x),
            Self::Exp => x.exp(),
            Self::Expm1 => x.exp_m1(),
            Self::Exp2 => x.exp2(),
            Self::Log => x.ln(),
            Self::Log10 => x.log10(),
            Self::Log2 => x.log2(),
            Self::Log1p => x.ln_1p(),
            Self::LogAddExp => log_add_exp(x, args[1]),
            Self::LogAddExp2 => {
                log_add_exp(x * std::f64::consts::LN_2, args[1] * std::f64::consts::LN_2)
                    / std::f64::consts::LN_2
            }
            Self::Add => x + args[1],
            Self::Subtract => x - args[1],
            Self::Multiply => x * args[1],
            Self::Divide => x / args[1],
            Self::Power => x.powf(args[1]),
            Self::Fmod => x % args[1],
            // remainder takes the sign of the divisor, fmod that of the dividend.
            Self::Remainder => {
                let r = x % args[1];
                if r != 0.0 && (r < 0.0) != (args[1] < 0.0) {
                    r + args[1]
                } else {
                    r
                }
            }
            Self::FloorDivide => floor_divide(x, args[1]),
            Self::Reciprocal => 1.0 / x,
            Self::Negative => -x,
            Self::Positive => x,
            Self::Square => x * x,
            Self::Sqrt => x.sqrt(),
            Self::Cbrt => x.cbrt(),
            Self::Absolute => x.abs(),
            Self::Signbit => {
                if x.is_sign_negative() {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sign => {
                if x.is_nan() {
                    f64::NAN
                } else if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            // maximum/minimum propagate NaN, fmax/fmin ignore it.
            Self::Maximum => {
                if x.is_nan() || args[1].is_nan() {
                    f64::NAN
                } else {
                    x.max(args[1])
                }
            }
            Self::Minimum => {
                if x.is_nan() || args[1].is_nan() {
                    f64::NAN
                } else {
                    x.min(args[1])
                }
            }
            Self::Fmax => x.max(args[1]),
            Self::Fmin => x.min(args[1]),
            Self::Copysign => x.copysign(args[1]),
            Self::Heaviside => {
                if x.is_nan() {
                    f64::NAN
                } else if x < 0.0 {
                    0.0
                } else if x > 0.0 {
                    1.0
                } else {
                    args[1]
                }
            }
            Self::Where => {
                if x != 0.0 {
                    args[1]
                } else {
                    args[2]
                }
            }
            Self::Clip => {
                if args[..3].iter().any(|v| v.is_nan()) {
                    f64::NAN
                } else {
                    x.max(args[1]).min(args[2])
                }
            }
        }
    }
}

/// Round half to even, like C `rint` in the default rounding mode.
fn rint(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return a + std::f64::consts::LN_2;
    }
    let hi = a.max(b);
    let lo = a.min(b);
    hi + (lo - hi).exp().ln_1p()
}

/// Floor of `a / b`, consistent with `remainder`: `a == b * q + remainder(a, b)`.
fn floor_divide(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return a / b;
    }
    let m = a % b;
    let mut div = (a - m) / b;
    if m != 0.0 && (b < 0.0) != (m < 0.0) {
        div -= 1.0;
    }
    if div == 0.0 {
        return 0.0f64.copysign(a / b);
    }
    let q = div.floor();
    if div - q > 0.5 {
        q + 1.0
    } else {
        q
    }
}
