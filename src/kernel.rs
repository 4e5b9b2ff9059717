//! Kernel functions for dCGP expressions.
//!
//! A kernel is a named variadic operator evaluated over any element type that
//! implements [`KernelValue`]: plain `f64`, the truncated Taylor elements of
//! [`crate::taylor::Taylor`], or anything else providing the same surface.
//! Symbolic rendering goes through a separate printer ([`Kernel::pretty`]) so
//! that it can never alter numeric semantics.
//!
//! Arithmetic kernels fold over all their arguments; transcendental and
//! activation kernels apply to the *sum* of their arguments, which is what
//! makes them usable as neuron nonlinearities in the weighted expression.

use serde::{Deserialize, Serialize};

use crate::error::{DcgpError, Result};

/// Threshold under which protected division returns 1 instead of dividing.
const PDIV_EPS: f64 = 1e-10;

/// Element type a [`Kernel`] can be evaluated over.
///
/// `cf()` exposes the zeroth-order (constant) coefficient, which is the value
/// itself for `f64`. Branching kernels (`pdiv`, `ReLu`, `ELU`) branch on it so
/// that the same rule applies uniformly to numbers and Taylor elements.
pub trait KernelValue: Clone + Send + Sync {
    /// Lift a plain constant into the element type.
    fn from_f64(c: f64) -> Self;
    /// The zeroth-order coefficient.
    fn cf(&self) -> f64;
    /// Addition.
    fn add(&self, rhs: &Self) -> Self;
    /// Subtraction.
    fn sub(&self, rhs: &Self) -> Self;
    /// Multiplication.
    fn mul(&self, rhs: &Self) -> Self;
    /// Division.
    fn div(&self, rhs: &Self) -> Self;
    /// Exponential.
    fn exp(&self) -> Self;
    /// Natural logarithm.
    fn ln(&self) -> Self;
    /// Sine.
    fn sin(&self) -> Self;
    /// Cosine.
    fn cos(&self) -> Self;
    /// Hyperbolic tangent.
    fn tanh(&self) -> Self;
    /// Square root.
    fn sqrt(&self) -> Self;
}

impl KernelValue for f64 {
    #[inline]
    fn from_f64(c: f64) -> Self {
        c
    }
    #[inline]
    fn cf(&self) -> f64 {
        *self
    }
    #[inline]
    fn add(&self, rhs: &Self) -> Self {
        self + rhs
    }
    #[inline]
    fn sub(&self, rhs: &Self) -> Self {
        self - rhs
    }
    #[inline]
    fn mul(&self, rhs: &Self) -> Self {
        self * rhs
    }
    #[inline]
    fn div(&self, rhs: &Self) -> Self {
        self / rhs
    }
    #[inline]
    fn exp(&self) -> Self {
        f64::exp(*self)
    }
    #[inline]
    fn ln(&self) -> Self {
        f64::ln(*self)
    }
    #[inline]
    fn sin(&self) -> Self {
        f64::sin(*self)
    }
    #[inline]
    fn cos(&self) -> Self {
        f64::cos(*self)
    }
    #[inline]
    fn tanh(&self) -> Self {
        f64::tanh(*self)
    }
    #[inline]
    fn sqrt(&self) -> Self {
        f64::sqrt(*self)
    }
}

/// The built-in kernel functions.
///
/// The order of declaration carries no meaning; kernel indices are defined by
/// the position inside a [`KernelSet`], because function genes index into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kernel {
    /// Sum of all arguments.
    Sum,
    /// First argument minus all following arguments.
    Diff,
    /// Product of all arguments.
    Mul,
    /// First argument divided by all following arguments.
    Div,
    /// Protected division: falls back to 1 when a denominator is near zero.
    Pdiv,
    /// `exp` of the argument sum.
    Exp,
    /// Natural logarithm of the argument sum.
    Log,
    /// Sine of the argument sum.
    Sin,
    /// Cosine of the argument sum.
    Cos,
    /// Hyperbolic tangent of the argument sum.
    Tanh,
    /// Logistic sigmoid of the argument sum.
    Sig,
    /// Rectified linear unit of the argument sum.
    ReLu,
    /// Exponential linear unit of the argument sum.
    Elu,
    /// Inverse square root unit of the argument sum: `s / sqrt(1 + s^2)`.
    Isru,
}

impl Kernel {
    /// All built-in kernels.
    pub const ALL: [Self; 14] = [
        Self::Sum,
        Self::Diff,
        Self::Mul,
        Self::Div,
        Self::Pdiv,
        Self::Exp,
        Self::Log,
        Self::Sin,
        Self::Cos,
        Self::Tanh,
        Self::Sig,
        Self::ReLu,
        Self::Elu,
        Self::Isru,
    ];

    /// The differentiable activations accepted by the weighted expression.
    pub const ANN: [Self; 5] = [Self::Tanh, Self::Sig, Self::ReLu, Self::Elu, Self::Isru];

    /// Canonical name of the kernel.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Diff => "diff",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Pdiv => "pdiv",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sig => "sig",
            Self::ReLu => "ReLu",
            Self::Elu => "ELU",
            Self::Isru => "ISRU",
        }
    }

    /// Look a kernel up by its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] for an unknown name.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| {
                DcgpError::invalid(format!(
                    "unknown kernel name '{name}', available kernels are \
                     sum, diff, mul, div, pdiv, exp, log, sin, cos, tanh, sig, ReLu, ELU, ISRU"
                ))
            })
    }

    /// Whether this kernel is one of the differentiable activations allowed
    /// in a weighted (ANN) expression.
    #[must_use]
    pub const fn is_ann_activation(self) -> bool {
        matches!(
            self,
            Self::Tanh | Self::Sig | Self::ReLu | Self::Elu | Self::Isru
        )
    }

    /// Evaluate the kernel on a sequence of arguments.
    ///
    /// Arity is whatever the caller passes; the expression guarantees it
    /// matches the host node's arity. Must be called with at least one
    /// argument.
    #[must_use]
    pub fn eval<T: KernelValue>(self, args: &[T]) -> T {
        match self {
            Self::Sum => fold(args, T::add),
            Self::Diff => fold(args, T::sub),
            Self::Mul => fold(args, T::mul),
            Self::Div => fold(args, T::div),
            Self::Pdiv => args[1..].iter().fold(args[0].clone(), |acc, rhs| {
                if rhs.cf().abs() <= PDIV_EPS {
                    T::from_f64(1.0)
                } else {
                    acc.div(rhs)
                }
            }),
            Self::Exp => sum_args(args).exp(),
            Self::Log => sum_args(args).ln(),
            Self::Sin => sum_args(args).sin(),
            Self::Cos => sum_args(args).cos(),
            Self::Tanh => sum_args(args).tanh(),
            Self::Sig => {
                let s = sum_args(args);
                let one = T::from_f64(1.0);
                one.div(&one.add(&T::from_f64(-1.0).mul(&s).exp()))
            }
            Self::ReLu => {
                let s = sum_args(args);
                if s.cf() > 0.0 {
                    s
                } else {
                    T::from_f64(0.0)
                }
            }
            Self::Elu => {
                let s = sum_args(args);
                if s.cf() > 0.0 {
                    s
                } else {
                    s.exp().sub(&T::from_f64(1.0))
                }
            }
            Self::Isru => {
                let s = sum_args(args);
                let one = T::from_f64(1.0);
                s.div(&one.add(&s.mul(&s)).sqrt())
            }
        }
    }

    /// Render the kernel applied to symbolic arguments.
    #[must_use]
    pub fn pretty(self, args: &[String]) -> String {
        match self {
            Self::Sum => format!("({})", args.join("+")),
            Self::Diff => format!("({})", args.join("-")),
            Self::Mul => format!("({})", args.join("*")),
            Self::Div | Self::Pdiv => format!("({})", args.join("/")),
            Self::Exp => format!("exp({})", args.join("+")),
            Self::Log => format!("log({})", args.join("+")),
            Self::Sin => format!("sin({})", args.join("+")),
            Self::Cos => format!("cos({})", args.join("+")),
            Self::Tanh => format!("tanh({})", args.join("+")),
            Self::Sig => format!("sig({})", args.join("+")),
            Self::ReLu => format!("ReLu({})", args.join("+")),
            Self::Elu => format!("ELU({})", args.join("+")),
            Self::Isru => format!("ISRU({})", args.join("+")),
        }
    }
}

#[inline]
fn fold<T: KernelValue>(args: &[T], op: impl Fn(&T, &T) -> T) -> T {
    args[1..]
        .iter()
        .fold(args[0].clone(), |acc, rhs| op(&acc, rhs))
}

#[inline]
fn sum_args<T: KernelValue>(args: &[T]) -> T {
    fold(args, T::add)
}

/// An ordered collection of kernels.
///
/// Function genes are indices into this set, so insertion order matters.
/// Inserting a kernel whose name is already present is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSet {
    kernels: Vec<Kernel>,
}

impl KernelSet {
    /// Build a kernel set from canonical names, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if any name is unknown.
    pub fn from_names(names: &[&str]) -> Result<Self> {
        let mut set = Self {
            kernels: Vec::with_capacity(names.len()),
        };
        for name in names {
            set.push_back(name)?;
        }
        Ok(set)
    }

    /// The four arithmetic kernels `sum, diff, mul, div`.
    #[must_use]
    pub fn basic() -> Self {
        Self {
            kernels: vec![Kernel::Sum, Kernel::Diff, Kernel::Mul, Kernel::Div],
        }
    }

    /// Append a kernel by name. Duplicates by name are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the name is unknown.
    pub fn push_back(&mut self, name: &str) -> Result<()> {
        let kernel = Kernel::from_name(name)?;
        if !self.kernels.contains(&kernel) {
            self.kernels.push(kernel);
        }
        Ok(())
    }

    /// Number of kernels in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// The kernel at `idx`, if any.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Kernel> {
        self.kernels.get(idx).copied()
    }

    /// The kernel at `idx`.
    ///
    /// Valid function genes are bounded by the set size, so expression
    /// internals index directly.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= len()`.
    #[inline]
    #[must_use]
    pub fn kernel(&self, idx: usize) -> Kernel {
        self.kernels[idx]
    }

    /// Iterate over the kernels in order.
    pub fn iter(&self) -> impl Iterator<Item = Kernel> + '_ {
        self.kernels.iter().copied()
    }
}
