//! Second-order truncated Taylor elements.
//!
//! A [`Taylor`] carries a value together with its dense gradient and the
//! lower triangle of its Hessian with respect to a fixed set of variables.
//! Propagating these through an expression evaluation yields exact first and
//! second derivatives with respect to the designated variables, which is all
//! the Newton refinement of embedded constants consumes.
//!
//! Constants produced by [`KernelValue::from_f64`] carry no variables and
//! broadcast against any operand, so kernels can stay oblivious to the
//! variable count.

use crate::kernel::KernelValue;

/// A degree-2 truncated Taylor element over `n_vars` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Taylor {
    n_vars: usize,
    value: f64,
    /// First derivatives, one per variable.
    grad: Vec<f64>,
    /// Second derivatives, lower triangle in row-major order:
    /// entry `(i, j)` with `j <= i` lives at `i * (i + 1) / 2 + j`.
    hess: Vec<f64>,
}

#[inline]
fn tri(i: usize, j: usize) -> usize {
    let (hi, lo) = if i >= j { (i, j) } else { (j, i) };
    hi * (hi + 1) / 2 + lo
}

impl Taylor {
    /// A constant with respect to `n_vars` variables.
    #[must_use]
    pub fn constant(value: f64, n_vars: usize) -> Self {
        Self {
            n_vars,
            value,
            grad: vec![0.0; n_vars],
            hess: vec![0.0; n_vars * (n_vars + 1) / 2],
        }
    }

    /// The indeterminate for variable `index`, expanded around `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= n_vars`.
    #[must_use]
    pub fn variable(value: f64, index: usize, n_vars: usize) -> Self {
        assert!(index < n_vars, "variable index out of range");
        let mut t = Self::constant(value, n_vars);
        t.grad[index] = 1.0;
        t
    }

    /// A variable-free scalar; broadcasts against any operand.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self::constant(value, 0)
    }

    /// The zeroth-order coefficient.
    #[must_use]
    pub fn constant_cf(&self) -> f64 {
        self.value
    }

    /// Number of variables this element ranges over.
    #[must_use]
    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    /// The derivative selected by a multi-index over the variables.
    ///
    /// The multi-index must have one entry per variable; entries sum to the
    /// derivative order. Orders above the truncation degree (2) are zero.
    ///
    /// # Panics
    ///
    /// Panics if `multi_index.len() != n_vars()`.
    #[must_use]
    pub fn get_derivative(&self, multi_index: &[usize]) -> f64 {
        assert_eq!(
            multi_index.len(),
            self.n_vars,
            "multi-index length must match the variable count"
        );
        let order: usize = multi_index.iter().sum();
        match order {
            0 => self.value,
            1 => {
                let i = multi_index.iter().position(|&o| o == 1).unwrap_or(0);
                self.grad[i]
            }
            2 => {
                let mut pair = [0usize; 2];
                let mut found = 0;
                for (i, &o) in multi_index.iter().enumerate() {
                    for _ in 0..o {
                        pair[found] = i;
                        found += 1;
                    }
                }
                self.hess[tri(pair[0], pair[1])]
            }
            _ => 0.0,
        }
    }

    #[inline]
    fn g(&self, i: usize) -> f64 {
        if self.n_vars == 0 {
            0.0
        } else {
            self.grad[i]
        }
    }

    #[inline]
    fn h(&self, i: usize, j: usize) -> f64 {
        if self.n_vars == 0 {
            0.0
        } else {
            self.hess[tri(i, j)]
        }
    }

    fn broadcast_vars(&self, rhs: &Self) -> usize {
        debug_assert!(
            self.n_vars == rhs.n_vars || self.n_vars == 0 || rhs.n_vars == 0,
            "mixed variable counts in Taylor arithmetic"
        );
        self.n_vars.max(rhs.n_vars)
    }

    /// Chain rule for a scalar function with value `f0` and derivatives
    /// `f1`, `f2` at this element's value.
    fn compose(&self, f0: f64, f1: f64, f2: f64) -> Self {
        let n = self.n_vars;
        let mut out = Self::constant(f0, n);
        for i in 0..n {
            out.grad[i] = f1 * self.grad[i];
        }
        for i in 0..n {
            for j in 0..=i {
                out.hess[tri(i, j)] = f1 * self.hess[tri(i, j)] + f2 * self.grad[i] * self.grad[j];
            }
        }
        out
    }

    /// The multiplicative inverse.
    #[must_use]
    pub fn recip(&self) -> Self {
        let v = self.value;
        self.compose(1.0 / v, -1.0 / (v * v), 2.0 / (v * v * v))
    }
}

impl KernelValue for Taylor {
    fn from_f64(c: f64) -> Self {
        Self::scalar(c)
    }

    fn cf(&self) -> f64 {
        self.value
    }

    fn add(&self, rhs: &Self) -> Self {
        let n = self.broadcast_vars(rhs);
        let mut out = Self::constant(self.value + rhs.value, n);
        for i in 0..n {
            out.grad[i] = self.g(i) + rhs.g(i);
        }
        for i in 0..n {
            for j in 0..=i {
                out.hess[tri(i, j)] = self.h(i, j) + rhs.h(i, j);
            }
        }
        out
    }

    fn sub(&self, rhs: &Self) -> Self {
        let n = self.broadcast_vars(rhs);
        let mut out = Self::constant(self.value - rhs.value, n);
        for i in 0..n {
            out.grad[i] = self.g(i) - rhs.g(i);
        }
        for i in 0..n {
            for j in 0..=i {
                out.hess[tri(i, j)] = self.h(i, j) - rhs.h(i, j);
            }
        }
        out
    }

    fn mul(&self, rhs: &Self) -> Self {
        let n = self.broadcast_vars(rhs);
        let mut out = Self::constant(self.value * rhs.value, n);
        for i in 0..n {
            out.grad[i] = self.value * rhs.g(i) + rhs.value * self.g(i);
        }
        for i in 0..n {
            for j in 0..=i {
                out.hess[tri(i, j)] = self.value * rhs.h(i, j)
                    + rhs.value * self.h(i, j)
                    + self.g(i) * rhs.g(j)
                    + self.g(j) * rhs.g(i);
            }
        }
        out
    }

    fn div(&self, rhs: &Self) -> Self {
        self.mul(&rhs.recip())
    }

    fn exp(&self) -> Self {
        let e = self.value.exp();
        self.compose(e, e, e)
    }

    fn ln(&self) -> Self {
        let v = self.value;
        self.compose(v.ln(), 1.0 / v, -1.0 / (v * v))
    }

    fn sin(&self) -> Self {
        let (s, c) = self.value.sin_cos();
        self.compose(s, c, -s)
    }

    fn cos(&self) -> Self {
        let (s, c) = self.value.sin_cos();
        self.compose(c, -s, -c)
    }

    fn tanh(&self) -> Self {
        let t = self.value.tanh();
        let sech2 = 1.0 - t * t;
        self.compose(t, sech2, -2.0 * t * sech2)
    }

    fn sqrt(&self) -> Self {
        let s = self.value.sqrt();
        self.compose(s, 0.5 / s, -0.25 / (s * s * s))
    }
}
