//! A population of scored decision vectors over a symbolic-regression
//! problem.
//!
//! The population owns its problem and keeps `(x, f)` pairs aligned by
//! index. Random initialisation draws every coordinate uniformly within the
//! problem bounds, respecting the integer suffix.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{DcgpError, Result};
use crate::problem::SymbolicRegression;

/// An ordered set of scored individuals.
#[derive(Debug)]
pub struct Population {
    problem: SymbolicRegression,
    x: Vec<Vec<f64>>,
    f: Vec<Vec<f64>>,
}

impl Population {
    /// Create a population of `size` random individuals.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if scoring a drawn individual
    /// fails.
    pub fn random(problem: SymbolicRegression, size: usize, seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let (lb, ub) = problem.get_bounds();
        let ncx = problem.get_ncx();
        let mut pop = Self {
            problem,
            x: Vec::with_capacity(size),
            f: Vec::with_capacity(size),
        };
        for _ in 0..size {
            let x: Vec<f64> = lb
                .iter()
                .zip(&ub)
                .enumerate()
                .map(|(i, (&lo, &hi))| {
                    if i < ncx {
                        rng.random_range(lo..=hi)
                    } else {
                        rng.random_range(lo as usize..=hi as usize) as f64
                    }
                })
                .collect();
            let f = pop.problem.fitness(&x)?;
            pop.x.push(x);
            pop.f.push(f);
        }
        Ok(pop)
    }

    /// Score a decision vector with the owned problem and append it.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the decision vector is
    /// malformed.
    pub fn push_back(&mut self, x: Vec<f64>) -> Result<()> {
        let f = self.problem.fitness(&x)?;
        self.x.push(x);
        self.f.push(f);
        Ok(())
    }

    /// Append an already scored individual.
    pub fn push_back_scored(&mut self, x: Vec<f64>, f: Vec<f64>) {
        self.x.push(x);
        self.f.push(f);
    }

    /// Overwrite individual `i` in place.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `i` is out of range.
    pub fn set_xf(&mut self, i: usize, x: Vec<f64>, f: Vec<f64>) -> Result<()> {
        if i >= self.x.len() {
            return Err(DcgpError::invalid(format!(
                "individual index is {i}, the population has {} members",
                self.x.len()
            )));
        }
        self.x[i] = x;
        self.f[i] = f;
        Ok(())
    }

    /// The decision vectors.
    #[must_use]
    pub fn get_x(&self) -> &[Vec<f64>] {
        &self.x
    }

    /// The fitness vectors.
    #[must_use]
    pub fn get_f(&self) -> &[Vec<f64>] {
        &self.f
    }

    /// Number of individuals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the population is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// The owned problem.
    #[must_use]
    pub fn problem(&self) -> &SymbolicRegression {
        &self.problem
    }
}
