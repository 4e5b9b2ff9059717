//! The symbolic-regression problem over a dCGP expression.
//!
//! [`SymbolicRegression`] wraps an [`Expression`] and a reference data set
//! into the problem surface an evolutionary host consumes: a fitness over a
//! mixed integer/continuous decision vector, exact gradients and Hessians
//! with respect to the embedded constants (obtained by evaluating the
//! expression over [`Taylor`] elements), sparsity patterns, bounds and
//! metadata.
//!
//! The decision vector is `[c1..c_ne | g1..g_G]`: the ephemeral constants
//! first, then the integer chromosome cast to the real domain. A small LRU
//! cache keyed by the integer suffix avoids re-scoring topologies the search
//! revisits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{DcgpError, Result};
use crate::expression::{Arity, Expression, GridConfig};
use crate::kernel::{KernelSet, KernelValue};
use crate::simplify::simplify_expression;
use crate::taylor::Taylor;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Bounded LRU capacity for the fitness cache.
const CACHE_CAPACITY: usize = 256;

/// Hyper-parameters of a symbolic-regression problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicRegressionConfig {
    /// Rows of the expression grid.
    pub rows: usize,
    /// Columns of the expression grid.
    pub cols: usize,
    /// Levels-back parameter.
    pub levels_back: usize,
    /// Arity of the internal nodes.
    pub arity: Arity,
    /// Number of ephemeral constants appended to the inputs.
    pub n_eph: usize,
    /// Report `[loss, complexity]` instead of `[loss]`.
    pub multi_objective: bool,
    /// Evaluate the sample loop in parallel.
    pub parallel: bool,
    /// Finite bounds for the ephemeral constants.
    pub eph_bounds: (f64, f64),
}

impl Default for SymbolicRegressionConfig {
    fn default() -> Self {
        Self {
            rows: 1,
            cols: 15,
            levels_back: 16,
            arity: Arity::Uniform(2),
            n_eph: 0,
            multi_objective: true,
            parallel: true,
            eph_bounds: (-10.0, 10.0),
        }
    }
}

/// A symbolic-regression problem: fit a dCGP expression to labelled points.
#[derive(Debug)]
pub struct SymbolicRegression {
    points: Vec<Vec<f64>>,
    labels: Vec<Vec<f64>>,
    config: SymbolicRegressionConfig,
    nix: usize,
    expr: Mutex<Expression>,
    cache: Mutex<EvalCache>,
    fevals: AtomicU64,
}

impl SymbolicRegression {
    /// Build a problem over a data set.
    ///
    /// The expression gets `point dimension + n_eph` inputs: each sample is
    /// bound to the leading inputs and the constants to the trailing ones.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on an empty or ragged data
    /// set, mismatched point/label counts, non-finite constant bounds, or an
    /// invalid grid shape / kernel set.
    pub fn new(
        points: Vec<Vec<f64>>,
        labels: Vec<Vec<f64>>,
        config: SymbolicRegressionConfig,
        kernels: KernelSet,
        seed: u64,
    ) -> Result<Self> {
        if points.is_empty() {
            return Err(DcgpError::invalid("the data set is empty"));
        }
        if points.len() != labels.len() {
            return Err(DcgpError::invalid(format!(
                "data and label size mismatch, data size is {} while label size is {}",
                points.len(),
                labels.len()
            )));
        }
        let d_in = points[0].len();
        let d_out = labels[0].len();
        if d_in == 0 {
            return Err(DcgpError::invalid("the point dimension cannot be zero"));
        }
        if points.iter().any(|p| p.len() != d_in) {
            return Err(DcgpError::invalid(
                "all points must share the same dimension",
            ));
        }
        if labels.iter().any(|l| l.len() != d_out) {
            return Err(DcgpError::invalid(
                "all labels must share the same dimension",
            ));
        }
        let (lo, hi) = config.eph_bounds;
        if !lo.is_finite() || !hi.is_finite() || lo >= hi {
            return Err(DcgpError::invalid(format!(
                "the ephemeral constant bounds must be finite with lower < upper, got [{lo}, {hi}]"
            )));
        }
        let grid = GridConfig {
            inputs: d_in + config.n_eph,
            outputs: d_out,
            rows: config.rows,
            cols: config.cols,
            levels_back: config.levels_back,
            arity: config.arity.clone(),
        };
        let expr = Expression::random(&grid, kernels, seed)?;
        let nix = expr.chromosome().len();
        Ok(Self {
            points,
            labels,
            config,
            nix,
            expr: Mutex::new(expr),
            cache: Mutex::new(EvalCache::default()),
            fevals: AtomicU64::new(0),
        })
    }

    /// Split a decision vector into constants and integer genes.
    fn split(&self, x: &[f64]) -> Result<(Vec<f64>, Vec<usize>)> {
        let expected = self.config.n_eph + self.nix;
        if x.len() != expected {
            return Err(DcgpError::invalid(format!(
                "the decision vector length is {}, expected {expected}",
                x.len()
            )));
        }
        let eph = x[..self.config.n_eph].to_vec();
        let genes = x[self.config.n_eph..].iter().map(|&g| g as usize).collect();
        Ok((eph, genes))
    }

    /// The fitness of a decision vector: the mean squared error over outputs
    /// and samples, followed by the active-node count when the problem is
    /// multi-objective.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a malformed decision
    /// vector.
    pub fn fitness(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.fevals.fetch_add(1, Ordering::Relaxed);
        let (eph, genes) = self.split(x)?;
        if let Some(f) = self.cache.lock().unwrap().fitness(&genes, &eph) {
            return Ok(f);
        }
        let (loss, complexity) = self.evaluate_loss(&eph, &genes)?;
        let f = if self.config.multi_objective {
            vec![loss, complexity as f64]
        } else {
            vec![loss]
        };
        self.cache
            .lock()
            .unwrap()
            .store_fitness(genes, eph, f.clone());
        Ok(f)
    }

    fn evaluate_loss(&self, eph: &[f64], genes: &[usize]) -> Result<(f64, usize)> {
        let mut guard = self.expr.lock().unwrap();
        guard.set(genes)?;
        let complexity = guard.active_nodes().len();
        let cgp: &Expression = &guard;
        let losses: Vec<f64> = self.map_samples(|point, label| {
            let mut input = Vec::with_capacity(point.len() + eph.len());
            input.extend_from_slice(point);
            input.extend_from_slice(eph);
            let out = cgp.call(&input)?;
            Ok(out
                .iter()
                .zip(label)
                .map(|(o, y)| (o - y) * (o - y))
                .sum::<f64>()
                / label.len() as f64)
        })?;
        let loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Ok((loss, complexity))
    }

    /// The gradient of the loss with respect to the ephemeral constants.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a malformed decision
    /// vector.
    pub fn gradient(&self, x: &[f64]) -> Result<Vec<f64>> {
        let (eph, genes) = self.split(x)?;
        if let Some((g, _)) = self.cache.lock().unwrap().grad_hess(&genes, &eph) {
            return Ok(g);
        }
        let (grad, hess) = self.compute_grad_hess(&eph, &genes)?;
        self.cache
            .lock()
            .unwrap()
            .store_grad_hess(genes, eph, grad.clone(), hess);
        Ok(grad)
    }

    /// The Hessians of the objectives with respect to the constants: the
    /// lower triangle for the loss, and an empty vector for the complexity
    /// objective when the problem is multi-objective.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a malformed decision
    /// vector.
    pub fn hessians(&self, x: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (eph, genes) = self.split(x)?;
        let cached = self.cache.lock().unwrap().grad_hess(&genes, &eph);
        let hess = match cached {
            Some((_, h)) => h,
            None => {
                let (grad, hess) = self.compute_grad_hess(&eph, &genes)?;
                self.cache
                    .lock()
                    .unwrap()
                    .store_grad_hess(genes, eph, grad, hess.clone());
                hess
            }
        };
        Ok(if self.config.multi_objective {
            vec![hess, Vec::new()]
        } else {
            vec![hess]
        })
    }

    /// One Taylor sweep with the constants as degree-2 variables yields the
    /// gradient and the lower-triangular Hessian together.
    fn compute_grad_hess(&self, eph: &[f64], genes: &[usize]) -> Result<(Vec<f64>, Vec<f64>)> {
        let n_eph = self.config.n_eph;
        let mut guard = self.expr.lock().unwrap();
        guard.set(genes)?;
        let cgp: &Expression = &guard;
        let per_sample: Vec<Taylor> = self.map_samples(|point, label| {
            let mut input: Vec<Taylor> = Vec::with_capacity(point.len() + n_eph);
            for &v in point {
                input.push(Taylor::constant(v, n_eph));
            }
            for (j, &c) in eph.iter().enumerate() {
                input.push(Taylor::variable(c, j, n_eph));
            }
            let out = cgp.call(&input)?;
            let mut err = Taylor::constant(0.0, n_eph);
            for (o, y) in out.iter().zip(label) {
                let d = o.sub(&Taylor::constant(*y, n_eph));
                err = err.add(&d.mul(&d));
            }
            Ok(err.mul(&Taylor::scalar(1.0 / label.len() as f64)))
        })?;
        let mut total = Taylor::constant(0.0, n_eph);
        for t in &per_sample {
            total = total.add(t);
        }
        total = total.mul(&Taylor::scalar(1.0 / self.points.len() as f64));

        let mut multi_index = vec![0usize; n_eph];
        let mut grad = vec![0.0; n_eph];
        for (j, g) in grad.iter_mut().enumerate() {
            multi_index[j] = 1;
            *g = total.get_derivative(&multi_index);
            multi_index[j] = 0;
        }
        let mut hess = Vec::with_capacity(n_eph * (n_eph + 1) / 2);
        for i in 0..n_eph {
            for j in 0..=i {
                multi_index[i] += 1;
                multi_index[j] += 1;
                hess.push(total.get_derivative(&multi_index));
                multi_index[i] = 0;
                multi_index[j] = 0;
            }
        }
        Ok((grad, hess))
    }

    /// The gradient sparsity: dense over the constants of the loss
    /// objective.
    #[must_use]
    pub fn gradient_sparsity(&self) -> Vec<(usize, usize)> {
        (0..self.config.n_eph).map(|j| (0, j)).collect()
    }

    /// The Hessian sparsity: the lower triangle over the constants for the
    /// loss, empty for the complexity objective.
    #[must_use]
    pub fn hessians_sparsity(&self) -> Vec<Vec<(usize, usize)>> {
        let tri: Vec<(usize, usize)> = (0..self.config.n_eph)
            .flat_map(|i| (0..=i).map(move |j| (i, j)))
            .collect();
        if self.config.multi_objective {
            vec![tri, Vec::new()]
        } else {
            vec![tri]
        }
    }

    /// Decision-vector bounds: the constant bounds followed by the gene
    /// bounds cast to the real domain.
    #[must_use]
    pub fn get_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let guard = self.expr.lock().unwrap();
        let (eph_lo, eph_hi) = self.config.eph_bounds;
        let mut lb = vec![eph_lo; self.config.n_eph];
        let mut ub = vec![eph_hi; self.config.n_eph];
        lb.extend(guard.lower_bounds().iter().map(|&b| b as f64));
        ub.extend(guard.upper_bounds().iter().map(|&b| b as f64));
        (lb, ub)
    }

    /// Length of the integer suffix of the decision vector.
    #[must_use]
    pub fn get_nix(&self) -> usize {
        self.nix
    }

    /// Number of continuous decision variables (the ephemeral constants).
    #[must_use]
    pub fn get_ncx(&self) -> usize {
        self.config.n_eph
    }

    /// Number of objectives.
    #[must_use]
    pub fn get_nobj(&self) -> usize {
        if self.config.multi_objective {
            2
        } else {
            1
        }
    }

    /// Number of fitness evaluations served so far, cache hits included.
    #[must_use]
    pub fn fevals(&self) -> u64 {
        self.fevals.load(Ordering::Relaxed)
    }

    /// A copy of the underlying expression (e.g. for mutation by a search).
    #[must_use]
    pub fn cgp(&self) -> Expression {
        self.expr.lock().unwrap().clone()
    }

    /// The symbolic form of the expression encoded by `x`, with the
    /// constants instantiated to their current values.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a malformed decision
    /// vector.
    pub fn pretty(&self, x: &[f64]) -> Result<String> {
        let (eph, genes) = self.split(x)?;
        let mut guard = self.expr.lock().unwrap();
        guard.set(&genes)?;
        let d_in = self.points[0].len();
        let mut symbols: Vec<String> = (0..d_in).map(|i| format!("x{i}")).collect();
        symbols.extend(eph.iter().map(|v| format!("{v}")));
        let outs = guard.pretty(&symbols)?;
        Ok(format!("[{}]", outs.join(", ")))
    }

    /// Like [`pretty`](Self::pretty), with a textual simplification pass.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a malformed decision
    /// vector.
    pub fn prettier(&self, x: &[f64]) -> Result<String> {
        let (eph, genes) = self.split(x)?;
        let mut guard = self.expr.lock().unwrap();
        guard.set(&genes)?;
        let d_in = self.points[0].len();
        let mut symbols: Vec<String> = (0..d_in).map(|i| format!("x{i}")).collect();
        symbols.extend(eph.iter().map(|v| format!("{v}")));
        let outs = guard.pretty(&symbols)?;
        let simplified: Vec<String> = outs.iter().map(|s| simplify_expression(s)).collect();
        Ok(format!("[{}]", simplified.join(", ")))
    }

    /// Problem name.
    #[must_use]
    pub fn name(&self) -> String {
        "a CGP symbolic regression problem".to_string()
    }

    /// Human-readable summary of the problem setup.
    #[must_use]
    pub fn extra_info(&self) -> String {
        format!(
            "\tData dimension (points): {}\n\
             \tData dimension (labels): {}\n\
             \tData size: {}\n\
             \tKernels: {:?}\n\
             \tEphemeral constants: {}\n\
             \tObjectives: {}\n",
            self.points[0].len(),
            self.labels[0].len(),
            self.points.len(),
            self.expr
                .lock()
                .unwrap()
                .kernels()
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>(),
            self.config.n_eph,
            self.get_nobj(),
        )
    }

    /// The problem configuration.
    #[must_use]
    pub fn config(&self) -> &SymbolicRegressionConfig {
        &self.config
    }

    /// Map a closure over sample pairs, in parallel when enabled. Results
    /// come back in sample order and every reduction over them is
    /// sequential, so parallel and serial runs produce identical bits.
    #[cfg(feature = "parallel")]
    fn map_samples<T: Send>(
        &self,
        f: impl Fn(&[f64], &[f64]) -> Result<T> + Send + Sync,
    ) -> Result<Vec<T>> {
        if self.config.parallel {
            self.points
                .par_iter()
                .zip(self.labels.par_iter())
                .map(|(p, l)| f(p, l))
                .collect()
        } else {
            self.points
                .iter()
                .zip(self.labels.iter())
                .map(|(p, l)| f(p, l))
                .collect()
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn map_samples<T: Send>(
        &self,
        f: impl Fn(&[f64], &[f64]) -> Result<T> + Send + Sync,
    ) -> Result<Vec<T>> {
        self.points
            .iter()
            .zip(self.labels.iter())
            .map(|(p, l)| f(p, l))
            .collect()
    }
}

#[derive(Debug)]
struct CacheEntry {
    genes: Vec<usize>,
    eph: Vec<f64>,
    fitness: Option<Vec<f64>>,
    grad_hess: Option<(Vec<f64>, Vec<f64>)>,
}

/// LRU cache keyed by the integer suffix; entries are only served when the
/// real prefix matches too. Insertion moves an entry to the front, the tail
/// is evicted past capacity.
#[derive(Debug, Default)]
struct EvalCache {
    entries: VecDeque<CacheEntry>,
}

impl EvalCache {
    fn touch(&mut self, genes: &[usize]) -> Option<&mut CacheEntry> {
        let pos = self.entries.iter().position(|e| e.genes == genes)?;
        let entry = self.entries.remove(pos).unwrap();
        self.entries.push_front(entry);
        self.entries.front_mut()
    }

    fn fitness(&mut self, genes: &[usize], eph: &[f64]) -> Option<Vec<f64>> {
        let entry = self.touch(genes)?;
        if entry.eph == eph {
            entry.fitness.clone()
        } else {
            None
        }
    }

    fn grad_hess(&mut self, genes: &[usize], eph: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
        let entry = self.touch(genes)?;
        if entry.eph == eph {
            entry.grad_hess.clone()
        } else {
            None
        }
    }

    fn entry_mut(&mut self, genes: Vec<usize>, eph: Vec<f64>) -> &mut CacheEntry {
        if let Some(pos) = self.entries.iter().position(|e| e.genes == genes) {
            let mut entry = self.entries.remove(pos).unwrap();
            if entry.eph != eph {
                entry.eph = eph;
                entry.fitness = None;
                entry.grad_hess = None;
            }
            self.entries.push_front(entry);
        } else {
            self.entries.push_front(CacheEntry {
                genes,
                eph,
                fitness: None,
                grad_hess: None,
            });
            self.entries.truncate(CACHE_CAPACITY);
        }
        self.entries.front_mut().unwrap()
    }

    fn store_fitness(&mut self, genes: Vec<usize>, eph: Vec<f64>, f: Vec<f64>) {
        self.entry_mut(genes, eph).fitness = Some(f);
    }

    fn store_grad_hess(
        &mut self,
        genes: Vec<usize>,
        eph: Vec<f64>,
        grad: Vec<f64>,
        hess: Vec<f64>,
    ) {
        self.entry_mut(genes, eph).grad_hess = Some((grad, hess));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelSet;

    fn config(
        rows: usize,
        cols: usize,
        levels_back: usize,
        arity: usize,
        n_eph: usize,
    ) -> SymbolicRegressionConfig {
        SymbolicRegressionConfig {
            rows,
            cols,
            levels_back,
            arity: Arity::Uniform(arity),
            n_eph,
            multi_objective: false,
            parallel: false,
            ..Default::default()
        }
    }

    // Chromosome encoding [2*x0*x1, 2*x0] on a 2x2 grid with levels-back 3.
    const TEST_X: [f64; 14] = [
        0., 1., 1., 0., 0., 0., 2., 0., 2., 2., 0., 2., 4., 3.,
    ];

    #[test]
    fn test_construction_rejects_bad_data() {
        let kernels = KernelSet::basic();
        let cfg = config(2, 2, 3, 2, 0);
        // Empty data set.
        assert!(
            SymbolicRegression::new(vec![], vec![], cfg.clone(), kernels.clone(), 0).is_err()
        );
        // Point/label count mismatch, both ways.
        assert!(SymbolicRegression::new(
            vec![vec![1., 2.], vec![0.3, -0.32], vec![0.3, -0.32]],
            vec![vec![1.5], vec![0.0625]],
            cfg.clone(),
            kernels.clone(),
            0
        )
        .is_err());
        assert!(SymbolicRegression::new(
            vec![vec![1., 2.], vec![0.3, -0.32]],
            vec![vec![1.5], vec![0.0625], vec![0.0625]],
            cfg.clone(),
            kernels.clone(),
            0
        )
        .is_err());
        // Ragged points and ragged labels.
        assert!(SymbolicRegression::new(
            vec![vec![1., 2.], vec![0.3, -0.32, 0.3]],
            vec![vec![1.5], vec![0.0625]],
            cfg.clone(),
            kernels.clone(),
            0
        )
        .is_err());
        assert!(SymbolicRegression::new(
            vec![vec![1., 2.], vec![0.3, -0.32]],
            vec![vec![1.5, 2.2], vec![0.0625]],
            cfg.clone(),
            kernels.clone(),
            0
        )
        .is_err());
        // Degenerate grids and kernel sets.
        let points = vec![vec![1., 2.], vec![0.3, -0.32]];
        let labels = vec![vec![1.5], vec![0.0625]];
        for bad in [
            config(0, 1, 1, 2, 0),
            config(1, 0, 1, 2, 0),
            config(1, 1, 0, 2, 0),
            config(1, 1, 1, 0, 0),
        ] {
            assert!(SymbolicRegression::new(
                points.clone(),
                labels.clone(),
                bad,
                kernels.clone(),
                0
            )
            .is_err());
        }
        let empty = KernelSet::from_names(&[]).unwrap();
        assert!(
            SymbolicRegression::new(points, labels, config(1, 1, 1, 2, 0), empty, 0).is_err()
        );
    }

    #[test]
    fn test_fitness_on_known_chromosome() {
        let kernels = KernelSet::basic();
        let cfg = config(2, 2, 3, 2, 0);
        // Perfect fit.
        let udp = SymbolicRegression::new(
            vec![vec![1., 1.]],
            vec![vec![2., 2.]],
            cfg.clone(),
            kernels.clone(),
            0,
        )
        .unwrap();
        assert_eq!(udp.fitness(&TEST_X).unwrap()[0], 0.);
        // Squared error averaged over the two outputs.
        let udp = SymbolicRegression::new(
            vec![vec![1., 1.]],
            vec![vec![0., 0.]],
            cfg.clone(),
            kernels.clone(),
            0,
        )
        .unwrap();
        assert_eq!(udp.fitness(&TEST_X).unwrap()[0], 4.);
        let udp = SymbolicRegression::new(
            vec![vec![1., 0.]],
            vec![vec![0., 0.]],
            cfg.clone(),
            kernels.clone(),
            0,
        )
        .unwrap();
        assert_eq!(udp.fitness(&TEST_X).unwrap()[0], 2.);
        // ... and over the samples.
        let udp = SymbolicRegression::new(
            vec![vec![1., 1.], vec![1., 0.]],
            vec![vec![2., 2.], vec![0., 0.]],
            cfg,
            kernels,
            0,
        )
        .unwrap();
        assert_eq!(udp.fitness(&TEST_X).unwrap()[0], 1.);
    }

    #[test]
    fn test_fitness_with_ephemeral_constants() {
        // One row, ten columns; constants c1 = 1, c2 = 2 feed inputs 2 and 3.
        let kernels = KernelSet::basic();
        let cfg = config(1, 10, 11, 2, 2);
        let x: Vec<f64> = vec![
            1., 2., 0., 0., 2., 1., 0., 1., 1., 2., 3., 0., 3., 1., 1., 6., 0., 0., 4., 1., 2.,
            1., 1., 1., 9., 5., 2., 3., 3., 0., 5., 0., 8., 11.,
        ];
        let udp = SymbolicRegression::new(
            vec![vec![1., 0.]],
            vec![vec![0., 3.]],
            cfg.clone(),
            kernels.clone(),
            0,
        )
        .unwrap();
        // Encoded outputs at this point: c1 - c2 - x0 = -2 and 1.
        assert_eq!(udp.fitness(&x).unwrap()[0], 4.);

        let udp = SymbolicRegression::new(
            vec![vec![-1., -1.]],
            vec![vec![0., -1.]],
            cfg,
            kernels,
            0,
        )
        .unwrap();
        assert_eq!(udp.fitness(&x).unwrap()[0], 0.);
        let mut x2 = x;
        x2[0] = 3.;
        x2[1] = 3.;
        assert_eq!(udp.fitness(&x2).unwrap()[0], 2.5);
    }

    // A hand-wired expression computing c1 * x0 + c2 with two constants.
    fn linear_problem(points: Vec<Vec<f64>>, labels: Vec<Vec<f64>>) -> (SymbolicRegression, Vec<f64>) {
        let kernels = KernelSet::basic();
        let cfg = SymbolicRegressionConfig {
            rows: 1,
            cols: 3,
            levels_back: 4,
            arity: Arity::Uniform(2),
            n_eph: 2,
            multi_objective: false,
            parallel: false,
            ..Default::default()
        };
        let udp = SymbolicRegression::new(points, labels, cfg, kernels, 0).unwrap();
        // Inputs: x0 (0), c1 (1), c2 (2); node 3 = c1 * x0, node 4 = node3 + c2.
        let x = vec![1., 1., 2., 0., 1., 0., 3., 2., 0., 0., 0., 4.];
        (udp, x)
    }

    #[test]
    fn test_gradient_and_hessian_of_linear_model() {
        let (udp, x) = linear_problem(vec![vec![2.0]], vec![vec![5.0]]);
        // Loss (c1*2 + c2 - 5)^2 at c = (1, 1) is 4.
        assert_eq!(udp.fitness(&x).unwrap()[0], 4.0);
        let grad = udp.gradient(&x).unwrap();
        assert!((grad[0] - -8.0).abs() < 1e-12);
        assert!((grad[1] - -4.0).abs() < 1e-12);
        let hess = udp.hessians(&x).unwrap();
        assert_eq!(hess.len(), 1);
        assert_eq!(hess[0].len(), 3);
        assert!((hess[0][0] - 8.0).abs() < 1e-12);
        assert!((hess[0][1] - 4.0).abs() < 1e-12);
        assert!((hess[0][2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (udp, x) = linear_problem(
            vec![vec![1.0], vec![2.0], vec![-0.5]],
            vec![vec![3.0], vec![5.0], vec![0.2]],
        );
        let grad = udp.gradient(&x).unwrap();
        let h = 1e-6;
        for j in 0..2 {
            let mut hi = x.clone();
            hi[j] += h;
            let mut lo = x.clone();
            lo[j] -= h;
            let numeric =
                (udp.fitness(&hi).unwrap()[0] - udp.fitness(&lo).unwrap()[0]) / (2.0 * h);
            assert!(
                (numeric - grad[j]).abs() < 1e-5,
                "constant {j}: numeric {numeric} vs analytic {}",
                grad[j]
            );
        }
    }

    #[test]
    fn test_sparsity_patterns() {
        let (udp, _) = linear_problem(vec![vec![1.0]], vec![vec![1.0]]);
        assert_eq!(udp.gradient_sparsity(), vec![(0, 0), (0, 1)]);
        assert_eq!(udp.hessians_sparsity(), vec![vec![(0, 0), (1, 0), (1, 1)]]);
    }

    #[test]
    fn test_bounds_and_sizes() {
        let kernels = KernelSet::basic();
        let cfg = config(2, 2, 3, 2, 0);
        let udp = SymbolicRegression::new(
            vec![vec![1., 2.], vec![0.3, -0.32]],
            vec![vec![1.5], vec![0.0625]],
            cfg,
            kernels,
            23,
        )
        .unwrap();
        let (lb, ub) = udp.get_bounds();
        assert_eq!(lb.len(), udp.get_nix());
        assert_eq!(ub.len(), udp.get_nix());
        let cgp = udp.cgp();
        let expected: Vec<f64> = cgp.lower_bounds().iter().map(|&b| b as f64).collect();
        assert_eq!(lb, expected);
        assert!(udp.name().contains("CGP"));
        assert!(udp.extra_info().contains("Data dimension"));
    }

    #[test]
    fn test_pretty_and_prettier() {
        let kernels = KernelSet::basic();
        let cfg = config(2, 2, 3, 2, 0);
        let udp = SymbolicRegression::new(
            vec![vec![1., 1.]],
            vec![vec![2., 2.]],
            cfg,
            kernels,
            0,
        )
        .unwrap();
        assert_eq!(udp.pretty(&TEST_X).unwrap(), "[(x0*(x1+x1)), (x0+x0)]");
        assert_eq!(udp.prettier(&TEST_X).unwrap(), "[2*x0*x1, 2*x0]");
    }

    #[test]
    fn test_multi_objective_reports_complexity() {
        let kernels = KernelSet::basic();
        let cfg = SymbolicRegressionConfig {
            rows: 2,
            cols: 2,
            levels_back: 3,
            arity: Arity::Uniform(2),
            n_eph: 0,
            multi_objective: true,
            parallel: false,
            ..Default::default()
        };
        let udp = SymbolicRegression::new(
            vec![vec![1., 1.]],
            vec![vec![2., 2.]],
            cfg,
            kernels,
            0,
        )
        .unwrap();
        let f = udp.fitness(&TEST_X).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(udp.get_nobj(), 2);
        // Nodes 0..4 are active for this chromosome.
        assert_eq!(f[1], 5.0);
        assert_eq!(udp.hessians_sparsity().len(), 2);
        assert!(udp.hessians_sparsity()[1].is_empty());
    }

    #[test]
    fn test_cache_returns_identical_results() {
        let (udp, x) = linear_problem(vec![vec![2.0]], vec![vec![5.0]]);
        let f1 = udp.fitness(&x).unwrap();
        let g1 = udp.gradient(&x).unwrap();
        let f2 = udp.fitness(&x).unwrap();
        let g2 = udp.gradient(&x).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(g1, g2);
        // A changed real prefix bypasses the cache.
        let mut x2 = x.clone();
        x2[0] = 2.0;
        let f3 = udp.fitness(&x2).unwrap();
        assert!(f3[0].abs() < 1e-12); // c1 = 2 fits exactly: (2*2 + 1 - 5)^2 = 0
        // Fitness evaluations are counted either way.
        assert_eq!(udp.fevals(), 3);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let kernels = KernelSet::basic();
        let points: Vec<Vec<f64>> = (0..40)
            .map(|i| vec![i as f64 * 0.1, 1.0 - i as f64 * 0.05])
            .collect();
        let labels: Vec<Vec<f64>> = points.iter().map(|p| vec![p[0] * p[1], p[0]]).collect();
        let mut cfg = config(2, 2, 3, 2, 0);
        cfg.parallel = false;
        let serial =
            SymbolicRegression::new(points.clone(), labels.clone(), cfg.clone(), kernels.clone(), 0)
                .unwrap();
        cfg.parallel = true;
        let parallel = SymbolicRegression::new(points, labels, cfg, kernels, 0).unwrap();
        let fs = serial.fitness(&TEST_X).unwrap();
        let fp = parallel.fitness(&TEST_X).unwrap();
        assert_eq!(fs, fp);
    }
}
