//! Multi-objective memetic search for symbolic regression.
//!
//! [`MemeticSearch`] evolves a [`Population`] by mutating the integer part
//! of each individual (the graph) and refining the continuous part (the
//! embedded constants) with one damped Newton step built from the exact
//! gradient and Hessian the problem exposes. Survivors are picked by
//! non-dominated sorting over loss and complexity.
//!
//! The Newton step is heavily guarded: it restricts itself to the constants
//! with a non-zero gradient, requires an invertible, positive-semidefinite
//! reduced Hessian (read off the full-pivot LU factor's diagonal, by
//! Sylvester's inertia) and a finite inverse, and otherwise leaves the
//! constants untouched. Candidates with non-finite or duplicate fitness are
//! discarded before selection.

use nalgebra::{DMatrix, DVector};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{DcgpError, Result};
use crate::pareto;
use crate::population::Population;
use crate::problem::SymbolicRegression;

/// One logged generation.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Generation number.
    pub gen: usize,
    /// Fitness evaluations consumed since `evolve` started.
    pub fevals: u64,
    /// Best loss in the population (first coordinate of the ideal point).
    pub best_loss: f64,
    /// Size of the non-dominated front.
    pub ndf_size: usize,
    /// Complexity at the nadir point.
    pub complexity: f64,
}

/// The multi-objective memetic evolutionary strategy.
#[derive(Debug)]
pub struct MemeticSearch {
    gen: usize,
    max_mut: usize,
    seed: u64,
    verbosity: usize,
    rng: ChaCha8Rng,
    log: Vec<LogLine>,
}

impl MemeticSearch {
    /// Create a search running `gen` generations with mutation strengths
    /// drawn from `0..max_mut` (zero permits pure Newton steps).
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] when `max_mut` is zero.
    pub fn new(gen: usize, max_mut: usize, seed: u64) -> Result<Self> {
        if max_mut == 0 {
            return Err(DcgpError::invalid(
                "the maximum number of active mutations is zero, it must be at least 1",
            ));
        }
        Ok(Self {
            gen,
            max_mut,
            seed,
            verbosity: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            log: Vec::new(),
        })
    }

    /// Evolve a population for the configured number of generations.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the problem is not
    /// bi-objective or the population holds fewer than two individuals.
    pub fn evolve(&mut self, pop: Population) -> Result<Population> {
        self.evolve_while(pop, || true)
    }

    /// Like [`evolve`](Self::evolve), consulting `should_continue` before
    /// each generation for cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the problem is not
    /// bi-objective or the population holds fewer than two individuals.
    pub fn evolve_while(
        &mut self,
        mut pop: Population,
        mut should_continue: impl FnMut() -> bool,
    ) -> Result<Population> {
        let np = pop.len();
        let n_obj = pop.problem().get_nobj();
        if n_obj != 2 {
            return Err(DcgpError::invalid(format!(
                "this search needs a bi-objective symbolic regression problem, \
                 {n_obj} objective(s) detected"
            )));
        }
        if np < 2 {
            return Err(DcgpError::invalid(format!(
                "this search needs at least 2 individuals in the population, {np} detected"
            )));
        }
        if self.gen == 0 {
            return Ok(pop);
        }
        self.log.clear();
        let fevals0 = pop.problem().fevals();
        let n_eph = pop.problem().get_ncx();
        let hessian_pairs = pop.problem().hessians_sparsity()[0].clone();
        let mut cgp = pop.problem().cgp();

        for gen in 1..=self.gen {
            if !should_continue() {
                break;
            }
            if self.verbosity > 0 && (gen - 1) % self.verbosity == 0 {
                self.log_line(gen - 1, pop.problem().fevals() - fevals0, &pop);
            }

            // Mutation strengths 0..max_mut, deterministically shuffled so
            // zero shows up and some individuals take pure Newton steps.
            let mut strengths: Vec<usize> = (0..np).map(|i| i % self.max_mut).collect();
            strengths.shuffle(&mut self.rng);

            let mut pool_x = pop.get_x().to_vec();
            let mut pool_f = pop.get_f().to_vec();
            for i in 0..np {
                let mut x = pop.get_x()[i].clone();

                // Graph mutation on the integer part only.
                let genes: Vec<usize> = x[n_eph..].iter().map(|&g| g as usize).collect();
                cgp.set(&genes)?;
                cgp.mutate_active(strengths[i]);
                for (dst, &g) in x[n_eph..].iter_mut().zip(cgp.chromosome()) {
                    *dst = g as f64;
                }

                // Constant refinement on the continuous part only.
                if n_eph > 0 {
                    newton_step(pop.problem(), &hessian_pairs, n_eph, &mut x)?;
                }

                // Score, then discard non-finite or duplicate candidates.
                let f = pop.problem().fitness(&x)?;
                if f[0].is_finite() && !pool_f.contains(&f) {
                    pool_x.push(x);
                    pool_f.push(f);
                }
            }

            let best = pareto::select_best_n_mo(&pool_f, np);
            for (i, &w) in best.iter().enumerate() {
                pop.set_xf(i, pool_x[w].clone(), pool_f[w].clone())?;
            }
        }
        if self.verbosity > 0 {
            self.log_line(self.gen, pop.problem().fevals() - fevals0, &pop);
            tracing::info!(gen = self.gen, "exit condition reached, max generations");
        }
        Ok(pop)
    }

    fn log_line(&mut self, gen: usize, fevals: u64, pop: &Population) {
        let ideal = pareto::ideal(pop.get_f());
        let nadir = pareto::nadir(pop.get_f());
        let ndf_size = pareto::fast_non_dominated_sorting(pop.get_f())
            .first()
            .map_or(0, Vec::len);
        let line = LogLine {
            gen,
            fevals,
            best_loss: ideal[0],
            ndf_size,
            complexity: nadir[1],
        };
        tracing::info!(
            gen = line.gen,
            fevals = line.fevals,
            best_loss = line.best_loss,
            ndf_size = line.ndf_size,
            complexity = line.complexity,
            "generation"
        );
        self.log.push(line);
    }

    /// Reseed the internal random engine.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// The seed controlling the stochastic behaviour.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Log every `verbosity` generations; zero disables logging.
    pub fn set_verbosity(&mut self, verbosity: usize) {
        self.verbosity = verbosity;
    }

    /// The verbosity level.
    #[must_use]
    pub fn verbosity(&self) -> usize {
        self.verbosity
    }

    /// The per-generation statistics accumulated by the last `evolve` call.
    #[must_use]
    pub fn log(&self) -> &[LogLine] {
        &self.log
    }

    /// Algorithm name.
    #[must_use]
    pub fn name(&self) -> String {
        "MOM-ES for CGP: multi-objective memetic evolutionary strategy".to_string()
    }

    /// Human-readable summary of the search setup.
    #[must_use]
    pub fn extra_info(&self) -> String {
        format!(
            "\tMaximum number of generations: {}\n\
             \tMaximum number of active mutations: {}\n\
             \tVerbosity: {}\n\
             \tSeed: {}\n",
            self.gen, self.max_mut, self.verbosity, self.seed
        )
    }
}

/// One guarded Newton step on the constants of `x`, in place.
///
/// Coordinates with a zero gradient are dropped from the system; the reduced
/// step is applied only when the gradient is finite and the reduced Hessian
/// is invertible, positive semidefinite and finitely invertible. The refined
/// reduced vector is written back coordinate by coordinate.
fn newton_step(
    problem: &SymbolicRegression,
    hessian_pairs: &[(usize, usize)],
    n_eph: usize,
    x: &mut [f64],
) -> Result<()> {
    let grad = problem.gradient(x)?;
    let hessians = problem.hessians(x)?;
    let hess = &hessians[0];

    if n_eph == 1 {
        if grad[0] != 0.0 {
            x[0] -= grad[0] / hess[0];
        }
        return Ok(());
    }

    let non_zero: Vec<usize> = (0..n_eph).filter(|&j| grad[j] != 0.0).collect();
    match non_zero.len() {
        0 => {}
        1 => {
            let j = non_zero[0];
            let diag = hess[j * (j + 1) / 2 + j];
            x[j] -= grad[j] / diag;
        }
        s => {
            let mut reduced_of = vec![usize::MAX; n_eph];
            for (r, &j) in non_zero.iter().enumerate() {
                reduced_of[j] = r;
            }
            let mut h_red = DMatrix::<f64>::zeros(s, s);
            for (k, &(i, j)) in hessian_pairs.iter().enumerate() {
                let (ri, rj) = (reduced_of[i], reduced_of[j]);
                if ri != usize::MAX && rj != usize::MAX {
                    h_red[(ri, rj)] = hess[k];
                    h_red[(rj, ri)] = hess[k];
                }
            }
            let g_red = DVector::from_iterator(s, non_zero.iter().map(|&j| grad[j]));
            if !g_red.iter().all(|v| v.is_finite()) {
                return Ok(());
            }
            let lu = h_red.full_piv_lu();
            if !lu.is_invertible() {
                return Ok(());
            }
            if !lu.u().diagonal().iter().all(|&d| d >= 0.0) {
                return Ok(());
            }
            let Some(inverse) = lu.try_inverse() else {
                return Ok(());
            };
            if !inverse.iter().all(|v| v.is_finite()) {
                return Ok(());
            }
            let step = inverse * g_red;
            for (r, &j) in non_zero.iter().enumerate() {
                x[j] -= step[r];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Arity;
    use crate::kernel::KernelSet;
    use crate::problem::{SymbolicRegression, SymbolicRegressionConfig};

    // A problem whose expression can encode c1 * x0 + c2.
    fn linear_problem() -> SymbolicRegression {
        let cfg = SymbolicRegressionConfig {
            rows: 1,
            cols: 3,
            levels_back: 4,
            arity: Arity::Uniform(2),
            n_eph: 2,
            parallel: false,
            ..Default::default()
        };
        SymbolicRegression::new(
            vec![vec![1.0], vec![2.0]],
            vec![vec![3.0], vec![5.0]],
            cfg,
            KernelSet::basic(),
            0,
        )
        .unwrap()
    }

    // The decision vector wiring node 3 = c1 * x0 and node 4 = node3 + c2,
    // with c = (1, 1).
    fn linear_x() -> Vec<f64> {
        vec![1., 1., 2., 0., 1., 0., 3., 2., 0., 0., 0., 4.]
    }

    // Replace individuals whose loss came out non-finite (division kernels
    // make that possible at random) with an all-sum chromosome, keeping the
    // population well-behaved for assertions about the ideal point.
    fn sanitize(pop: &mut Population) {
        let (lb, _) = pop.problem().get_bounds();
        let ncx = pop.problem().get_ncx();
        let safe: Vec<f64> = lb
            .iter()
            .enumerate()
            .map(|(i, &lo)| if i < ncx { 1.0 } else { lo })
            .collect();
        for i in 0..pop.len() {
            if !pop.get_f()[i][0].is_finite() {
                let f = pop.problem().fitness(&safe).unwrap();
                pop.set_xf(i, safe.clone(), f).unwrap();
            }
        }
    }

    #[test]
    fn test_construction_rejects_zero_max_mut() {
        assert!(MemeticSearch::new(10, 0, 42).is_err());
        assert!(MemeticSearch::new(10, 1, 42).is_ok());
    }

    #[test]
    fn test_evolve_rejects_small_or_single_objective_setups() {
        let mut search = MemeticSearch::new(1, 2, 42).unwrap();
        let pop = Population::random(linear_problem(), 1, 3).unwrap();
        assert!(search.evolve(pop).is_err());

        let cfg = SymbolicRegressionConfig {
            rows: 1,
            cols: 3,
            levels_back: 4,
            arity: Arity::Uniform(2),
            n_eph: 0,
            multi_objective: false,
            parallel: false,
            ..Default::default()
        };
        let single = SymbolicRegression::new(
            vec![vec![1.0]],
            vec![vec![2.0]],
            cfg,
            KernelSet::basic(),
            0,
        )
        .unwrap();
        let pop = Population::random(single, 4, 3).unwrap();
        assert!(search.evolve(pop).is_err());
    }

    #[test]
    fn test_newton_step_solves_the_linear_model_exactly() {
        // The loss is quadratic in (c1, c2), so one Newton step lands on the
        // optimum y = 2x + 1 from c = (1, 1).
        let problem = linear_problem();
        let pairs = problem.hessians_sparsity()[0].clone();
        let mut x = linear_x();
        newton_step(&problem, &pairs, 2, &mut x).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert!((x[1] - 1.0).abs() < 1e-9);
        let f = problem.fitness(&x).unwrap();
        assert!(f[0].abs() < 1e-18);
    }

    #[test]
    fn test_newton_step_skips_singular_hessians() {
        // A single sample makes the reduced Hessian rank deficient; the
        // constants must be left untouched.
        let cfg = SymbolicRegressionConfig {
            rows: 1,
            cols: 3,
            levels_back: 4,
            arity: Arity::Uniform(2),
            n_eph: 2,
            parallel: false,
            ..Default::default()
        };
        let problem = SymbolicRegression::new(
            vec![vec![2.0]],
            vec![vec![5.0]],
            cfg,
            KernelSet::basic(),
            0,
        )
        .unwrap();
        let pairs = problem.hessians_sparsity()[0].clone();
        let mut x = linear_x();
        let before = x.clone();
        newton_step(&problem, &pairs, 2, &mut x).unwrap();
        assert_eq!(x, before);
    }

    #[test]
    fn test_one_generation_improves_the_linear_fit() {
        // max_mut = 1 makes every mutation strength zero, so the generation
        // is a pure Newton pass over the population.
        let problem = linear_problem();
        let mut pop = Population::random(problem, 2, 9).unwrap();
        sanitize(&mut pop);
        let x = linear_x();
        let f = pop.problem().fitness(&x).unwrap();
        pop.set_xf(0, x, f).unwrap();
        let mut search = MemeticSearch::new(1, 1, 42).unwrap();
        let pop = search.evolve(pop).unwrap();
        let best = pop
            .get_f()
            .iter()
            .map(|f| f[0])
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-12, "best loss after one generation: {best}");
    }

    #[test]
    fn test_selection_returns_a_non_dominated_subset() {
        let problem = linear_problem();
        let mut pop = Population::random(problem, 6, 11).unwrap();
        sanitize(&mut pop);
        let mut search = MemeticSearch::new(3, 2, 42).unwrap();
        let pop = search.evolve(pop).unwrap();
        assert_eq!(pop.len(), 6);
        for f in pop.get_f() {
            assert!(f[0].is_finite());
        }
        let fronts = pareto::fast_non_dominated_sorting(pop.get_f());
        assert!(!fronts.is_empty());
    }

    #[test]
    fn test_log_and_verbosity() {
        let problem = linear_problem();
        let mut pop = Population::random(problem, 4, 5).unwrap();
        sanitize(&mut pop);
        let mut search = MemeticSearch::new(6, 2, 42).unwrap();
        search.set_verbosity(2);
        let _pop = search.evolve(pop).unwrap();
        // Generations 0, 2, 4 plus the final line.
        assert_eq!(search.log().len(), 4);
        assert_eq!(search.log()[0].gen, 0);
        assert_eq!(search.log().last().unwrap().gen, 6);
        for pair in search.log().windows(2) {
            assert!(pair[1].best_loss <= pair[0].best_loss + 1e-12);
        }
    }

    #[test]
    fn test_cooperative_cancellation_stops_early() {
        let problem = linear_problem();
        let pop = Population::random(problem, 4, 5).unwrap();
        let mut search = MemeticSearch::new(100, 2, 42).unwrap();
        let mut remaining = 3;
        let pop = search
            .evolve_while(pop, || {
                if remaining == 0 {
                    return false;
                }
                remaining -= 1;
                true
            })
            .unwrap();
        assert_eq!(pop.len(), 4);
    }

    #[test]
    fn test_zero_generations_is_a_no_op() {
        let problem = linear_problem();
        let pop = Population::random(problem, 3, 5).unwrap();
        let before: Vec<Vec<f64>> = pop.get_x().to_vec();
        let mut search = MemeticSearch::new(0, 2, 42).unwrap();
        let pop = search.evolve(pop).unwrap();
        assert_eq!(pop.get_x(), before.as_slice());
    }
}
