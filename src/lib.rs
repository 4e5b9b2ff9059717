//! # Symbios dCGP
//!
//! A differentiable Cartesian Genetic Programming (dCGP) engine: compact
//! grid-encoded expression graphs, their derivatives, and a multi-objective
//! memetic search over graph topology and embedded constants.
//!
//! ## Features
//!
//! - **Grid-Encoded Graphs**: expressions are flat integer chromosomes over
//!   a rows-by-columns grid; gene bounds encode the levels-back constraint
//!   and make every valid chromosome acyclic by construction
//! - **Generic Kernel Evaluation**: the same kernels evaluate over plain
//!   `f64`, truncated [`Taylor`] elements (exact gradients and Hessians for
//!   free) and a symbolic pretty-printer
//! - **Neural Variant**: [`AnnExpression`] adds per-edge weights and
//!   per-node biases, reverse-mode gradients and mini-batch SGD
//! - **Memetic Multi-Objective Search**: [`MemeticSearch`] mutates graph
//!   topology and refines constants with guarded Newton steps, selecting
//!   survivors by non-dominated sorting over loss and complexity
//! - **Deterministic Execution**: every component owns a seeded `ChaCha8Rng`
//!   and parallel sample loops reduce in a fixed order, so runs reproduce
//!   bit for bit
//!
//! ## Quick Start
//!
//! ```rust
//! use symbios_dcgp::{Expression, GridConfig, KernelSet};
//!
//! // A one-output expression over two inputs on a 1x10 grid.
//! let kernels = KernelSet::from_names(&["sum", "diff", "mul", "div"]).unwrap();
//! let config = GridConfig::new(2, 1, 1, 10, 11, 2);
//! let expr = Expression::random(&config, kernels, 32).unwrap();
//!
//! let value = expr.call(&[1.0_f64, 0.5]).unwrap();
//! let symbolic = expr.pretty(&["x".to_string(), "y".to_string()]).unwrap();
//! println!("f(1, 0.5) = {}, f = {}", value[0], symbolic[0]);
//! ```
//!
//! ## Symbolic Regression
//!
//! ```rust
//! use symbios_dcgp::{
//!     gym, KernelSet, MemeticSearch, Population, SymbolicRegression,
//!     SymbolicRegressionConfig,
//! };
//!
//! let (points, labels) = gym::koza_quintic();
//! let config = SymbolicRegressionConfig {
//!     n_eph: 1,
//!     ..Default::default()
//! };
//! let problem =
//!     SymbolicRegression::new(points, labels, config, KernelSet::basic(), 42).unwrap();
//! let population = Population::random(problem, 4, 42).unwrap();
//!
//! let mut search = MemeticSearch::new(5, 2, 42).unwrap();
//! let population = search.evolve(population).unwrap();
//! assert_eq!(population.len(), 4);
//! ```
//!
//! ## Architecture
//!
//! The chromosome *is* the topology: node values during evaluation live in a
//! dense buffer indexed by node id, visited in ascending order over the
//! active nodes only. Derivatives come from two independent mechanisms that
//! are never mixed in one call path: evaluating an [`Expression`] over
//! [`Taylor`] elements (used by [`SymbolicRegression`] for the embedded
//! constants) and reverse-mode backpropagation through an
//! [`AnnExpression`] (for weights and biases).

pub mod ann;
pub mod error;
pub mod expression;
pub mod gym;
pub mod kernel;
pub mod momes;
pub mod pareto;
pub mod population;
pub mod problem;
mod simplify;
pub mod taylor;

// Re-exports for convenience
pub use ann::{AnnExpression, Loss};
pub use error::{DcgpError, Result};
pub use expression::{Arity, Expression, GridConfig};
pub use kernel::{Kernel, KernelSet, KernelValue};
pub use momes::{LogLine, MemeticSearch};
pub use population::Population;
pub use problem::{SymbolicRegression, SymbolicRegressionConfig};
pub use taylor::Taylor;
