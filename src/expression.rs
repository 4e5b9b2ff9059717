//! The grid-encoded dCGP expression.
//!
//! An [`Expression`] is a fixed grid of `rows x cols` internal nodes fed by
//! `inputs` input nodes, with `outputs` virtual selectors picking the output
//! values. The whole topology is a flat integer chromosome: per internal node
//! one function gene (an index into the [`KernelSet`]) followed by one
//! connection gene per incoming edge, then one gene per output selector.
//!
//! Gene bounds encode the levels-back constraint, which forbids forward
//! references and makes every valid chromosome acyclic by construction, so
//! evaluation is a single sweep over the active nodes in ascending id order.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DcgpError, Result};
use crate::kernel::{KernelSet, KernelValue};

/// Arity specification for the internal nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arity {
    /// Every column uses the same arity.
    Uniform(usize),
    /// One arity per column; the vector length must equal the column count.
    PerColumn(Vec<usize>),
}

/// Shape of the expression grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of input nodes.
    pub inputs: usize,
    /// Number of output selectors.
    pub outputs: usize,
    /// Number of rows of internal nodes.
    pub rows: usize,
    /// Number of columns of internal nodes.
    pub cols: usize,
    /// Maximum column distance an edge may span.
    pub levels_back: usize,
    /// Incoming edges per internal node.
    pub arity: Arity,
}

impl GridConfig {
    /// A grid with uniform arity.
    #[must_use]
    pub fn new(
        inputs: usize,
        outputs: usize,
        rows: usize,
        cols: usize,
        levels_back: usize,
        arity: usize,
    ) -> Self {
        Self {
            inputs,
            outputs,
            rows,
            cols,
            levels_back,
            arity: Arity::Uniform(arity),
        }
    }

    /// A grid with one arity per column.
    #[must_use]
    pub fn with_arities(
        inputs: usize,
        outputs: usize,
        rows: usize,
        cols: usize,
        levels_back: usize,
        arities: Vec<usize>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            rows,
            cols,
            levels_back,
            arity: Arity::PerColumn(arities),
        }
    }

    /// The per-column arity vector; the uniform case expands to one entry per
    /// column.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] when any arity is below 1 or a
    /// per-column vector does not match the column count.
    pub fn column_arities(&self) -> Result<Vec<usize>> {
        let arities = match &self.arity {
            Arity::Uniform(a) => vec![*a; self.cols],
            Arity::PerColumn(v) => v.clone(),
        };
        if arities.len() != self.cols {
            return Err(DcgpError::invalid(format!(
                "the arity vector has {} entries, one per column ({}) is required",
                arities.len(),
                self.cols
            )));
        }
        if arities.iter().any(|&a| a < 1) {
            return Err(DcgpError::invalid(
                "kernel arity must be at least 1 in every column",
            ));
        }
        Ok(arities)
    }

    /// Check the grid shape.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] naming the zero dimension.
    pub fn validate(&self) -> Result<()> {
        if self.inputs == 0 {
            return Err(DcgpError::invalid("number of inputs is 0, it must be at least 1"));
        }
        if self.outputs == 0 {
            return Err(DcgpError::invalid("number of outputs is 0, it must be at least 1"));
        }
        if self.rows == 0 {
            return Err(DcgpError::invalid("number of rows is 0, it must be at least 1"));
        }
        if self.cols == 0 {
            return Err(DcgpError::invalid("number of columns is 0, it must be at least 1"));
        }
        if self.levels_back == 0 {
            return Err(DcgpError::invalid(
                "number of levels-back is 0, it must be at least 1",
            ));
        }
        self.column_arities()?;
        Ok(())
    }
}

fn seeded_rng() -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(0)
}

/// A dCGP expression: chromosome, gene bounds and the structures derived from
/// them.
///
/// Node ids are global: inputs `0..n`, internal nodes column-major
/// `n..n + rows * cols`, then virtual output selectors. The RNG is owned by
/// the expression so construction and mutation are reproducible from the
/// seed; it is skipped on serialization and reset on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    n: usize,
    m: usize,
    r: usize,
    c: usize,
    levels_back: usize,
    /// Arity per column.
    arity: Vec<usize>,
    kernels: KernelSet,
    chromosome: Vec<usize>,
    lb: Vec<usize>,
    ub: Vec<usize>,
    /// Start of each internal node's gene block; inputs hold 0.
    gene_idx: Vec<usize>,
    /// Sorted, deduplicated ids of nodes influencing any output.
    active_nodes: Vec<usize>,
    /// Sorted chromosome positions influencing any output.
    active_genes: Vec<usize>,
    #[serde(skip, default = "seeded_rng")]
    rng: ChaCha8Rng,
}

impl Expression {
    /// Create an expression with random genes drawn uniformly within bounds.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] when the grid shape is invalid
    /// or the kernel set is empty.
    pub fn random(config: &GridConfig, kernels: KernelSet, seed: u64) -> Result<Self> {
        config.validate()?;
        if kernels.is_empty() {
            return Err(DcgpError::invalid(
                "the kernel set is empty, at least one kernel is required",
            ));
        }
        let arity = config.column_arities()?;
        let (n, m, r, c) = (config.inputs, config.outputs, config.rows, config.cols);
        let size = arity.iter().map(|a| (a + 1) * r).sum::<usize>() + m;
        let mut expr = Self {
            n,
            m,
            r,
            c,
            levels_back: config.levels_back,
            arity,
            kernels,
            chromosome: vec![0; size],
            lb: vec![0; size],
            ub: vec![0; size],
            gene_idx: vec![0; n + r * c],
            active_nodes: Vec::new(),
            active_genes: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        expr.init_bounds();
        for i in 0..size {
            expr.chromosome[i] = expr.rng.random_range(expr.lb[i]..=expr.ub[i]);
        }
        expr.update_active();
        Ok(expr)
    }

    /// Fill gene bounds and the per-node gene index table.
    fn init_bounds(&mut self) {
        let mut k = 0;
        for col in 0..self.c {
            for row in 0..self.r {
                let node_id = self.n + col * self.r + row;
                self.gene_idx[node_id] = k;
                // Function gene.
                self.ub[k] = self.kernels.len() - 1;
                k += 1;
                // Connection genes: any node up to the previous column,
                // at most levels_back columns away.
                for _ in 0..self.arity[col] {
                    self.ub[k] = self.n + col * self.r - 1;
                    if col >= self.levels_back {
                        self.lb[k] = self.n + self.r * (col - self.levels_back);
                    }
                    k += 1;
                }
            }
        }
        for _ in 0..self.m {
            self.ub[k] = self.n + self.r * self.c - 1;
            if self.levels_back <= self.c {
                self.lb[k] = self.n + self.r * (self.c - self.levels_back);
            }
            k += 1;
        }
    }

    /// Recompute active nodes and genes from the chromosome.
    ///
    /// Backward breadth-first expansion from the output selectors; connection
    /// genes always point at strictly smaller ids, so the frontier shrinks
    /// monotonically and the sweep terminates.
    fn update_active(&mut self) {
        let out_start = self.chromosome.len() - self.m;
        let mut active: Vec<usize> = Vec::new();
        let mut current: Vec<usize> = self.chromosome[out_start..].to_vec();
        let mut next: Vec<usize> = Vec::new();
        while !current.is_empty() {
            for &node_id in &current {
                active.push(node_id);
                if node_id >= self.n {
                    let idx = self.gene_idx[node_id];
                    for j in 0..self.node_arity(node_id) {
                        next.push(self.chromosome[idx + 1 + j]);
                    }
                }
            }
            next.sort_unstable();
            next.dedup();
            std::mem::swap(&mut current, &mut next);
            next.clear();
        }
        active.sort_unstable();
        active.dedup();
        self.active_nodes = active;

        self.active_genes.clear();
        for &node_id in &self.active_nodes {
            if node_id >= self.n {
                let idx = self.gene_idx[node_id];
                for j in 0..=self.node_arity(node_id) {
                    self.active_genes.push(idx + j);
                }
            }
        }
        for i in 0..self.m {
            self.active_genes.push(out_start + i);
        }
    }

    /// Check a chromosome against the expression's length and gene bounds.
    #[must_use]
    pub fn is_valid(&self, x: &[usize]) -> bool {
        x.len() == self.chromosome.len()
            && x.iter()
                .zip(self.lb.iter().zip(&self.ub))
                .all(|(&g, (&lo, &hi))| g >= lo && g <= hi)
    }

    /// Replace the chromosome and refresh the derived structures.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the chromosome has the wrong
    /// length or any gene is outside its bounds.
    pub fn set(&mut self, x: &[usize]) -> Result<()> {
        if !self.is_valid(x) {
            return Err(DcgpError::invalid(format!(
                "chromosome is incompatible with the expression, {} genes within bounds expected",
                self.chromosome.len()
            )));
        }
        self.chromosome.copy_from_slice(x);
        self.update_active();
        Ok(())
    }

    /// Rewrite the function gene of an internal node.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `node_id` is not an internal
    /// node or `kernel_id` is not in the kernel set.
    pub fn set_f_gene(&mut self, node_id: usize, kernel_id: usize) -> Result<()> {
        if kernel_id >= self.kernels.len() {
            return Err(DcgpError::invalid(format!(
                "kernel id is {kernel_id}, allowed values are [0, {}]",
                self.kernels.len() - 1
            )));
        }
        if node_id < self.n || node_id >= self.n + self.r * self.c {
            return Err(DcgpError::invalid(format!(
                "node id is {node_id}, internal nodes are [{}, {}]",
                self.n,
                self.n + self.r * self.c - 1
            )));
        }
        self.chromosome[self.gene_idx[node_id]] = kernel_id;
        Ok(())
    }

    /// Redraw gene `idx` uniformly within its bounds, excluding the current
    /// value. A gene whose bounds admit a single value is left alone.
    /// Returns whether the chromosome changed.
    fn redraw(&mut self, idx: usize) -> bool {
        if self.lb[idx] >= self.ub[idx] {
            return false;
        }
        loop {
            let value = self.rng.random_range(self.lb[idx]..=self.ub[idx]);
            if value != self.chromosome[idx] {
                self.chromosome[idx] = value;
                return true;
            }
        }
    }

    /// Mutate one gene.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range; the
    /// chromosome is untouched in that case.
    pub fn mutate_gene(&mut self, idx: usize) -> Result<()> {
        if idx >= self.chromosome.len() {
            return Err(DcgpError::invalid(format!(
                "gene index is {idx}, the chromosome has {} genes",
                self.chromosome.len()
            )));
        }
        if self.redraw(idx) {
            self.update_active();
        }
        Ok(())
    }

    /// Mutate several genes at once.
    ///
    /// All indices are validated before any gene is touched, so a failure
    /// commits no partial mutation.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if any index is out of range.
    pub fn mutate_genes(&mut self, idxs: &[usize]) -> Result<()> {
        if let Some(&bad) = idxs.iter().find(|&&i| i >= self.chromosome.len()) {
            return Err(DcgpError::invalid(format!(
                "gene index is {bad}, the chromosome has {} genes",
                self.chromosome.len()
            )));
        }
        let mut changed = false;
        for &idx in idxs {
            changed |= self.redraw(idx);
        }
        if changed {
            self.update_active();
        }
        Ok(())
    }

    /// Mutate `k` distinct random genes (clamped to the chromosome length).
    pub fn mutate_random(&mut self, k: usize) {
        let len = self.chromosome.len();
        let picks = rand::seq::index::sample(&mut self.rng, len, k.min(len));
        let mut changed = false;
        for idx in picks {
            changed |= self.redraw(idx);
        }
        if changed {
            self.update_active();
        }
    }

    /// Mutate `k` genes drawn from the current active set.
    ///
    /// The active set is refreshed after every change, so later draws see the
    /// topology produced by earlier ones.
    pub fn mutate_active(&mut self, k: usize) {
        for _ in 0..k {
            let pick = self.rng.random_range(0..self.active_genes.len());
            let idx = self.active_genes[pick];
            if self.redraw(idx) {
                self.update_active();
            }
        }
    }

    /// Mutate `k` function genes of active internal nodes. A no-op when no
    /// internal node is active.
    pub fn mutate_active_fgene(&mut self, k: usize) {
        for _ in 0..k {
            let Some(node_id) = self.pick_active_internal() else {
                return;
            };
            let idx = self.gene_idx[node_id];
            if self.redraw(idx) {
                self.update_active();
            }
        }
    }

    /// Mutate `k` connection genes of active internal nodes. A no-op when no
    /// internal node is active.
    pub fn mutate_active_cgene(&mut self, k: usize) {
        for _ in 0..k {
            let Some(node_id) = self.pick_active_internal() else {
                return;
            };
            let offset = self.rng.random_range(0..self.node_arity(node_id));
            let idx = self.gene_idx[node_id] + 1 + offset;
            if self.redraw(idx) {
                self.update_active();
            }
        }
    }

    /// Mutate `k` output genes.
    pub fn mutate_ogene(&mut self, k: usize) {
        let out_start = self.chromosome.len() - self.m;
        for _ in 0..k {
            let idx = out_start + self.rng.random_range(0..self.m);
            if self.redraw(idx) {
                self.update_active();
            }
        }
    }

    fn pick_active_internal(&mut self) -> Option<usize> {
        let internal: Vec<usize> = self
            .active_nodes
            .iter()
            .copied()
            .filter(|&id| id >= self.n)
            .collect();
        if internal.is_empty() {
            return None;
        }
        let pick = self.rng.random_range(0..internal.len());
        Some(internal[pick])
    }

    /// Evaluate the expression at a point.
    ///
    /// Only active nodes are visited, in ascending id order; node values live
    /// in a dense scratch buffer indexed by node id.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the point size differs from
    /// the number of inputs.
    pub fn call<T: KernelValue>(&self, point: &[T]) -> Result<Vec<T>> {
        if point.len() != self.n {
            return Err(DcgpError::invalid(format!(
                "input size is {}, this expression has {} inputs",
                point.len(),
                self.n
            )));
        }
        let mut node: Vec<T> = vec![T::from_f64(0.0); self.n + self.r * self.c];
        let mut args: Vec<T> = Vec::new();
        for &node_id in &self.active_nodes {
            if node_id < self.n {
                node[node_id] = point[node_id].clone();
            } else {
                let idx = self.gene_idx[node_id];
                args.clear();
                for j in 0..self.node_arity(node_id) {
                    args.push(node[self.chromosome[idx + 1 + j]].clone());
                }
                node[node_id] = self.kernels.kernel(self.chromosome[idx]).eval(&args);
            }
        }
        let out_start = self.chromosome.len() - self.m;
        Ok((0..self.m)
            .map(|i| node[self.chromosome[out_start + i]].clone())
            .collect())
    }

    /// Render the expression symbolically, one string per output.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the symbol count differs
    /// from the number of inputs.
    pub fn pretty(&self, symbols: &[String]) -> Result<Vec<String>> {
        if symbols.len() != self.n {
            return Err(DcgpError::invalid(format!(
                "symbol count is {}, this expression has {} inputs",
                symbols.len(),
                self.n
            )));
        }
        let mut node: Vec<String> = vec![String::new(); self.n + self.r * self.c];
        let mut args: Vec<String> = Vec::new();
        for &node_id in &self.active_nodes {
            if node_id < self.n {
                node[node_id] = symbols[node_id].clone();
            } else {
                let idx = self.gene_idx[node_id];
                args.clear();
                for j in 0..self.node_arity(node_id) {
                    args.push(node[self.chromosome[idx + 1 + j]].clone());
                }
                node[node_id] = self.kernels.kernel(self.chromosome[idx]).pretty(&args);
            }
        }
        let out_start = self.chromosome.len() - self.m;
        Ok((0..self.m)
            .map(|i| node[self.chromosome[out_start + i]].clone())
            .collect())
    }

    /// Whether a node influences any output under the current chromosome.
    #[must_use]
    pub fn is_active(&self, node_id: usize) -> bool {
        self.active_nodes.binary_search(&node_id).is_ok()
    }

    /// The chromosome.
    #[must_use]
    pub fn chromosome(&self) -> &[usize] {
        &self.chromosome
    }

    /// Per-gene lower bounds.
    #[must_use]
    pub fn lower_bounds(&self) -> &[usize] {
        &self.lb
    }

    /// Per-gene upper bounds.
    #[must_use]
    pub fn upper_bounds(&self) -> &[usize] {
        &self.ub
    }

    /// Sorted ids of the active nodes.
    #[must_use]
    pub fn active_nodes(&self) -> &[usize] {
        &self.active_nodes
    }

    /// Sorted positions of the active genes.
    #[must_use]
    pub fn active_genes(&self) -> &[usize] {
        &self.active_genes
    }

    /// Number of inputs.
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.n
    }

    /// Number of outputs.
    #[must_use]
    pub fn outputs(&self) -> usize {
        self.m
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.r
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.c
    }

    /// Levels-back parameter.
    #[must_use]
    pub fn levels_back(&self) -> usize {
        self.levels_back
    }

    /// Arity per column.
    #[must_use]
    pub fn arities(&self) -> &[usize] {
        &self.arity
    }

    /// Arity of an internal node.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is not an internal node.
    #[must_use]
    pub fn node_arity(&self, node_id: usize) -> usize {
        self.arity[(node_id - self.n) / self.r]
    }

    /// Position of an internal node's gene block in the chromosome.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is not an internal node.
    #[must_use]
    pub fn gene_idx(&self, node_id: usize) -> usize {
        assert!(node_id >= self.n, "input nodes have no genes");
        self.gene_idx[node_id]
    }

    /// The kernel set.
    #[must_use]
    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "d-CGP Expression:")?;
        writeln!(f, "\tNumber of inputs:\t\t{}", self.n)?;
        writeln!(f, "\tNumber of outputs:\t\t{}", self.m)?;
        writeln!(f, "\tNumber of rows:\t\t\t{}", self.r)?;
        writeln!(f, "\tNumber of columns:\t\t{}", self.c)?;
        writeln!(f, "\tNumber of levels-back allowed:\t{}", self.levels_back)?;
        writeln!(f, "\tBasis function arity:\t\t{:?}", self.arity)?;
        writeln!(f, "\tResulting lower bounds:\t{:?}", self.lb)?;
        writeln!(f, "\tResulting upper bounds:\t{:?}", self.ub)?;
        writeln!(f, "\tCurrent expression (encoded):\t{:?}", self.chromosome)?;
        writeln!(f, "\tActive nodes:\t\t\t{:?}", self.active_nodes)?;
        writeln!(f, "\tActive genes:\t\t\t{:?}", self.active_genes)?;
        let names: Vec<&str> = self.kernels.iter().map(|k| k.name()).collect();
        writeln!(f, "\tFunction set:\t\t\t{names:?}")
    }
}
