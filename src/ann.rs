//! The weighted dCGP expression: an artificial neural network over the grid.
//!
//! [`AnnExpression`] extends [`Expression`] with one weight per incoming edge
//! and one bias per internal node. Each node computes its activation on the
//! affine pre-combination `b + sum_j w_j * v_j` (the bias is folded into the
//! first input slot). Gradients with respect to every weight and bias come
//! from a reverse-mode sweep over the same active-node order the forward
//! pass uses, seeded at virtual output consumers.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{DcgpError, Result};
use crate::expression::{Expression, GridConfig};
use crate::kernel::{Kernel, KernelSet};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Loss kinds supported by the weighted expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    /// Mean squared error (regression).
    Mse,
    /// Cross entropy with a softmax output layer (classification).
    Ce,
}

impl Loss {
    /// Parse a loss kind from its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] for anything but `"MSE"` or
    /// `"CE"`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "MSE" => Ok(Self::Mse),
            "CE" => Ok(Self::Ce),
            other => Err(DcgpError::invalid(format!(
                "the requested loss was '{other}' while only MSE and CE are allowed"
            ))),
        }
    }

    /// Canonical name of the loss kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mse => "MSE",
            Self::Ce => "CE",
        }
    }
}

/// A dCGP expression with per-edge weights and per-node biases.
///
/// Only the differentiable activations `tanh, sig, ReLu, ELU, ISRU` are
/// accepted as kernels. Weights start at 1 and biases at 0, so a freshly
/// built network computes plain kernel compositions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnExpression {
    expr: Expression,
    weights: Vec<f64>,
    biases: Vec<f64>,
    weight_symbols: Vec<String>,
    bias_symbols: Vec<String>,
    /// For every node id, the active consumers depending on it as
    /// `(consumer id, weight index)`. Output selectors appear as virtual
    /// consumers with ids starting at `inputs + rows * cols`; their weight
    /// index is unused.
    consumers: Vec<Vec<(usize, usize)>>,
}

impl AnnExpression {
    /// Create a weighted expression with random genes.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if the grid shape is invalid or
    /// any kernel is not a differentiable activation.
    pub fn random(config: &GridConfig, kernels: KernelSet, seed: u64) -> Result<Self> {
        if let Some(bad) = kernels.iter().find(|k| !k.is_ann_activation()) {
            return Err(DcgpError::invalid(format!(
                "only tanh, sig, ReLu, ELU and ISRU kernels are valid for a weighted \
                 expression, found '{}'",
                bad.name()
            )));
        }
        let expr = Expression::random(config, kernels, seed)?;
        let n = expr.inputs();
        let n_nodes = expr.rows() * expr.cols();
        let n_connections: usize = expr.arities().iter().sum::<usize>() * expr.rows();

        let mut weight_symbols = Vec::with_capacity(n_connections);
        let mut bias_symbols = Vec::with_capacity(n_nodes);
        for node_id in n..n + n_nodes {
            for j in 0..expr.node_arity(node_id) {
                weight_symbols.push(format!("w{node_id}_{j}"));
            }
            bias_symbols.push(format!("b{node_id}"));
        }

        let mut ann = Self {
            expr,
            weights: vec![1.0; n_connections],
            biases: vec![0.0; n_nodes],
            weight_symbols,
            bias_symbols,
            consumers: Vec::new(),
        };
        ann.rebuild_consumers();
        Ok(ann)
    }

    /// Index of a node's first weight in the flat weight vector.
    ///
    /// Each preceding internal node contributes one function gene to the
    /// chromosome and none to the weight vector, hence the offset.
    #[inline]
    fn weight_idx(&self, node_id: usize) -> usize {
        self.expr.gene_idx(node_id) - (node_id - self.expr.inputs())
    }

    /// Rebuild the consumer lists from the current active topology.
    fn rebuild_consumers(&mut self) {
        let n = self.expr.inputs();
        let n_nodes = n + self.expr.rows() * self.expr.cols();
        self.consumers = vec![Vec::new(); n_nodes];
        for &node_id in self.expr.active_nodes() {
            if node_id < n {
                continue;
            }
            let idx = self.expr.gene_idx(node_id);
            let w_idx = self.weight_idx(node_id);
            for j in 0..self.expr.node_arity(node_id) {
                let src = self.expr.chromosome()[idx + 1 + j];
                if self.expr.is_active(src) {
                    self.consumers[src].push((node_id, w_idx + j));
                }
            }
        }
        let out_start = self.expr.chromosome().len() - self.expr.outputs();
        for i in 0..self.expr.outputs() {
            let src = self.expr.chromosome()[out_start + i];
            self.consumers[src].push((n_nodes + i, 0));
        }
    }

    /// Forward pass filling the dense node buffer.
    fn fill_nodes(&self, point: &[f64]) -> Result<Vec<f64>> {
        self.check_point(point)?;
        let n = self.expr.inputs();
        let mut node = vec![0.0; n + self.expr.rows() * self.expr.cols()];
        let mut args: Vec<f64> = Vec::new();
        for &node_id in self.expr.active_nodes() {
            if node_id < n {
                node[node_id] = point[node_id];
            } else {
                let (kernel, _) = self.gather_args(node_id, &node, &mut args);
                node[node_id] = kernel.eval(&args);
            }
        }
        Ok(node)
    }

    /// Forward pass that also records the activation derivative of every
    /// internal node, evaluated from the node value (and, for ISRU, the
    /// pre-activation sum).
    fn fill_nodes_with_derivative(&self, point: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        self.check_point(point)?;
        let n = self.expr.inputs();
        let n_nodes = n + self.expr.rows() * self.expr.cols();
        let mut node = vec![0.0; n_nodes];
        let mut d_node = vec![0.0; n_nodes];
        let mut args: Vec<f64> = Vec::new();
        for &node_id in self.expr.active_nodes() {
            if node_id < n {
                node[node_id] = point[node_id];
            } else {
                let (kernel, pre_sum) = self.gather_args(node_id, &node, &mut args);
                let value = kernel.eval(&args);
                node[node_id] = value;
                d_node[node_id] = activation_derivative(kernel, value, pre_sum);
            }
        }
        Ok((node, d_node))
    }

    /// Gather the weighted inputs of a node into `args`, folding the bias
    /// into the first slot. Returns the node's kernel and the pre-activation
    /// sum.
    fn gather_args(&self, node_id: usize, node: &[f64], args: &mut Vec<f64>) -> (Kernel, f64) {
        let idx = self.expr.gene_idx(node_id);
        let w_idx = self.weight_idx(node_id);
        let b_idx = node_id - self.expr.inputs();
        args.clear();
        for j in 0..self.expr.node_arity(node_id) {
            args.push(node[self.expr.chromosome()[idx + 1 + j]] * self.weights[w_idx + j]);
        }
        args[0] += self.biases[b_idx];
        let pre_sum = args.iter().sum();
        (self.expr.kernels().kernel(self.expr.chromosome()[idx]), pre_sum)
    }

    fn check_point(&self, point: &[f64]) -> Result<()> {
        if point.len() != self.expr.inputs() {
            return Err(DcgpError::invalid(format!(
                "the point dimension (input) is {}, expected {}",
                point.len(),
                self.expr.inputs()
            )));
        }
        Ok(())
    }

    fn check_label(&self, label: &[f64]) -> Result<()> {
        if label.len() != self.expr.outputs() {
            return Err(DcgpError::invalid(format!(
                "the label dimension (output) is {}, expected {}",
                label.len(),
                self.expr.outputs()
            )));
        }
        Ok(())
    }

    fn check_batch(points: &[Vec<f64>], labels: &[Vec<f64>]) -> Result<()> {
        if points.len() != labels.len() {
            return Err(DcgpError::invalid(format!(
                "data and label size mismatch, data size is {} while label size is {}",
                points.len(),
                labels.len()
            )));
        }
        if points.is_empty() {
            return Err(DcgpError::invalid("data size cannot be zero"));
        }
        Ok(())
    }

    /// Evaluate the network at a point.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a point size mismatch.
    pub fn call(&self, point: &[f64]) -> Result<Vec<f64>> {
        let node = self.fill_nodes(point)?;
        let out_start = self.expr.chromosome().len() - self.expr.outputs();
        Ok((0..self.expr.outputs())
            .map(|i| node[self.expr.chromosome()[out_start + i]])
            .collect())
    }

    /// Render the network symbolically with named weights and biases.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a symbol count mismatch.
    pub fn pretty(&self, symbols: &[String]) -> Result<Vec<String>> {
        if symbols.len() != self.expr.inputs() {
            return Err(DcgpError::invalid(format!(
                "symbol count is {}, this expression has {} inputs",
                symbols.len(),
                self.expr.inputs()
            )));
        }
        let n = self.expr.inputs();
        let mut node: Vec<String> = vec![String::new(); n + self.expr.rows() * self.expr.cols()];
        let mut args: Vec<String> = Vec::new();
        for &node_id in self.expr.active_nodes() {
            if node_id < n {
                node[node_id] = symbols[node_id].clone();
            } else {
                let idx = self.expr.gene_idx(node_id);
                let w_idx = self.weight_idx(node_id);
                let b_idx = node_id - n;
                args.clear();
                for j in 0..self.expr.node_arity(node_id) {
                    let src = &node[self.expr.chromosome()[idx + 1 + j]];
                    args.push(format!("{}*{}", self.weight_symbols[w_idx + j], src));
                }
                args[0] = format!("{}+{}", self.bias_symbols[b_idx], args[0]);
                node[node_id] = self
                    .expr
                    .kernels()
                    .kernel(self.expr.chromosome()[idx])
                    .pretty(&args);
            }
        }
        let out_start = self.expr.chromosome().len() - self.expr.outputs();
        Ok((0..self.expr.outputs())
            .map(|i| node[self.expr.chromosome()[out_start + i]].clone())
            .collect())
    }

    /// Per-sample loss.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on dimension mismatches.
    pub fn loss(&self, point: &[f64], label: &[f64], loss: Loss) -> Result<f64> {
        self.check_label(label)?;
        let outputs = self.call(point)?;
        Ok(match loss {
            Loss::Mse => outputs
                .iter()
                .zip(label)
                .map(|(o, y)| (o - y) * (o - y))
                .sum(),
            Loss::Ce => {
                let exps: Vec<f64> = outputs.iter().map(|o| o.exp()).collect();
                let cumsum: f64 = exps.iter().sum();
                -exps
                    .iter()
                    .zip(label)
                    .map(|(e, y)| (e / cumsum).ln() * y)
                    .sum::<f64>()
            }
        })
    }

    /// Batch loss, averaged over the samples.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on size mismatches or empty
    /// input.
    pub fn loss_batch(&self, points: &[Vec<f64>], labels: &[Vec<f64>], loss: Loss) -> Result<f64> {
        Self::check_batch(points, labels)?;
        let per_sample = self.map_samples(points, labels, |p, l| self.loss(p, l, loss))?;
        Ok(per_sample.iter().sum::<f64>() / points.len() as f64)
    }

    /// Per-sample loss and its gradient with respect to all weights and
    /// biases (inactive ones get a zero gradient).
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on dimension mismatches.
    pub fn d_loss(
        &self,
        point: &[f64],
        label: &[f64],
        loss: Loss,
    ) -> Result<(f64, Vec<f64>, Vec<f64>)> {
        self.check_label(label)?;
        let (node, mut d_node) = self.fill_nodes_with_derivative(point)?;
        let n = self.expr.inputs();
        let n_nodes = n + self.expr.rows() * self.expr.cols();
        let out_start = self.expr.chromosome().len() - self.expr.outputs();

        // Seed the virtual output consumers with the loss sensitivities.
        let mut value = 0.0;
        match loss {
            Loss::Mse => {
                for i in 0..self.expr.outputs() {
                    let node_idx = self.expr.chromosome()[out_start + i];
                    let err = node[node_idx] - label[i];
                    d_node.push(2.0 * err);
                    value += err * err;
                }
            }
            Loss::Ce => {
                let mut ps: Vec<f64> = (0..self.expr.outputs())
                    .map(|i| node[self.expr.chromosome()[out_start + i]].exp())
                    .collect();
                let cumsum: f64 = ps.iter().sum();
                for p in &mut ps {
                    *p /= cumsum;
                }
                for (p, y) in ps.iter().zip(label) {
                    d_node.push(p - y);
                    value -= p.ln() * y;
                }
            }
        }

        // Backward sweep in descending node order: accumulate the consumers'
        // sensitivities, then emit the per-edge and per-bias gradients.
        let mut gweights = vec![0.0; self.weights.len()];
        let mut gbiases = vec![0.0; self.biases.len()];
        for &node_id in self.expr.active_nodes().iter().rev() {
            if node_id < n {
                continue;
            }
            let b_idx = node_id - n;
            let idx = self.expr.gene_idx(node_id);
            let w_idx = self.weight_idx(node_id);
            let mut cum = 0.0;
            for &(consumer, weight) in &self.consumers[node_id] {
                if consumer < n_nodes {
                    cum += self.weights[weight] * d_node[consumer];
                } else {
                    cum += d_node[consumer];
                }
            }
            d_node[node_id] *= cum;
            for j in 0..self.expr.node_arity(node_id) {
                gweights[w_idx + j] =
                    d_node[node_id] * node[self.expr.chromosome()[idx + 1 + j]];
            }
            gbiases[b_idx] = d_node[node_id];
        }
        Ok((value, gweights, gbiases))
    }

    /// Batch loss and gradients, all averaged over the samples.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on size mismatches or empty
    /// input.
    pub fn d_loss_batch(
        &self,
        points: &[Vec<f64>],
        labels: &[Vec<f64>],
        loss: Loss,
    ) -> Result<(f64, Vec<f64>, Vec<f64>)> {
        Self::check_batch(points, labels)?;
        let per_sample = self.map_samples(points, labels, |p, l| self.d_loss(p, l, loss))?;
        let dim = points.len() as f64;
        let mut value = 0.0;
        let mut gweights = vec![0.0; self.weights.len()];
        let mut gbiases = vec![0.0; self.biases.len()];
        for (v, gw, gb) in per_sample {
            value += v / dim;
            for (acc, g) in gweights.iter_mut().zip(&gw) {
                *acc += g / dim;
            }
            for (acc, g) in gbiases.iter_mut().zip(&gb) {
                *acc += g / dim;
            }
        }
        Ok((value, gweights, gbiases))
    }

    /// One epoch of mini-batch gradient descent.
    ///
    /// The data is split into contiguous batches (a trailing short batch is
    /// allowed); each batch computes its averaged gradient and updates every
    /// weight and bias once. Returns the mean of the batch losses, a proxy
    /// for the epoch loss.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on size mismatches, empty
    /// input, a non-positive learning rate or a zero batch size.
    pub fn sgd(
        &mut self,
        points: &[Vec<f64>],
        labels: &[Vec<f64>],
        lr: f64,
        batch_size: usize,
        loss: Loss,
    ) -> Result<f64> {
        Self::check_batch(points, labels)?;
        if lr <= 0.0 {
            return Err(DcgpError::invalid(format!(
                "the learning rate must be a positive number, {lr} was detected"
            )));
        }
        if batch_size == 0 {
            return Err(DcgpError::invalid("the batch size must be at least 1"));
        }
        let mut total = 0.0;
        let mut n_batches = 0usize;
        for (p_chunk, l_chunk) in points.chunks(batch_size).zip(labels.chunks(batch_size)) {
            let (value, gweights, gbiases) = self.d_loss_batch(p_chunk, l_chunk, loss)?;
            for (w, g) in self.weights.iter_mut().zip(&gweights) {
                *w -= lr * g;
            }
            for (b, g) in self.biases.iter_mut().zip(&gbiases) {
                *b -= lr * g;
            }
            total += value;
            n_batches += 1;
        }
        Ok(total / n_batches as f64)
    }

    /// Rewrite the function gene of every node selected by an output, e.g.
    /// to pin a regression or classification head.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `kernel_id` is out of range
    /// or an output selects an input node.
    pub fn set_output_f(&mut self, kernel_id: usize) -> Result<()> {
        let out_start = self.expr.chromosome().len() - self.expr.outputs();
        for i in 0..self.expr.outputs() {
            let node_id = self.expr.chromosome()[out_start + i];
            self.expr.set_f_gene(node_id, kernel_id)?;
        }
        Ok(())
    }

    /// Number of weights influencing the output. With `unique`, weights
    /// connecting the same pair of nodes are counted once.
    #[must_use]
    pub fn n_active_weights(&self, unique: bool) -> usize {
        let n = self.expr.inputs();
        let mut edges: Vec<(usize, usize)> = Vec::new();
        let mut count = 0;
        for &node_id in self.expr.active_nodes() {
            if node_id < n {
                continue;
            }
            let idx = self.expr.gene_idx(node_id);
            for j in 0..self.expr.node_arity(node_id) {
                if unique {
                    edges.push((node_id, self.expr.chromosome()[idx + 1 + j]));
                } else {
                    count += 1;
                }
            }
        }
        if unique {
            edges.sort_unstable();
            edges.dedup();
            edges.len()
        } else {
            count
        }
    }

    /// Set one weight by its flat index.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range.
    pub fn set_weight(&mut self, idx: usize, w: f64) -> Result<()> {
        if idx >= self.weights.len() {
            return Err(DcgpError::invalid(format!(
                "weight index is {idx}, there are {} weights",
                self.weights.len()
            )));
        }
        self.weights[idx] = w;
        Ok(())
    }

    /// Set the weight of a node's `input_id`-th incoming edge.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `node_id` is not internal or
    /// `input_id` exceeds the node arity.
    pub fn set_node_weight(&mut self, node_id: usize, input_id: usize, w: f64) -> Result<()> {
        let idx = self.node_weight_idx(node_id, input_id)?;
        self.weights[idx] = w;
        Ok(())
    }

    /// Replace all weights.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a length mismatch.
    pub fn set_weights(&mut self, ws: &[f64]) -> Result<()> {
        if ws.len() != self.weights.len() {
            return Err(DcgpError::invalid(format!(
                "the vector of weights has {} entries, {} expected",
                ws.len(),
                self.weights.len()
            )));
        }
        self.weights.copy_from_slice(ws);
        Ok(())
    }

    /// One weight by its flat index.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range.
    pub fn get_weight(&self, idx: usize) -> Result<f64> {
        self.weights.get(idx).copied().ok_or_else(|| {
            DcgpError::invalid(format!(
                "weight index is {idx}, there are {} weights",
                self.weights.len()
            ))
        })
    }

    /// The weight of a node's `input_id`-th incoming edge.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `node_id` is not internal or
    /// `input_id` exceeds the node arity.
    pub fn get_node_weight(&self, node_id: usize, input_id: usize) -> Result<f64> {
        let idx = self.node_weight_idx(node_id, input_id)?;
        Ok(self.weights[idx])
    }

    fn node_weight_idx(&self, node_id: usize, input_id: usize) -> Result<usize> {
        let n = self.expr.inputs();
        if node_id < n || node_id >= n + self.expr.rows() * self.expr.cols() {
            return Err(DcgpError::invalid(format!(
                "node id is {node_id}, internal nodes are [{}, {}]",
                n,
                n + self.expr.rows() * self.expr.cols() - 1
            )));
        }
        if input_id >= self.expr.node_arity(node_id) {
            return Err(DcgpError::invalid(format!(
                "input id is {input_id}, the node arity is {}",
                self.expr.node_arity(node_id)
            )));
        }
        Ok(self.weight_idx(node_id) + input_id)
    }

    /// All weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Set one bias.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range.
    pub fn set_bias(&mut self, idx: usize, b: f64) -> Result<()> {
        if idx >= self.biases.len() {
            return Err(DcgpError::invalid(format!(
                "bias index is {idx}, there are {} biases",
                self.biases.len()
            )));
        }
        self.biases[idx] = b;
        Ok(())
    }

    /// Replace all biases.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on a length mismatch.
    pub fn set_biases(&mut self, bs: &[f64]) -> Result<()> {
        if bs.len() != self.biases.len() {
            return Err(DcgpError::invalid(format!(
                "the vector of biases has {} entries, {} expected",
                bs.len(),
                self.biases.len()
            )));
        }
        self.biases.copy_from_slice(bs);
        Ok(())
    }

    /// One bias.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range.
    pub fn get_bias(&self, idx: usize) -> Result<f64> {
        self.biases.get(idx).copied().ok_or_else(|| {
            DcgpError::invalid(format!(
                "bias index is {idx}, there are {} biases",
                self.biases.len()
            ))
        })
    }

    /// All biases.
    #[must_use]
    pub fn biases(&self) -> &[f64] {
        &self.biases
    }

    /// Redraw all weights from a normal distribution.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `std` is negative or
    /// non-finite.
    pub fn randomise_weights(&mut self, mean: f64, std: f64, seed: u64) -> Result<()> {
        let normal = Normal::new(mean, std).map_err(|_| {
            DcgpError::invalid("the standard deviation must be finite and non-negative")
        })?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for w in &mut self.weights {
            *w = normal.sample(&mut rng);
        }
        Ok(())
    }

    /// Redraw all biases from a normal distribution.
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `std` is negative or
    /// non-finite.
    pub fn randomise_biases(&mut self, mean: f64, std: f64, seed: u64) -> Result<()> {
        let normal = Normal::new(mean, std).map_err(|_| {
            DcgpError::invalid("the standard deviation must be finite and non-negative")
        })?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for b in &mut self.biases {
            *b = normal.sample(&mut rng);
        }
        Ok(())
    }

    /// The underlying grid expression.
    #[must_use]
    pub fn expression(&self) -> &Expression {
        &self.expr
    }

    /// Replace the chromosome; see [`Expression::set`].
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] on an invalid chromosome.
    pub fn set(&mut self, x: &[usize]) -> Result<()> {
        self.expr.set(x)?;
        self.rebuild_consumers();
        Ok(())
    }

    /// See [`Expression::mutate_gene`].
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if `idx` is out of range.
    pub fn mutate_gene(&mut self, idx: usize) -> Result<()> {
        self.expr.mutate_gene(idx)?;
        self.rebuild_consumers();
        Ok(())
    }

    /// See [`Expression::mutate_genes`].
    ///
    /// # Errors
    ///
    /// Returns [`DcgpError::InvalidArgument`] if any index is out of range.
    pub fn mutate_genes(&mut self, idxs: &[usize]) -> Result<()> {
        self.expr.mutate_genes(idxs)?;
        self.rebuild_consumers();
        Ok(())
    }

    /// See [`Expression::mutate_random`].
    pub fn mutate_random(&mut self, k: usize) {
        self.expr.mutate_random(k);
        self.rebuild_consumers();
    }

    /// See [`Expression::mutate_active`].
    pub fn mutate_active(&mut self, k: usize) {
        self.expr.mutate_active(k);
        self.rebuild_consumers();
    }

    /// See [`Expression::mutate_active_fgene`].
    pub fn mutate_active_fgene(&mut self, k: usize) {
        self.expr.mutate_active_fgene(k);
        self.rebuild_consumers();
    }

    /// See [`Expression::mutate_active_cgene`].
    pub fn mutate_active_cgene(&mut self, k: usize) {
        self.expr.mutate_active_cgene(k);
        self.rebuild_consumers();
    }

    /// See [`Expression::mutate_ogene`].
    pub fn mutate_ogene(&mut self, k: usize) {
        self.expr.mutate_ogene(k);
        self.rebuild_consumers();
    }

    /// Map a closure over sample pairs, in parallel when the feature is on.
    /// Results come back in sample order and are reduced sequentially by the
    /// callers, so parallel and serial runs are bit-identical.
    #[cfg(feature = "parallel")]
    fn map_samples<T: Send>(
        &self,
        points: &[Vec<f64>],
        labels: &[Vec<f64>],
        f: impl Fn(&[f64], &[f64]) -> Result<T> + Send + Sync,
    ) -> Result<Vec<T>> {
        points
            .par_iter()
            .zip(labels.par_iter())
            .map(|(p, l)| f(p, l))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn map_samples<T: Send>(
        &self,
        points: &[Vec<f64>],
        labels: &[Vec<f64>],
        f: impl Fn(&[f64], &[f64]) -> Result<T> + Send + Sync,
    ) -> Result<Vec<T>> {
        points.iter().zip(labels.iter()).map(|(p, l)| f(p, l)).collect()
    }
}

/// Derivative of an activation at a node, computed from the node value and,
/// for ISRU, the pre-activation sum. The constructor restricts kernels to
/// activations, so other kernels cannot reach this.
fn activation_derivative(kernel: Kernel, value: f64, pre_sum: f64) -> f64 {
    match kernel {
        Kernel::Sig => value * (1.0 - value),
        Kernel::Tanh => 1.0 - value * value,
        Kernel::ReLu => {
            if value > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Kernel::Elu => {
            if value > 0.0 {
                1.0
            } else {
                value + 1.0
            }
        }
        Kernel::Isru => {
            if pre_sum == 0.0 {
                1.0
            } else {
                value * value * value / (pre_sum * pre_sum * pre_sum)
            }
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelSet;

    fn tanh_chain() -> AnnExpression {
        // One row, two columns, arity 1: a two-neuron tanh chain whose
        // bounds force the only possible wiring input -> n1 -> n2 -> output.
        let config = GridConfig::new(1, 1, 1, 2, 1, 1);
        AnnExpression::random(&config, KernelSet::from_names(&["tanh"]).unwrap(), 0).unwrap()
    }

    #[test]
    fn test_rejects_non_activation_kernels() {
        let config = GridConfig::new(1, 1, 1, 2, 1, 1);
        let kernels = KernelSet::from_names(&["sum", "tanh"]).unwrap();
        assert!(AnnExpression::random(&config, kernels, 0).is_err());
    }

    #[test]
    fn test_default_weights_and_biases() {
        let ann = tanh_chain();
        assert!(ann.weights().iter().all(|&w| w == 1.0));
        assert!(ann.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_forward_matches_closed_form() {
        let mut ann = tanh_chain();
        ann.set_weights(&[0.1, 0.2]).unwrap();
        ann.set_biases(&[0.3, 0.4]).unwrap();
        let res = ann.call(&[0.23]).unwrap()[0];
        let truth = (0.4 + 0.2 * (0.23f64 * 0.1 + 0.3).tanh()).tanh();
        assert!((res - truth).abs() < 1e-13);
    }

    #[test]
    fn test_forward_arity_two() {
        // Arity 2 feeds the single input twice into each neuron.
        let config = GridConfig::new(1, 1, 1, 2, 1, 2);
        let mut ann =
            AnnExpression::random(&config, KernelSet::from_names(&["tanh"]).unwrap(), 0).unwrap();
        ann.set_weights(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        ann.set_biases(&[0.5, 0.6]).unwrap();
        let res = ann.call(&[0.23]).unwrap()[0];
        let n1 = (0.23f64 * 0.1 + 0.23 * 0.2 + 0.5).tanh();
        let truth = (0.3 * n1 + 0.4 * n1 + 0.6).tanh();
        assert!((res - truth).abs() < 1e-13);
    }

    #[test]
    fn test_forward_two_rows() {
        let config = GridConfig::new(1, 1, 2, 2, 1, 2);
        let mut ann =
            AnnExpression::random(&config, KernelSet::from_names(&["tanh"]).unwrap(), 0).unwrap();
        ann.set_weights(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8])
            .unwrap();
        ann.set_biases(&[0.9, 1.1, 1.2, 1.3]).unwrap();
        ann.set(&[0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 1, 2, 3]).unwrap();
        let res = ann.call(&[0.23]).unwrap()[0];
        let n0 = 0.23f64;
        let n1 = (0.1 * n0 + 0.2 * n0 + 0.9).tanh();
        let n2 = (0.3 * n0 + 0.4 * n0 + 1.1).tanh();
        let truth = (0.5 * n1 + 0.6 * n2 + 1.2).tanh();
        assert!((res - truth).abs() < 1e-13);
    }

    #[test]
    fn test_pretty_names_weights_and_biases() {
        let ann = tanh_chain();
        let out = ann.pretty(&["x0".to_string()]).unwrap();
        assert_eq!(out[0], "tanh(b2+w2_0*tanh(b1+w1_0*x0))");
    }

    #[test]
    fn test_gradient_matches_central_differences() {
        let config = GridConfig::new(1, 1, 4, 3, 2, 2);
        let mut ann =
            AnnExpression::random(&config, KernelSet::from_names(&["tanh", "sig"]).unwrap(), 17)
                .unwrap();
        ann.randomise_weights(0.0, 0.3, 5).unwrap();
        ann.randomise_biases(0.0, 0.3, 6).unwrap();
        let point = vec![0.22];
        let label = vec![0.23];
        let (_, gw, gb) = ann.d_loss(&point, &label, Loss::Mse).unwrap();
        let h = 1e-7;
        let mse = |ann: &AnnExpression| {
            let o = ann.call(&point).unwrap()[0];
            (o - label[0]) * (o - label[0])
        };
        for i in 0..ann.weights().len() {
            let w0 = ann.get_weight(i).unwrap();
            ann.set_weight(i, w0 + h).unwrap();
            let hi = mse(&ann);
            ann.set_weight(i, w0 - h).unwrap();
            let lo = mse(&ann);
            ann.set_weight(i, w0).unwrap();
            let numeric = (hi - lo) / (2.0 * h);
            assert!(
                (numeric - gw[i]).abs() <= 0.05 * gw[i].abs().max(1e-6),
                "weight {i}: numeric {numeric} vs analytic {}",
                gw[i]
            );
        }
        for i in 0..ann.biases().len() {
            let b0 = ann.get_bias(i).unwrap();
            ann.set_bias(i, b0 + h).unwrap();
            let hi = mse(&ann);
            ann.set_bias(i, b0 - h).unwrap();
            let lo = mse(&ann);
            ann.set_bias(i, b0).unwrap();
            let numeric = (hi - lo) / (2.0 * h);
            assert!(
                (numeric - gb[i]).abs() <= 0.05 * gb[i].abs().max(1e-6),
                "bias {i}: numeric {numeric} vs analytic {}",
                gb[i]
            );
        }
    }

    #[test]
    fn test_inactive_weights_have_zero_gradient() {
        let config = GridConfig::new(1, 1, 3, 3, 1, 2);
        let mut ann =
            AnnExpression::random(&config, KernelSet::from_names(&["tanh"]).unwrap(), 3).unwrap();
        ann.randomise_weights(0.0, 0.2, 9).unwrap();
        let (_, gw, _) = ann.d_loss(&[0.5], &[0.1], Loss::Mse).unwrap();
        let n = ann.expression().inputs();
        for (i, g) in gw.iter().enumerate() {
            // Recover the owning node of weight i by scanning the grid.
            let mut owner = None;
            for node_id in n..n + 9 {
                let start = ann.weight_idx(node_id);
                if (start..start + ann.expression().node_arity(node_id)).contains(&i) {
                    owner = Some(node_id);
                }
            }
            if !ann.expression().is_active(owner.unwrap()) {
                assert_eq!(*g, 0.0, "inactive weight {i} has non-zero gradient");
            }
        }
    }

    #[test]
    fn test_cross_entropy_matches_direct_formula() {
        let config = GridConfig::new(2, 2, 2, 2, 2, 2);
        let mut ann =
            AnnExpression::random(&config, KernelSet::from_names(&["sig"]).unwrap(), 8).unwrap();
        ann.randomise_weights(0.0, 0.5, 1).unwrap();
        let point = vec![0.4, -0.2];
        let label = vec![1.0, 0.0];
        let outputs = ann.call(&point).unwrap();
        let exps: Vec<f64> = outputs.iter().map(|o| o.exp()).collect();
        let z: f64 = exps.iter().sum();
        let expected = -(exps[0] / z).ln();
        let got = ann.loss(&point, &label, Loss::Ce).unwrap();
        assert!((got - expected).abs() < 1e-12);
        let (value, _, _) = ann.d_loss(&point, &label, Loss::Ce).unwrap();
        assert!((value - expected).abs() < 1e-12);
    }

    #[test]
    fn test_tiny_gradient_step_does_not_increase_loss() {
        let mut ann = tanh_chain();
        ann.set_weights(&[0.7, -0.3]).unwrap();
        ann.set_biases(&[0.1, 0.2]).unwrap();
        let points = vec![vec![0.1], vec![0.4], vec![-0.3]];
        let labels = vec![vec![0.2], vec![0.5], vec![-0.1]];
        let before = ann.loss_batch(&points, &labels, Loss::Mse).unwrap();
        let (_, gw, gb) = ann.d_loss_batch(&points, &labels, Loss::Mse).unwrap();
        let step = 1e-6;
        let ws: Vec<f64> = ann.weights().iter().zip(&gw).map(|(w, g)| w - step * g).collect();
        let bs: Vec<f64> = ann.biases().iter().zip(&gb).map(|(b, g)| b - step * g).collect();
        ann.set_weights(&ws).unwrap();
        ann.set_biases(&bs).unwrap();
        let after = ann.loss_batch(&points, &labels, Loss::Mse).unwrap();
        assert!(after <= before + 1e-12);
    }

    #[test]
    fn test_sgd_validates_arguments() {
        let mut ann = tanh_chain();
        let points = vec![vec![0.1]];
        let labels = vec![vec![0.2]];
        assert!(ann.sgd(&points, &[], 0.1, 1, Loss::Mse).is_err());
        assert!(ann.sgd(&[], &[], 0.1, 1, Loss::Mse).is_err());
        assert!(ann.sgd(&points, &labels, 0.0, 1, Loss::Mse).is_err());
        assert!(ann.sgd(&points, &labels, -1.0, 1, Loss::Mse).is_err());
        assert!(ann.sgd(&points, &labels, 0.1, 0, Loss::Mse).is_err());
        assert!(Loss::from_name("huber").is_err());
    }

    #[test]
    fn test_sgd_learns_a_constant_target() {
        let mut ann = tanh_chain();
        let points: Vec<Vec<f64>> = (0..16).map(|i| vec![i as f64 / 16.0]).collect();
        let labels: Vec<Vec<f64>> = points.iter().map(|_| vec![0.4]).collect();
        let before = ann.loss_batch(&points, &labels, Loss::Mse).unwrap();
        let mut last = before;
        for _ in 0..50 {
            last = ann.sgd(&points, &labels, 0.1, 4, Loss::Mse).unwrap();
        }
        let after = ann.loss_batch(&points, &labels, Loss::Mse).unwrap();
        assert!(after < before, "sgd did not reduce the loss: {before} -> {after}");
        assert!(last.is_finite());
    }

    #[test]
    fn test_set_output_f_rewrites_heads() {
        let config = GridConfig::new(1, 1, 1, 2, 1, 1);
        let kernels = KernelSet::from_names(&["tanh", "sig"]).unwrap();
        let mut ann = AnnExpression::random(&config, kernels, 4).unwrap();
        ann.set_output_f(1).unwrap();
        // The output selects node 2 (forced by the bounds); its function
        // gene sits at chromosome position 2.
        assert_eq!(ann.expression().chromosome()[2], 1);
        assert!(ann.set_output_f(7).is_err());
    }

    #[test]
    fn test_n_active_weights() {
        let mut ann = tanh_chain();
        assert_eq!(ann.n_active_weights(false), 2);
        assert_eq!(ann.n_active_weights(true), 2);
        // Arity 2 from a single source: unique collapses the pair.
        let config = GridConfig::new(1, 1, 1, 1, 1, 2);
        ann = AnnExpression::random(&config, KernelSet::from_names(&["tanh"]).unwrap(), 0).unwrap();
        assert_eq!(ann.n_active_weights(false), 2);
        assert_eq!(ann.n_active_weights(true), 1);
    }
}
