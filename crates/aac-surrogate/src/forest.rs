//! Random forest regression on censored observations.
//!
//! Each tree is a CART regression tree grown on a bootstrap sample with a
//! random feature subset per split. Censored observations (runs that only
//! give a lower bound on the true cost) are handled by iterative imputation:
//! after an initial fit, every censored target is replaced by the mean of the
//! forest's predictive normal truncated at the observed bound, and the forest
//! is regrown.

use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gaussian::truncated_mean_above;
use crate::{SurrogateError, SurrogateResult};

/// Forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// Nodes with fewer samples become leaves.
    pub min_split: usize,
    /// Share of features considered at each split.
    pub feature_ratio: f64,
    pub max_depth: Option<usize>,
    /// Imputation rounds for censored targets.
    pub imputation_iterations: usize,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 10,
            min_split: 10,
            feature_ratio: 5.0 / 6.0,
            max_depth: None,
            imputation_iterations: 2,
            seed: 0,
        }
    }
}

impl ForestConfig {
    pub fn with_n_trees(mut self, n: usize) -> Self {
        self.n_trees = n.max(1);
        self
    }

    pub fn with_min_split(mut self, n: usize) -> Self {
        self.min_split = n.max(2);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// One training row.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub features: Vec<f64>,
    pub y: f64,
    /// `y` is only a lower bound.
    pub censored: bool,
}

/// Predictive mean and variance across trees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub mean: f64,
    pub variance: f64,
}

impl Prediction {
    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    fn from_samples(samples: &[f64]) -> Self {
        let n = samples.len().max(1) as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self { mean, variance }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn fit(rows: &[&[f64]], y: &[f64], config: &ForestConfig, rng: &mut ChaCha8Rng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let n = rows.len();
        let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        tree.grow(rows, y, bootstrap, 0, config, rng);
        tree
    }

    fn grow(
        &mut self,
        rows: &[&[f64]],
        y: &[f64],
        idx: Vec<usize>,
        depth: usize,
        config: &ForestConfig,
        rng: &mut ChaCha8Rng,
    ) -> usize {
        let mean = idx.iter().map(|&i| y[i]).sum::<f64>() / idx.len().max(1) as f64;
        let node = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean });

        let depth_reached = config.max_depth.is_some_and(|d| depth >= d);
        if idx.len() < config.min_split || depth_reached {
            return node;
        }
        let Some((feature, threshold)) = best_split(rows, y, &idx, config, rng) else {
            return node;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) =
            idx.into_iter().partition(|&i| rows[i][feature] <= threshold);
        let left = self.grow(rows, y, left_idx, depth + 1, config, rng);
        let right = self.grow(rows, y, right_idx, depth + 1, config, rng);
        self.nodes[node] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        node
    }

    fn predict(&self, row: &[f64]) -> f64 {
        let mut current = 0;
        loop {
            match &self.nodes[current] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    current = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// Split minimizing the summed squared error of both children, over a random
/// subset of features.
fn best_split(
    rows: &[&[f64]],
    y: &[f64],
    idx: &[usize],
    config: &ForestConfig,
    rng: &mut ChaCha8Rng,
) -> Option<(usize, f64)> {
    let dims = rows[idx[0]].len();
    if dims == 0 {
        return None;
    }
    let tried = ((dims as f64 * config.feature_ratio).ceil() as usize).clamp(1, dims);

    let total: f64 = idx.iter().map(|&i| y[i]).sum();
    let total_sq: f64 = idx.iter().map(|&i| y[i] * y[i]).sum();
    let n = idx.len() as f64;
    let parent_sse = total_sq - total * total / n;

    let mut best: Option<(f64, usize, f64)> = None;
    for feature in sample(rng, dims, tried).into_iter() {
        let mut pairs: Vec<(f64, f64)> = idx.iter().map(|&i| (rows[i][feature], y[i])).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (mut left_sum, mut left_sq) = (0.0, 0.0);
        for p in 1..pairs.len() {
            let (x_prev, y_prev) = pairs[p - 1];
            left_sum += y_prev;
            left_sq += y_prev * y_prev;
            if pairs[p].0 <= x_prev {
                continue;
            }
            let nl = p as f64;
            let nr = n - nl;
            let right_sum = total - left_sum;
            let right_sq = total_sq - left_sq;
            let sse = (left_sq - left_sum * left_sum / nl) + (right_sq - right_sum * right_sum / nr);
            if best.map_or(true, |(b, _, _)| sse < b) {
                best = Some((sse, feature, (x_prev + pairs[p].0) / 2.0));
            }
        }
    }

    best.filter(|(sse, _, _)| *sse < parent_sse - 1e-12)
        .map(|(_, feature, threshold)| (feature, threshold))
}

/// Random forest surrogate supporting censored targets.
#[derive(Debug, Clone)]
pub struct CensoredRandomForest {
    config: ForestConfig,
    trees: Vec<RegressionTree>,
    n_features: Option<usize>,
}

impl CensoredRandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            trees: Vec::new(),
            n_features: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Fit on `data`. Imputed values for censored rows never exceed `cap`.
    /// Runs on the current rayon pool.
    pub fn fit(&mut self, data: &[Observation], cap: f64) -> SurrogateResult<()> {
        let first = data.first().ok_or(SurrogateError::EmptyTrainingSet)?;
        let dims = first.features.len();
        if let Some(bad) = data.iter().find(|o| o.features.len() != dims) {
            return Err(SurrogateError::DimensionMismatch {
                expected: dims,
                actual: bad.features.len(),
            });
        }
        self.n_features = Some(dims);

        let rows: Vec<&[f64]> = data.iter().map(|o| o.features.as_slice()).collect();
        let mut y: Vec<f64> = data.iter().map(|o| o.y).collect();
        self.trees = self.grow_all(&rows, &y, 0);

        let censored: Vec<usize> = (0..data.len()).filter(|&i| data[i].censored).collect();
        if censored.is_empty() {
            return Ok(());
        }
        for round in 1..=self.config.imputation_iterations {
            for &i in &censored {
                let bound = data[i].y;
                let prediction = self.predict_with(&rows[i]);
                let imputed = truncated_mean_above(prediction.mean, prediction.std_dev(), bound);
                y[i] = imputed.min(cap).max(bound);
            }
            self.trees = self.grow_all(&rows, &y, round as u64);
        }
        debug!(
            rows = data.len(),
            censored = censored.len(),
            trees = self.trees.len(),
            "Fitted censored random forest"
        );
        Ok(())
    }

    fn grow_all(&self, rows: &[&[f64]], y: &[f64], round: u64) -> Vec<RegressionTree> {
        let config = &self.config;
        (0..config.n_trees)
            .into_par_iter()
            .map(|t| {
                let seed = config
                    .seed
                    .wrapping_mul(31)
                    .wrapping_add(round * 10_007 + t as u64);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                RegressionTree::fit(rows, y, config, &mut rng)
            })
            .collect()
    }

    fn predict_with(&self, row: &[f64]) -> Prediction {
        let samples: Vec<f64> = self.trees.iter().map(|t| t.predict(row)).collect();
        Prediction::from_samples(&samples)
    }

    fn check_dims(&self, len: usize) -> SurrogateResult<()> {
        match self.n_features {
            None => Err(SurrogateError::NotFitted),
            Some(expected) if expected != len => Err(SurrogateError::DimensionMismatch {
                expected,
                actual: len,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Prediction for a single full feature row.
    pub fn predict(&self, row: &[f64]) -> SurrogateResult<Prediction> {
        self.check_dims(row.len())?;
        Ok(self.predict_with(row))
    }

    /// Prediction for a configuration averaged over instances: each tree's
    /// output is the mean over `theta ++ instance` rows, and mean and variance
    /// are then taken across trees.
    pub fn predict_marginal(
        &self,
        theta: &[f64],
        instances: &[Vec<f64>],
    ) -> SurrogateResult<Prediction> {
        let inst_dims = instances.first().map(|i| i.len()).unwrap_or(0);
        self.check_dims(theta.len() + inst_dims)?;
        if instances.is_empty() {
            return Ok(self.predict_with(theta));
        }

        let mut row = Vec::with_capacity(theta.len() + inst_dims);
        let mut per_tree = vec![0.0; self.trees.len()];
        for instance in instances {
            row.clear();
            row.extend_from_slice(theta);
            row.extend_from_slice(instance);
            for (acc, tree) in per_tree.iter_mut().zip(&self.trees) {
                *acc += tree.predict(&row);
            }
        }
        let n = instances.len() as f64;
        per_tree.iter_mut().for_each(|v| *v /= n);
        Ok(Prediction::from_samples(&per_tree))
    }

    /// [`Self::predict_marginal`] for many configurations, in parallel on the
    /// current rayon pool.
    pub fn predict_marginal_batch(
        &self,
        thetas: &[Vec<f64>],
        instances: &[Vec<f64>],
    ) -> SurrogateResult<Vec<Prediction>> {
        thetas
            .par_iter()
            .map(|theta| self.predict_marginal(theta, instances))
            .collect()
    }
}
