//! Isolation forest over standardized window features.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{Error, Result};
use crate::models::{FeatureVector, FEATURE_COUNT};

pub const DEFAULT_ESTIMATORS: usize = 100;
pub const DEFAULT_MAX_SAMPLES: usize = 256;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// Upper bound on rows drawn per tree; each tree uses `min(max_samples, n)`.
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: DEFAULT_ESTIMATORS,
            max_samples: DEFAULT_MAX_SAMPLES,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(data: &[FeatureVector], rows: &mut [usize], max_depth: usize, rng: &mut ChaCha8Rng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(data, rows, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[FeatureVector],
        rows: &mut [usize],
        depth: usize,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> usize {
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });

        if rows.len() <= 1 || depth >= max_depth {
            return slot;
        }

        // only features that still vary inside this node can split it
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(FEATURE_COUNT);
        for feature in 0..FEATURE_COUNT {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                (lo.min(data[r][feature]), hi.max(data[r][feature]))
            });
            if hi > lo {
                candidates.push((feature, lo, hi));
            }
        }
        if candidates.is_empty() {
            return slot;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let mut threshold = lo + rng.gen::<f64>() * (hi - lo);
        if threshold >= hi {
            threshold = lo;
        }

        // lo <= threshold < hi, so both sides are non-empty
        let mut split = 0;
        for i in 0..rows.len() {
            if data[rows[i]][feature] <= threshold {
                rows.swap(i, split);
                split += 1;
            }
        }

        let (left_rows, right_rows) = rows.split_at_mut(split);
        let left = self.grow(data, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    /// Depth at which `x` lands in a leaf, plus the expected remaining depth
    /// of the unbuilt subtree below it.
    fn path_length(&self, x: &FeatureVector) -> f64 {
        let mut idx = 0;
        let mut depth = 0usize;
        loop {
            match self.nodes[idx] {
                Node::Leaf { size } => return depth as f64 + average_path_length(size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[feature] <= threshold { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(data: &[FeatureVector], params: ForestParams) -> Result<Self> {
        if params.n_estimators == 0 || params.max_samples == 0 {
            return Err(Error::InvalidEstimators);
        }
        if data.is_empty() {
            return Err(Error::EmptyTable);
        }

        let sample_size = params.max_samples.min(data.len());
        if sample_size < 2 {
            return Err(Error::InsufficientRows {
                required: 2,
                got: sample_size,
            });
        }
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let trees = (0..params.n_estimators)
            .map(|_| {
                let mut rows = index::sample(&mut rng, data.len(), sample_size).into_vec();
                IsolationTree::build(data, &mut rows, max_depth, &mut rng)
            })
            .collect();

        Ok(Self { trees, sample_size })
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Mean isolation depth across all trees.
    pub fn mean_path_length(&self, x: &FeatureVector) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        total / self.trees.len() as f64
    }

    /// `2^(-E[h(x)] / c(psi))`, in (0, 1]. Shallow isolation pushes it towards 1.
    pub fn anomaly_score(&self, x: &FeatureVector) -> f64 {
        let norm = average_path_length(self.sample_size);
        2f64.powf(-self.mean_path_length(x) / norm)
    }
}

/// Expected path length of an unsuccessful BST search over `n` keys.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
