use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{FeatureVector, FEATURE_COUNT};

/// Per-column standardization frozen at fit time.
///
/// Uses the population standard deviation. A column that is constant in the
/// fit set has no meaningful scale; every value in it standardizes to 0, both
/// for the fit rows and for anything scored later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: FeatureVector,
    std_dev: FeatureVector,
}

impl StandardScaler {
    pub fn fit(matrix: &[FeatureVector]) -> Result<Self> {
        if matrix.is_empty() {
            return Err(Error::EmptyTable);
        }

        let n = matrix.len() as f64;
        let mut mean = [0.0; FEATURE_COUNT];
        for row in matrix {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut std_dev = [0.0; FEATURE_COUNT];
        for row in matrix {
            for ((s, x), m) in std_dev.iter_mut().zip(row).zip(&mean) {
                let d = x - m;
                *s += d * d;
            }
        }
        for (s, m) in std_dev.iter_mut().zip(&mean) {
            let var = *s / n;
            // rounding in the mean leaves a constant column with a tiny variance
            let bound = n * f64::EPSILON * var + (n * m * f64::EPSILON).powi(2);
            *s = if var <= bound { 0.0 } else { var.sqrt() };
        }

        let degenerate = std_dev.iter().filter(|s| !is_informative(**s)).count();
        if degenerate > 0 {
            tracing::debug!(columns = degenerate, "zero-variance feature columns");
        }

        Ok(Self { mean, std_dev })
    }

    pub fn mean(&self) -> &FeatureVector {
        &self.mean
    }

    pub fn std_dev(&self) -> &FeatureVector {
        &self.std_dev
    }

    pub fn transform_row(&self, row: &FeatureVector) -> FeatureVector {
        let mut out = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            out[i] = if is_informative(self.std_dev[i]) {
                (row[i] - self.mean[i]) / self.std_dev[i]
            } else {
                0.0
            };
        }
        out
    }

    pub fn transform(&self, matrix: &[FeatureVector]) -> Vec<FeatureVector> {
        matrix.iter().map(|r| self.transform_row(r)).collect()
    }
}

fn is_informative(std_dev: f64) -> bool {
    std_dev.is_finite() && std_dev > 0.0
}
