use serde::{Deserialize, Serialize};

use crate::detector::{DetectorConfig, DEFAULT_CONTAMINATION, DEFAULT_RANDOM_STATE};
use crate::error::{Error, Result};
use crate::forest::{DEFAULT_ESTIMATORS, DEFAULT_MAX_SAMPLES};
use crate::window::{WindowAggregator, DEFAULT_WINDOW_SECS};

pub const DEFAULT_TOP_N: usize = 10;

/// Knobs for one end-to-end analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub window_size: f64,
    pub contamination: f64,
    pub random_state: u64,
    pub n_estimators: usize,
    pub max_samples: usize,
    /// How many of the highest-scoring windows the report lists.
    pub top_n: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SECS,
            contamination: DEFAULT_CONTAMINATION,
            random_state: DEFAULT_RANDOM_STATE,
            n_estimators: DEFAULT_ESTIMATORS,
            max_samples: DEFAULT_MAX_SAMPLES,
            top_n: DEFAULT_TOP_N,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        self.aggregator()?;
        self.detector().validate()
    }

    pub fn aggregator(&self) -> Result<WindowAggregator> {
        WindowAggregator::new(self.window_size)
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            contamination: self.contamination,
            random_state: self.random_state,
            n_estimators: self.n_estimators,
            max_samples: self.max_samples,
        }
    }

    /// Parse a JSON config; absent keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
