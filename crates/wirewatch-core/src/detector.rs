use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::forest::{ForestParams, IsolationForest, DEFAULT_ESTIMATORS, DEFAULT_MAX_SAMPLES};
use crate::scaler::StandardScaler;
use crate::table::FeatureTable;

/// Fewest windows a detector will fit on. Below this the forest has nothing
/// to partition and every score would be the same constant.
pub const MIN_FIT_ROWS: usize = 2;

pub const DEFAULT_CONTAMINATION: f64 = 0.1;
pub const DEFAULT_RANDOM_STATE: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Expected share of anomalous windows. Only sets the binary decision
    /// threshold; continuous scores are unaffected.
    pub contamination: f64,
    pub random_state: u64,
    pub n_estimators: usize,
    pub max_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            contamination: DEFAULT_CONTAMINATION,
            random_state: DEFAULT_RANDOM_STATE,
            n_estimators: DEFAULT_ESTIMATORS,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl DetectorConfig {
    pub fn new(contamination: f64, random_state: u64) -> Result<Self> {
        let config = Self {
            contamination,
            random_state,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(Error::InvalidContamination(self.contamination));
        }
        if self.n_estimators == 0 || self.max_samples == 0 {
            return Err(Error::InvalidEstimators);
        }
        Ok(())
    }

    /// Fit scaler and forest on `table`, yielding a detector that can score.
    pub fn fit(&self, table: &FeatureTable) -> Result<FittedDetector> {
        self.validate()?;
        if table.is_empty() {
            return Err(Error::EmptyTable);
        }
        if table.len() < MIN_FIT_ROWS {
            return Err(Error::InsufficientRows {
                required: MIN_FIT_ROWS,
                got: table.len(),
            });
        }

        let matrix = table.matrix();
        let scaler = StandardScaler::fit(&matrix)?;
        let scaled = scaler.transform(&matrix);
        let forest = IsolationForest::fit(
            &scaled,
            ForestParams {
                n_estimators: self.n_estimators,
                max_samples: self.max_samples,
                seed: self.random_state,
            },
        )?;

        let fit_scores: Vec<f64> = scaled.iter().map(|x| forest.anomaly_score(x)).collect();
        let threshold = quantile(&fit_scores, 1.0 - self.contamination);

        tracing::info!(
            rows = table.len(),
            trees = forest.n_estimators(),
            sample_size = forest.sample_size(),
            threshold,
            "detector fit"
        );

        Ok(FittedDetector {
            config: *self,
            scaler,
            forest,
            threshold,
        })
    }
}

/// Scaler statistics and forest frozen at fit time.
#[derive(Debug, Clone)]
pub struct FittedDetector {
    config: DetectorConfig,
    scaler: StandardScaler,
    forest: IsolationForest,
    threshold: f64,
}

impl FittedDetector {
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    /// Scores above this are flagged by [`FittedDetector::predict`].
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// One score per row in input order; higher is more anomalous. Scores are
    /// a ranking within this detector, not probabilities.
    pub fn score(&self, table: &FeatureTable) -> Vec<f64> {
        table
            .matrix()
            .iter()
            .map(|row| self.forest.anomaly_score(&self.scaler.transform_row(row)))
            .collect()
    }

    pub fn is_anomalous(&self, score: f64) -> bool {
        score > self.threshold
    }

    pub fn predict(&self, table: &FeatureTable) -> Vec<bool> {
        self.score(table)
            .into_iter()
            .map(|s| self.is_anomalous(s))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum DetectorState {
    Unfit,
    Fit(FittedDetector),
}

/// Detector that moves from `Unfit` to `Fit` on the first successful
/// [`AnomalyDetector::fit`].
///
/// Fitting needs `&mut self`, so a detector cannot be refit while something
/// else holds it for scoring.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: DetectorConfig,
    state: DetectorState,
}

impl AnomalyDetector {
    pub fn new(contamination: f64, random_state: u64) -> Result<Self> {
        Self::with_config(DetectorConfig::new(contamination, random_state)?)
    }

    pub fn with_config(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: DetectorState::Unfit,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, DetectorState::Fit(_))
    }

    pub fn fitted(&self) -> Option<&FittedDetector> {
        match &self.state {
            DetectorState::Fit(fitted) => Some(fitted),
            DetectorState::Unfit => None,
        }
    }

    /// A failed fit leaves the previous state untouched.
    pub fn fit(&mut self, table: &FeatureTable) -> Result<()> {
        let fitted = self.config.fit(table)?;
        self.state = DetectorState::Fit(fitted);
        Ok(())
    }

    pub fn score(&self, table: &FeatureTable) -> Result<Vec<f64>> {
        self.fitted().map(|f| f.score(table)).ok_or(Error::NotFitted)
    }

    pub fn predict(&self, table: &FeatureTable) -> Result<Vec<bool>> {
        self.fitted().map(|f| f.predict(table)).ok_or(Error::NotFitted)
    }

    pub fn into_fitted(self) -> Result<FittedDetector> {
        match self.state {
            DetectorState::Fit(fitted) => Ok(fitted),
            DetectorState::Unfit => Err(Error::NotFitted),
        }
    }
}

/// Linearly interpolated quantile, `q` in [0, 1].
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WindowFeatureRow;

    fn uniform_row(start: f64, packets: u64) -> WindowFeatureRow {
        WindowFeatureRow {
            window_start: start,
            total_packets: packets,
            total_bytes: packets * 100,
            unique_src_ips: 1,
            unique_dst_ips: 1,
            unique_src_ports: 1,
            unique_dst_ports: 1,
            tcp_count: packets,
            udp_count: 0,
            other_count: 0,
            avg_packet_size: 100.0,
        }
    }

    fn spike_table() -> FeatureTable {
        let mut rows: Vec<WindowFeatureRow> = (0..59).map(|i| uniform_row(i as f64 * 61.0, 60)).collect();
        rows.insert(37, uniform_row(37.0 * 61.0, 600));
        FeatureTable::new(rows)
    }

    fn varied_table() -> FeatureTable {
        let rows = (0..80)
            .map(|i| {
                let packets = 40 + (i * 13 % 29) as u64;
                let mut row = uniform_row(i as f64 * 61.0, packets);
                row.unique_src_ports = 1 + (i * 7 % 11) as u64;
                row.udp_count = (i % 4) as u64;
                row.tcp_count = packets - row.udp_count;
                row
            })
            .collect();
        FeatureTable::new(rows)
    }

    #[test]
    fn test_single_spike_scores_highest() -> Result<()> {
        let table = spike_table();
        let mut detector = AnomalyDetector::new(0.1, 42)?;
        detector.fit(&table)?;
        let scores = detector.score(&table)?;
        assert_eq!(scores.len(), 60);
        let spike = scores[37];
        for (i, s) in scores.iter().enumerate() {
            if i != 37 {
                assert!(*s < spike, "row {} scored {} >= spike {}", i, s, spike);
            }
        }
        Ok(())
    }

    #[test]
    fn test_spike_is_flagged_by_threshold() -> Result<()> {
        let table = spike_table();
        let fitted = DetectorConfig::new(0.05, 42)?.fit(&table)?;
        let flags = fitted.predict(&table);
        assert!(flags[37]);
        assert_eq!(flags.iter().filter(|f| **f).count(), 1);
        Ok(())
    }

    #[test]
    fn test_score_before_fit_fails() -> Result<()> {
        let detector = AnomalyDetector::new(0.1, 42)?;
        assert!(!detector.is_fitted());
        assert_eq!(detector.score(&spike_table()), Err(Error::NotFitted));
        assert_eq!(detector.predict(&spike_table()), Err(Error::NotFitted));
        assert!(matches!(detector.into_fitted(), Err(Error::NotFitted)));
        Ok(())
    }

    #[test]
    fn test_fit_on_empty_table_fails() -> Result<()> {
        let mut detector = AnomalyDetector::new(0.1, 42)?;
        assert_eq!(detector.fit(&FeatureTable::default()), Err(Error::EmptyTable));
        assert!(!detector.is_fitted());
        Ok(())
    }

    #[test]
    fn test_fit_on_single_row_fails() -> Result<()> {
        let mut detector = AnomalyDetector::new(0.1, 42)?;
        let table = FeatureTable::new(vec![uniform_row(0.0, 5)]);
        assert_eq!(
            detector.fit(&table),
            Err(Error::InsufficientRows { required: 2, got: 1 })
        );
        Ok(())
    }

    #[test]
    fn test_failed_refit_keeps_previous_model() -> Result<()> {
        let table = varied_table();
        let mut detector = AnomalyDetector::new(0.1, 42)?;
        detector.fit(&table)?;
        let before = detector.score(&table)?;
        assert!(detector.fit(&FeatureTable::default()).is_err());
        assert_eq!(detector.score(&table)?, before);
        Ok(())
    }

    #[test]
    fn test_identical_config_is_deterministic() -> Result<()> {
        let table = varied_table();
        let mut a = AnomalyDetector::new(0.2, 1234)?;
        let mut b = AnomalyDetector::new(0.2, 1234)?;
        a.fit(&table)?;
        b.fit(&table)?;
        let sa = a.score(&table)?;
        let sb = b.score(&table)?;
        assert_eq!(
            sa.iter().map(|s| s.to_bits()).collect::<Vec<_>>(),
            sb.iter().map(|s| s.to_bits()).collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_contamination_does_not_change_scores() -> Result<()> {
        let table = varied_table();
        let low = DetectorConfig::new(0.01, 9)?.fit(&table)?;
        let high = DetectorConfig::new(0.5, 9)?.fit(&table)?;
        assert_eq!(low.score(&table), high.score(&table));
        assert!(low.threshold() >= high.threshold());
        Ok(())
    }

    #[test]
    fn test_scoring_other_table_uses_fit_statistics() -> Result<()> {
        let fitted = DetectorConfig::default().fit(&varied_table())?;
        let probe = FeatureTable::new(vec![uniform_row(0.0, 50), uniform_row(61.0, 5_000)]);
        let scores = fitted.score(&probe);
        assert_eq!(scores.len(), 2);
        assert!(scores[1] > scores[0]);
        Ok(())
    }

    #[test]
    fn test_all_identical_rows_score_equally() -> Result<()> {
        let table = FeatureTable::new((0..10).map(|i| uniform_row(i as f64, 60)).collect());
        let fitted = DetectorConfig::default().fit(&table)?;
        let scores = fitted.score(&table);
        assert!(scores.iter().all(|s| s.is_finite()));
        assert!(scores.windows(2).all(|w| w[0] == w[1]));
        Ok(())
    }

    #[test]
    fn test_invalid_contamination_rejected() {
        for bad in [0.0, -0.1, 0.51, f64::NAN] {
            assert!(matches!(
                AnomalyDetector::new(bad, 42),
                Err(Error::InvalidContamination(_))
            ));
        }
        assert!(AnomalyDetector::new(0.5, 42).is_ok());
    }

    #[test]
    fn test_fitted_detector_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FittedDetector>();
    }

    #[test]
    fn test_quantile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert_eq!(quantile(&v, 0.5), 2.5);
    }
}
