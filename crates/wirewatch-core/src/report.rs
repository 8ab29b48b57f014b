use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::detector::MIN_FIT_ROWS;
use crate::error::Result;
use crate::ingest::CaptureInfo;
use crate::models::{PacketRecord, ScoredWindow};
use crate::table::FeatureTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub wirewatch_version: String,
    pub generated_at: DateTime<Utc>,
    pub capture: CaptureInfo,
    pub config: AnalysisConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_windows: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub anomalous_windows: u64,
    pub score_threshold: Option<f64>,
    pub analysis_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub metadata: ReportMetadata,
    pub summary: AnalysisSummary,
    pub windows: Vec<ScoredWindow>,
    /// Window indices, highest score first.
    pub top_windows: Vec<usize>,
    /// Why the windows carry no scores, when the scorer was not run.
    pub skipped_reason: Option<String>,
}

impl AnalysisReport {
    pub fn top(&self) -> impl Iterator<Item = &ScoredWindow> {
        self.top_windows.iter().filter_map(|&i| self.windows.get(i))
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<usize> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(json.len())
    }
}

/// Window, fit and score one capture against itself.
///
/// An empty capture, or one too short to fit a detector on, still yields a
/// report; its windows are left unscored and `skipped_reason` says why.
pub fn analyze(packets: &[PacketRecord], capture: CaptureInfo, config: &AnalysisConfig) -> Result<AnalysisReport> {
    let started = Instant::now();
    config.validate()?;

    let table = config.aggregator()?.aggregate(packets);

    let mut summary = AnalysisSummary {
        total_windows: table.len() as u64,
        total_packets: table.total_packets(),
        total_bytes: table.total_bytes(),
        ..AnalysisSummary::default()
    };

    let (windows, top_windows, skipped_reason) = if table.is_empty() {
        (Vec::new(), Vec::new(), Some("capture contains no packets".to_string()))
    } else if table.len() < MIN_FIT_ROWS {
        let reason = format!(
            "{} window(s) is too few to fit a detector (need {})",
            table.len(),
            MIN_FIT_ROWS
        );
        (unscored(table), Vec::new(), Some(reason))
    } else {
        let fitted = config.detector().fit(&table)?;
        let scores = fitted.score(&table);
        summary.score_threshold = Some(fitted.threshold());

        let top = rank_top(&scores, config.top_n);
        let windows: Vec<ScoredWindow> = table
            .into_rows()
            .into_iter()
            .zip(scores)
            .map(|(features, score)| ScoredWindow {
                features,
                anomaly_score: Some(score),
                is_anomaly: fitted.is_anomalous(score),
            })
            .collect();
        (windows, top, None)
    };

    summary.anomalous_windows = windows.iter().filter(|w| w.is_anomaly).count() as u64;
    summary.analysis_duration_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        windows = summary.total_windows,
        anomalous = summary.anomalous_windows,
        "analysis complete"
    );

    Ok(AnalysisReport {
        metadata: ReportMetadata {
            wirewatch_version: crate::VERSION.to_string(),
            generated_at: Utc::now(),
            capture,
            config: *config,
        },
        summary,
        windows,
        top_windows,
        skipped_reason,
    })
}

fn unscored(table: FeatureTable) -> Vec<ScoredWindow> {
    table
        .into_rows()
        .into_iter()
        .map(|features| ScoredWindow {
            features,
            anomaly_score: None,
            is_anomaly: false,
        })
        .collect()
}

/// Indices of the `n` highest scores, descending; ties keep window order.
pub fn rank_top(scores: &[f64], n: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    idx.truncate(n);
    idx
}
