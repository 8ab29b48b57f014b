use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use wirewatch_core::table::FeatureTable;

use super::TuningArgs;

#[derive(Args)]
pub struct ScoreArgs {
    /// Feature table JSON, as written by `wirewatch features`
    pub table: PathBuf,

    /// Output path for the scores (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Debug, Serialize)]
struct WindowScore {
    window_start: f64,
    anomaly_score: f64,
    is_anomaly: bool,
}

pub fn run(args: ScoreArgs) -> Result<()> {
    let config = args.tuning.resolve()?;

    let json = std::fs::read_to_string(&args.table)
        .with_context(|| format!("cannot read {}", args.table.display()))?;
    let table = FeatureTable::from_json_records(&json)
        .with_context(|| format!("invalid feature table {}", args.table.display()))?;

    let detector = config.detector().fit(&table).context("failed to fit detector")?;
    let scores = score_rows(&table, &detector);

    let out = serde_json::to_string_pretty(&scores).context("failed to serialize scores")?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &out)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "  {} {} windows, {} anomalous, threshold {:.4} -> {}",
                console::style("scored").green().bold(),
                console::style(scores.len()).cyan(),
                console::style(scores.iter().filter(|s| s.is_anomaly).count()).red().bold(),
                detector.threshold(),
                path.display(),
            );
        }
        None => println!("{out}"),
    }

    Ok(())
}

fn score_rows(
    table: &FeatureTable,
    detector: &wirewatch_core::detector::FittedDetector,
) -> Vec<WindowScore> {
    table
        .rows()
        .iter()
        .zip(detector.score(table))
        .map(|(row, score)| WindowScore {
            window_start: row.window_start,
            anomaly_score: score,
            is_anomaly: detector.is_anomalous(score),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirewatch_core::detector::DetectorConfig;

    #[test]
    fn test_scores_follow_table_order() -> Result<()> {
        let mut records = Vec::new();
        for i in 0..20 {
            let packets = if i == 7 { 900 } else { 30 };
            records.push(serde_json::json!({
                "window_start": i as f64 * 60.0,
                "total_packets": packets,
                "total_bytes": packets * 100,
                "unique_src_ips": 3,
                "unique_dst_ips": 2,
                "unique_src_ports": 4,
                "unique_dst_ports": 2,
                "tcp_count": packets,
                "udp_count": 0,
                "other_count": 0,
                "avg_packet_size": 100.0,
            }));
        }
        let table = FeatureTable::from_json_records(&serde_json::Value::Array(records).to_string())?;
        let detector = DetectorConfig::default().fit(&table)?;
        let scores = score_rows(&table, &detector);

        assert_eq!(scores.len(), 20);
        assert_eq!(scores[7].window_start, 420.0);
        assert!(scores[7].is_anomaly);
        let max = scores.iter().map(|s| s.anomaly_score).fold(f64::MIN, f64::max);
        assert_eq!(scores[7].anomaly_score, max);
        Ok(())
    }
}
