use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;

use wirewatch_core::ingest::PcapIngestor;
use wirewatch_core::report::{self, AnalysisReport};

use super::TuningArgs;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Path to the PCAP or PCAPNG file
    pub pcap: PathBuf,

    /// Output directory for report.json
    #[arg(short, long, default_value = "case")]
    pub out: PathBuf,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

pub fn run(args: AnalyzeArgs) -> Result<()> {
    let started = Instant::now();
    let config = args.tuning.resolve()?;

    // 1. Ingest PCAP
    println!(
        "  {} {}",
        console::style("[1/3] ingesting").cyan().bold(),
        args.pcap.display(),
    );

    let ingestor = PcapIngestor::from_file(&args.pcap)
        .with_context(|| format!("failed to ingest {}", args.pcap.display()))?;
    let (capture, packets) = ingestor.into_parts();

    println!(
        "        {} packets parsed, {} errors, sha256:{}",
        console::style(capture.total_packets).green().bold(),
        capture.parse_errors,
        capture.file_sha256.get(..16).unwrap_or(capture.file_sha256.as_str()),
    );
    if capture.unsupported_linktype > 0 {
        println!(
            "        {} frames on an unsupported link type carry no IP layer",
            console::style(capture.unsupported_linktype).yellow(),
        );
    }

    // 2. Window + score
    println!(
        "  {} {}s windows, contamination {}",
        console::style("[2/3] windowing + scoring").cyan().bold(),
        config.window_size,
        config.contamination,
    );

    let report = report::analyze(&packets, capture, &config).context("analysis failed")?;

    println!(
        "        {} windows, {} flagged anomalous",
        console::style(report.summary.total_windows).green().bold(),
        console::style(report.summary.anomalous_windows).red().bold(),
    );
    if let Some(threshold) = report.summary.score_threshold {
        println!("        score threshold {:.4}", threshold);
    }
    if let Some(reason) = &report.skipped_reason {
        println!(
            "  {} {}",
            console::style("warning:").yellow().bold(),
            reason,
        );
    }

    print_top(&report);

    // 3. Write report
    println!(
        "  {}",
        console::style("[3/3] writing report").cyan().bold(),
    );

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("cannot create {}", args.out.display()))?;
    let report_path = args.out.join("report.json");
    let written = report.write_json(&report_path)?;

    println!(
        "        {} ({} bytes)",
        report_path.display(),
        written,
    );
    println!(
        "\n  {} in {:.2}s",
        console::style("done").green().bold(),
        started.elapsed().as_secs_f64(),
    );

    Ok(())
}

fn print_top(report: &AnalysisReport) {
    if report.top_windows.is_empty() {
        return;
    }

    println!("        top windows:");
    for (rank, window) in report.top().enumerate() {
        let score = window.anomaly_score.unwrap_or_default();
        let marker = if window.is_anomaly {
            console::style("ANOMALY").red().bold().to_string()
        } else {
            console::style("normal").dim().to_string()
        };
        println!(
            "          {:>2}. t={:<14.3} score {:.4} {:>7}  {} pkts, {} bytes, {} src ips",
            rank + 1,
            window.features.window_start,
            score,
            marker,
            window.features.total_packets,
            window.features.total_bytes,
            window.features.unique_src_ips,
        );
    }
}
