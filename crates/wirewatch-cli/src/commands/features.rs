use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use wirewatch_core::ingest::PcapIngestor;
use wirewatch_core::window::WindowAggregator;

use super::load_config;

#[derive(Args)]
pub struct FeaturesArgs {
    /// Path to the PCAP or PCAPNG file
    pub pcap: PathBuf,

    /// Output path for the feature table (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON file with analysis settings; only window_size is used
    #[arg(long, env = "WIREWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Window length in seconds
    #[arg(short, long, env = "WIREWATCH_WINDOW_SIZE")]
    pub window_size: Option<f64>,
}

impl FeaturesArgs {
    /// Detector settings play no part in windowing, so only the window size
    /// is checked.
    pub fn aggregator(&self) -> Result<WindowAggregator> {
        let config = load_config(self.config.as_deref())?;
        let window_size = self.window_size.unwrap_or(config.window_size);
        WindowAggregator::new(window_size).context("invalid window size")
    }
}

pub fn run(args: FeaturesArgs) -> Result<()> {
    let aggregator = args.aggregator()?;

    let ingestor = PcapIngestor::from_file(&args.pcap)
        .with_context(|| format!("failed to ingest {}", args.pcap.display()))?;
    let (capture, packets) = ingestor.into_parts();

    let table = aggregator.aggregate(&packets);
    let json = serde_json::to_string_pretty(&table).context("failed to serialize feature table")?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!(
                "  {} {} windows from {} packets -> {}",
                console::style("exported").green().bold(),
                console::style(table.len()).cyan(),
                capture.total_packets,
                path.display(),
            );
        }
        None => println!("{json}"),
    }

    Ok(())
}
