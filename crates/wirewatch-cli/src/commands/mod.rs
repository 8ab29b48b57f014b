pub mod analyze;
pub mod features;
pub mod score;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use wirewatch_core::config::AnalysisConfig;

#[derive(Parser)]
#[command(
    name = "wirewatch",
    about = "Windowed traffic fingerprinting and anomaly scoring for packet captures",
    long_about = "wirewatch - splits a PCAP into time windows, fingerprints each window\n\
                  (packets, bytes, distinct hosts and ports, protocol mix) and ranks\n\
                  the windows by how easily an isolation forest separates them.",
    version,
    propagate_version = true,
    styles = get_styles(),
)]
pub struct Cli {
    /// Skip the banner
    #[arg(short, long, global = true, default_value_t = false)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Window, fingerprint and score a capture; write report.json
    Analyze(analyze::AnalyzeArgs),

    /// Export the per-window feature table of a capture as JSON
    Features(features::FeaturesArgs),

    /// Fit and score an exported feature table
    Score(score::ScoreArgs),
}

impl Commands {
    /// True when the command's JSON goes to stdout and must not be mixed with
    /// the banner.
    pub fn writes_stdout(&self) -> bool {
        match self {
            Commands::Analyze(_) => false,
            Commands::Features(args) => args.output.is_none(),
            Commands::Score(args) => args.output.is_none(),
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze(args) => analyze::run(args),
        Commands::Features(args) => features::run(args),
        Commands::Score(args) => score::run(args),
    }
}

/// Analysis knobs shared by every subcommand. Flags override values from
/// `--config`, which override the built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct TuningArgs {
    /// JSON file with analysis settings
    #[arg(long, env = "WIREWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Window length in seconds
    #[arg(short, long, env = "WIREWATCH_WINDOW_SIZE")]
    pub window_size: Option<f64>,

    /// Expected fraction of anomalous windows, in (0, 0.5]
    #[arg(short, long, env = "WIREWATCH_CONTAMINATION")]
    pub contamination: Option<f64>,

    /// Seed for the isolation forest
    #[arg(long, env = "WIREWATCH_RANDOM_STATE")]
    pub random_state: Option<u64>,

    /// Number of isolation trees
    #[arg(long, env = "WIREWATCH_TREES")]
    pub trees: Option<usize>,

    /// Maximum windows sampled per tree
    #[arg(long, env = "WIREWATCH_MAX_SAMPLES")]
    pub max_samples: Option<usize>,

    /// Number of top-scoring windows to list
    #[arg(long, env = "WIREWATCH_TOP")]
    pub top: Option<usize>,
}

impl TuningArgs {
    pub fn resolve(&self) -> Result<AnalysisConfig> {
        let mut config = load_config(self.config.as_deref())?;

        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.contamination {
            config.contamination = v;
        }
        if let Some(v) = self.random_state {
            config.random_state = v;
        }
        if let Some(v) = self.trees {
            config.n_estimators = v;
        }
        if let Some(v) = self.max_samples {
            config.max_samples = v;
        }
        if let Some(v) = self.top {
            config.top_n = v;
        }

        config.validate().context("invalid analysis settings")?;
        tracing::debug!(?config, "effective config");
        Ok(config)
    }
}

/// Read a config file without validating it, so flags can still override
/// bad values. Missing keys keep their defaults.
pub fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    let Some(path) = path else {
        return Ok(AnalysisConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid config {}", path.display()))
}

fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(
            clap::builder::styling::AnsiColor::BrightCyan
                .on_default()
                .bold(),
        )
        .usage(
            clap::builder::styling::AnsiColor::BrightCyan
                .on_default()
                .bold(),
        )
        .literal(
            clap::builder::styling::AnsiColor::BrightGreen
                .on_default()
                .bold(),
        )
        .placeholder(
            clap::builder::styling::AnsiColor::BrightWhite
                .on_default()
                .dimmed(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() -> Result<()> {
        let args = TuningArgs {
            window_size: Some(30.0),
            top: Some(3),
            ..TuningArgs::default()
        };
        let config = args.resolve()?;
        assert_eq!(config.window_size, 30.0);
        assert_eq!(config.top_n, 3);
        assert_eq!(config.contamination, 0.1);
        Ok(())
    }

    #[test]
    fn test_flags_override_config_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"window_size": 10, "contamination": 0.2}}"#)?;
        let args = TuningArgs {
            config: Some(file.path().to_path_buf()),
            contamination: Some(0.05),
            ..TuningArgs::default()
        };
        let config = args.resolve()?;
        assert_eq!(config.window_size, 10.0);
        assert_eq!(config.contamination, 0.05);
        Ok(())
    }

    #[test]
    fn test_bad_override_rejected() {
        let args = TuningArgs {
            contamination: Some(0.8),
            ..TuningArgs::default()
        };
        assert!(args.resolve().is_err());
    }
}
