use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

/// Copies the jobs that finished in the last days from the Slurm accounting DB into the
/// chargeback table. Meant to run once a night from cron or a systemd timer.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(version)]
pub struct Args {
    /// Settings file, replaces `config/default.toml` and `config/$RUN_MODE.toml`
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Overrides `slurm.job_prev_days`
    #[arg(long)]
    pub days: Option<u32>,

    /// `-v` debug, `-vv` trace
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}
