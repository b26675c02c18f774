//! Operator command line.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::PipelineConfig;
use crate::database::models::{Stage, StageStatus};

#[derive(Debug, Parser)]
#[command(name = "vodmill")]
#[command(author, version, about = "Track and drive a media text pipeline over SQLite", long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database (path or sqlite: URL); overrides the config file.
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database: Option<String>,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Warnings and errors only.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter implied by `-v`/`-q`, if either was given.
    pub fn log_filter(&self) -> Option<String> {
        if self.quiet {
            return Some("vodmill=warn,sqlx=warn".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("vodmill=debug,sqlx=warn".to_string()),
            _ => Some("vodmill=trace,sqlx=info".to_string()),
        }
    }

    /// Effective sqlx database URL: `--database` (or `DATABASE_URL`) wins
    /// over the config file. Bare paths are turned into `sqlite:` URLs.
    pub fn database_url(&self, config: &PipelineConfig) -> String {
        match &self.database {
            Some(value) if value.starts_with("sqlite:") => value.clone(),
            Some(path) => format!("sqlite:{path}"),
            None => config.database_url(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run discovery and the full stage sequence.
    Run(RunArgs),
    /// Discovery only: list collections into the catalog.
    Discover(DiscoverArgs),
    /// Per-stage status counts, as a table.
    Status(StatusArgs),
    /// List registered job partitions with item counts.
    Partitions,
    /// Bulk-reset one stage's statuses.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Job name; the run executes in a partition registered under it.
    #[arg(long)]
    pub job: Option<String>,

    /// Reuse the job's newest partition instead of creating a fresh one.
    #[arg(long, requires = "job")]
    pub resume: bool,

    /// Restrict a fresh partition to this collection (repeatable).
    #[arg(long = "collection", value_name = "ID")]
    pub collections: Vec<String>,

    /// Restrict a fresh partition to titles containing this keyword.
    #[arg(long)]
    pub keyword: Option<String>,

    #[arg(long)]
    pub skip_discovery: bool,
    #[arg(long)]
    pub skip_acquisition: bool,
    #[arg(long)]
    pub skip_conversion: bool,
    #[arg(long)]
    pub skip_transcription: bool,
    #[arg(long)]
    pub skip_summarization: bool,
    #[arg(long)]
    pub skip_export: bool,

    /// Per-collection cap on newly discovered items.
    #[arg(long, value_name = "N")]
    pub limit_discovery: Option<u32>,
    #[arg(long, value_name = "N")]
    pub limit_acquisition: Option<u32>,
    #[arg(long, value_name = "N")]
    pub limit_conversion: Option<u32>,
    #[arg(long, value_name = "N")]
    pub limit_transcription: Option<u32>,
    #[arg(long, value_name = "N")]
    pub limit_summarization: Option<u32>,
    #[arg(long, value_name = "N")]
    pub limit_export: Option<u32>,

    /// Concurrent worker invocations per stage.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Attempts before an item's failure becomes final.
    #[arg(long, value_name = "N")]
    pub retry_limit: Option<u32>,

    /// Per-item worker timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Stop the sequence after a stage that selected items but completed
    /// none.
    #[arg(long)]
    pub halt_on_error: bool,

    /// Keep running later stages after a systemic stage error.
    #[arg(long)]
    pub keep_going: bool,
}

impl RunArgs {
    /// Whether the flag for `stage` was given on the command line.
    pub fn skips(&self, stage: Stage) -> bool {
        match stage {
            Stage::Acquisition => self.skip_acquisition,
            Stage::Conversion => self.skip_conversion,
            Stage::Transcription => self.skip_transcription,
            Stage::Summarization => self.skip_summarization,
            Stage::Export => self.skip_export,
        }
    }

    /// Item limit flag for `stage`, if given.
    pub fn limit_for(&self, stage: Stage) -> Option<u32> {
        match stage {
            Stage::Acquisition => self.limit_acquisition,
            Stage::Conversion => self.limit_conversion,
            Stage::Transcription => self.limit_transcription,
            Stage::Summarization => self.limit_summarization,
            Stage::Export => self.limit_export,
        }
    }
}

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// Per-collection cap on newly discovered items.
    #[arg(long, value_name = "N")]
    pub limit: Option<u32>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Show the job's newest partition instead of the catalog.
    #[arg(long)]
    pub job: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Stage whose statuses to reset.
    #[arg(long)]
    pub stage: Stage,

    /// Statuses to move away from, comma separated.
    #[arg(
        long,
        value_delimiter = ',',
        default_values_t = [StageStatus::InProgress, StageStatus::Failed],
    )]
    pub from: Vec<StageStatus>,

    /// Status to move the matching items to.
    #[arg(long, default_value_t = StageStatus::Pending)]
    pub to: StageStatus,

    /// Reset the job's newest partition instead of the catalog.
    #[arg(long)]
    pub job: Option<String>,
}
