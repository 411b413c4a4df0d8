use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use infographic_store::model::{AspectRatio, OutputSize};

pub const DEFAULT_DB_PATH: &str = ".cache/infographic/infographic.sqlite";

#[derive(Parser, Debug)]
#[command(
    name = "infostore",
    version,
    about = "Local storage, batch and rate-limit core for infographic generation"
)]
pub struct Cli {
    /// JSON configuration file; defaults apply when absent.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Directory of pre-store JSON blobs, imported once on first use.
    #[arg(long, global = true)]
    pub legacy_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Schema version, record counts and quota usage.
    Status,
    #[command(subcommand)]
    Versions(VersionsCommand),
    #[command(subcommand)]
    Templates(TemplatesCommand),
    #[command(subcommand)]
    Draft(DraftCommand),
    #[command(subcommand)]
    Batch(BatchCommand),
    /// Import records from `--legacy-dir` now.
    Migrate,
}

#[derive(Subcommand, Debug)]
pub enum VersionsCommand {
    List,
    Show { id: String },
    Delete { id: String },
    Clear,
    Feedback(FeedbackArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FeedbackArgs {
    pub id: String,

    #[arg(long)]
    pub rating: u8,

    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum TemplatesCommand {
    List,
    Export { path: PathBuf },
    Import { path: PathBuf },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum DraftCommand {
    Show,
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum BatchCommand {
    Enqueue(EnqueueArgs),
    /// Every queue with its derived status.
    List,
    Stats { queue_id: String },
    Show { queue_id: String },
    Retry { item_id: String },
    Cancel { item_id: String },
    Run(RunArgs),
    /// Delete complete and cancelled items of a queue.
    Clear { queue_id: String },
}

#[derive(Args, Debug, Clone)]
pub struct EnqueueArgs {
    #[arg(long = "topic", required = true)]
    pub topics: Vec<String>,

    #[arg(long, default_value = "")]
    pub style: String,

    #[arg(long, default_value = "")]
    pub palette: String,

    #[arg(long, default_value = "1K")]
    pub size: OutputSize,

    #[arg(long, default_value = "16:9")]
    pub aspect_ratio: AspectRatio,

    #[arg(long = "filter")]
    pub filters: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    pub queue_id: String,

    /// Program invoked as `<program> [args...] analyze|render`.
    #[arg(long)]
    pub backend_cmd: PathBuf,

    #[arg(long = "backend-arg")]
    pub backend_args: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub stop_on_error: bool,

    #[arg(long, default_value_t = false)]
    pub no_history: bool,
}
