use clap::{Parser, Subcommand};
use expstore_core::Label;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "expstore",
    version,
    about = "Inspect and edit triage expectations"
)]
pub struct Cli {
    /// YAML config file; defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overrides the config file
    #[arg(long, global = true, env = "EXPSTORE_DB")]
    pub db: Option<PathBuf>,

    /// Fail on unknown config keys instead of warning
    #[arg(long, global = true)]
    pub strict: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the current expectations as JSON
    Get(GetArgs),
    /// Set a label on one or more digests of a grouping
    Triage(TriageArgs),
    /// Page through the triage log, newest first
    Log(LogArgs),
    /// Revert a triage record
    Undo(UndoArgs),
    /// Show who labeled an entry and when
    History(HistoryArgs),
    /// List records that never finished committing
    Incomplete(ScopeArgs),
    /// Mark entries as recently used
    Touch(TouchArgs),
    /// Garbage-collect unused entries
    Gc(GcArgs),
}

/// Selects the partition; both flags empty means master.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ScopeArgs {
    #[arg(long, default_value = "")]
    pub change_list: String,

    /// Code review system the change list belongs to
    #[arg(long, default_value = "gerrit")]
    pub crs: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TriageArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub grouping: String,

    #[arg(long = "digest", required = true)]
    pub digests: Vec<String>,

    /// positive | negative | untriaged
    #[arg(long)]
    pub label: Label,

    #[arg(long)]
    pub user: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LogArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    #[arg(long, default_value_t = 20)]
    pub size: usize,

    /// Include the per-entry changes of each record
    #[arg(long)]
    pub details: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct UndoArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub record: String,

    #[arg(long)]
    pub user: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub grouping: String,

    #[arg(long)]
    pub digest: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TouchArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub grouping: String,

    #[arg(long = "digest", required = true)]
    pub digests: Vec<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GcArgs {
    #[command(subcommand)]
    pub cmd: GcSub,
}

#[derive(Subcommand, Debug, Clone)]
pub enum GcSub {
    /// Flag entries with a label that were not used recently
    Mark(GcMarkArgs),
    /// Delete every flagged entry
    Collect(ScopeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct GcMarkArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub label: Label,

    #[arg(long, default_value_t = 90)]
    pub older_than_days: i64,
}
