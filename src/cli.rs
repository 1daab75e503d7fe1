use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge running instances to declared templates", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show packages, services, users and ports on an instance
    Inspect(InstanceArgs),

    /// Show what applying a template would change
    Diff(DiffArgs),

    /// Apply a template to a running instance
    Apply(ApplyArgs),

    /// Restore an instance to a checkpoint
    Rollback(RollbackArgs),

    /// List rollback checkpoints stored on an instance
    Checkpoints(InstanceArgs),

    /// Show templates applied to an instance
    History(InstanceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct InstanceArgs {
    /// Instance name or host
    pub instance: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DiffArgs {
    /// Instance name or host
    pub instance: String,

    /// Template file (.yaml, .toml or .json)
    pub template: PathBuf,

    /// Override the package manager (apt, dnf, conda, spack, auto)
    #[arg(long)]
    pub package_manager: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Instance name or host
    pub instance: String,

    /// Template file (.yaml, .toml or .json)
    pub template: PathBuf,

    /// Show what would change without changing it
    #[arg(long)]
    pub dry_run: bool,

    /// Apply even when conflicts are found
    #[arg(long)]
    pub force: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Override the package manager (apt, dnf, conda, spack, auto)
    #[arg(long)]
    pub package_manager: Option<String>,

    /// Give up after this many seconds (the automatic rollback still runs)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Args)]
pub struct RollbackArgs {
    /// Instance name or host
    pub instance: String,

    /// Checkpoint id (see `converge checkpoints`)
    pub checkpoint: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}
