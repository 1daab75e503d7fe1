mod cli;
mod commands;
mod config;
mod paths;
mod ssh;
mod template;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

use config::ConvergeConfig;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: ConvergeConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "converge", &mut io::stdout());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => ConvergeConfig::load_from(path)?,
        None => ConvergeConfig::load()?,
    };

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config,
    };

    match cli.command {
        Command::Inspect(args) => commands::inspect::run(&ctx, &args.instance, args.json),
        Command::Diff(args) => commands::diff::run(&ctx, args),
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Rollback(args) => commands::rollback::run(&ctx, args),
        Command::Checkpoints(args) => commands::checkpoints::run(&ctx, &args.instance, args.json),
        Command::History(args) => commands::history::run(&ctx, &args.instance, args.json),
        Command::Completions { .. } => Ok(()),
    }
}
