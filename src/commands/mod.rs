// Read-only commands
pub mod checkpoints;
pub mod diff;
pub mod history;
pub mod inspect;

// Mutating commands
pub mod apply;
pub mod rollback;

use anyhow::Result;
use colored::Colorize;
use convergence::{Impact, InspectorOptions, LeaseDir, Orchestrator, RemoteExecutor};
use std::sync::Arc;

use crate::Context;
use crate::paths;
use crate::ssh::SshExecutor;
use crate::ui;

/// Orchestrator wired to the SSH transport and local lease directory
pub fn orchestrator(ctx: &Context) -> Result<Orchestrator> {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::from_config(&ctx.config));
    let leases = LeaseDir::new(paths::lease_dir()?);

    let mut orchestrator = Orchestrator::new(executor, leases).with_inspector_options(
        InspectorOptions {
            min_uid: ctx.config.inspect.min_uid,
        },
    );
    if let Some(timeout) = ctx.config.apply.rollback_timeout() {
        orchestrator = orchestrator.with_rollback_timeout(timeout);
    }
    Ok(orchestrator)
}

/// Print a convergence failure with what it did to the instance.
///
/// Returns the error so callers can propagate it for a non-zero exit.
pub fn report(ctx: &Context, err: convergence::Error) -> anyhow::Error {
    let impact = err.impact();
    match impact {
        Impact::Indeterminate => {
            eprintln!();
            eprintln!("{}", "!! MANUAL INTERVENTION REQUIRED !!".red().bold());
            ui::error(&err.to_string());
        }
        _ => ui::error(&err.to_string()),
    }

    if ctx.verbose > 0 {
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            ui::dim(&format!("caused by: {cause}"));
            source = cause.source();
        }
    }

    ui::dim(impact.description());
    if let Some(checkpoint) = err.checkpoint() {
        ui::dim(&format!("Checkpoint: {checkpoint}"));
    }
    if err.is_retryable() {
        ui::dim("This failure may be transient; retrying is safe");
    } else {
        ui::dim(impact.advice());
    }

    anyhow::Error::new(err)
}

/// Print `value` as pretty JSON
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
