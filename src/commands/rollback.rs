//! `converge rollback` - restore an instance to a checkpoint

use anyhow::Result;
use convergence::{CancelToken, CategoryOutcome};

use super::{orchestrator, report};
use crate::Context;
use crate::cli::RollbackArgs;
use crate::ui;

pub fn run(ctx: &Context, args: RollbackArgs) -> Result<()> {
    ui::warn(&format!(
        "This restores packages, services, users and config files on {} to checkpoint {}",
        args.instance, args.checkpoint
    ));
    if !ui::confirm("Roll back?", args.yes)? {
        ui::info("Aborted");
        return Ok(());
    }

    let orchestrator = orchestrator(ctx)?;
    let pb = ui::spinner(&format!("Rolling back {}", args.instance), ctx.quiet);
    let rollback = orchestrator.rollback(&args.instance, &args.checkpoint, &CancelToken::new());
    pb.finish_and_clear();
    let rollback = rollback.map_err(|e| report(ctx, e))?;

    ui::section("Rollback");
    for (category, outcome) in rollback.categories() {
        match outcome {
            CategoryOutcome::Unchanged => ui::dim(&format!("{category}: unchanged")),
            CategoryOutcome::Reverted => ui::success(&format!("{category}: reverted")),
            CategoryOutcome::Failed(why) => ui::error(&format!("{category}: {why}")),
        }
    }
    println!();
    ui::success(&format!("{} restored to {}", args.instance, args.checkpoint));
    Ok(())
}
