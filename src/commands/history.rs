//! `converge history` - templates applied to an instance

use anyhow::Result;
use convergence::CancelToken;

use super::{orchestrator, print_json, report};
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, instance: &str, json: bool) -> Result<()> {
    let orchestrator = orchestrator(ctx)?;
    let history = orchestrator
        .history(instance, &CancelToken::new())
        .map_err(|e| report(ctx, e))?;

    if json {
        return print_json(&history);
    }

    ui::header(&format!("Template history for {instance}"));
    if history.is_empty() {
        ui::dim("No templates applied");
        return Ok(());
    }

    for entry in &history {
        let applied = entry
            .applied_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M");
        ui::info(&format!(
            "{applied}  {} {} via {}",
            entry.name, entry.version, entry.package_manager
        ));
        ui::dim(&format!(
            "{} packages, {} services, {} users; checkpoint {}",
            entry.packages_installed,
            entry.services_configured,
            entry.users_created,
            entry.checkpoint
        ));
        for warning in &entry.warnings {
            ui::dim(&format!("warning: {warning}"));
        }
    }
    Ok(())
}
