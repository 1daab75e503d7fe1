//! `converge checkpoints` - list rollback checkpoints on an instance

use anyhow::Result;
use colored::Colorize;
use convergence::CancelToken;

use super::{orchestrator, print_json, report};
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context, instance: &str, json: bool) -> Result<()> {
    let orchestrator = orchestrator(ctx)?;
    let records = orchestrator
        .checkpoints(instance, &CancelToken::new())
        .map_err(|e| report(ctx, e))?;

    if json {
        return print_json(&records);
    }

    ui::header(&format!("Checkpoints on {instance}"));
    if records.is_empty() {
        ui::dim("No checkpoints");
        return Ok(());
    }

    for record in &records {
        let created = record
            .created_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S");
        let state = if record.restored {
            "restored".dimmed()
        } else {
            "available".green()
        };
        println!("  {} {} {state}", record.id.bold(), created);
        ui::dim(&format!(
            "{} packages, {} services, {} users, {} files",
            record.packages.len(),
            record.services.len(),
            record.users.len(),
            record.files.len()
        ));
    }
    Ok(())
}
