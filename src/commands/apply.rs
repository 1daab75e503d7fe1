//! `converge apply` - converge an instance to a template

use anyhow::Result;
use convergence::{ApplyRequest, ApplyResponse, CancelToken, Error};
use std::time::Duration;

use super::diff::print_diff;
use super::{orchestrator, report};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::template;
use crate::ui;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let template = template::load(&args.template)?;
    let orchestrator = orchestrator(ctx)?;

    let mut request = ApplyRequest::new(&args.instance, template);
    request.package_manager = args.package_manager;
    request.force = args.force;
    request.dry_run = true;

    // Preview first; the real apply re-inspects under its own lease
    let pb = ui::spinner(&format!("Planning {}", args.instance), ctx.quiet);
    let preview = orchestrator.apply(&request, &CancelToken::new());
    pb.finish_and_clear();
    let preview = preview.map_err(|e| report(ctx, e))?;

    ui::header(&format!("{} → {}", args.instance, request.template.name));
    let Some(plan) = preview.plan else {
        return Ok(());
    };
    print_diff(&plan);
    print_warnings(&preview.warnings);

    if args.dry_run {
        ui::dim("Dry run: nothing was changed");
        return Ok(());
    }
    if plan.has_conflicts() && !args.force {
        return Err(report(
            ctx,
            Error::ConflictsUnresolved {
                conflicts: plan.conflicts,
            },
        ));
    }
    if !plan.has_changes() {
        return Ok(());
    }

    println!();
    if !ui::confirm(
        &format!("Apply {} to {}?", request.template.name, args.instance),
        args.yes,
    )? {
        ui::info("Aborted");
        return Ok(());
    }

    request.dry_run = false;
    let cancel = match args.timeout {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    let pb = ui::spinner(&format!("Applying to {}", args.instance), ctx.quiet);
    let response = orchestrator.apply(&request, &cancel);
    pb.finish_and_clear();
    let response = response.map_err(|e| report(ctx, e))?;

    print_response(&response);
    Ok(())
}

fn print_response(response: &ApplyResponse) {
    println!();
    ui::success(&response.message);
    ui::kv("Packages installed", &response.packages_installed.to_string());
    ui::kv("Services configured", &response.services_configured.to_string());
    ui::kv("Users created", &response.users_created.to_string());
    if let Some(checkpoint) = &response.rollback_checkpoint {
        ui::kv("Checkpoint", checkpoint);
    }
    ui::kv("Took", &ui::format_duration(response.execution_time));
    print_warnings(&response.warnings);
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!();
    for warning in warnings {
        ui::warn(warning);
    }
}
