//! `converge inspect` - show what is on an instance

use anyhow::Result;
use colored::Colorize;
use convergence::{CancelToken, InstanceState, ServiceStatus};

use super::{orchestrator, print_json, report};
use crate::Context;
use crate::ui;

/// Packages listed before the rest are collapsed into a count
const PACKAGE_PREVIEW: usize = 20;

pub fn run(ctx: &Context, instance: &str, json: bool) -> Result<()> {
    let orchestrator = orchestrator(ctx)?;
    let pb = ui::spinner(&format!("Inspecting {instance}"), ctx.quiet || json);
    let state = orchestrator.inspect(instance, &CancelToken::new());
    pb.finish_and_clear();
    let state = state.map_err(|e| report(ctx, e))?;

    if json {
        return print_json(&state);
    }
    print_state(ctx, instance, &state);
    Ok(())
}

fn print_state(ctx: &Context, instance: &str, state: &InstanceState) {
    ui::header(&format!("Instance {instance}"));
    ui::kv("Package manager", state.package_manager.as_str());
    ui::kv(
        "Inspected at",
        &state
            .inspected_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );
    if let Some(last) = state.last_applied() {
        ui::kv(
            "Last template",
            &format!("{} {} ({})", last.name, last.version, last.checkpoint),
        );
    }
    if !state.coverage.services {
        ui::warn("Services could not be read in full");
    }
    if !state.coverage.users {
        ui::warn("Users could not be read in full");
    }

    ui::section(&format!("Packages ({})", state.packages.len()));
    let shown = if ctx.verbose > 0 {
        state.packages.len()
    } else {
        PACKAGE_PREVIEW
    };
    for pkg in state.packages.iter().take(shown) {
        println!(
            "  {} {} {}",
            pkg.name,
            pkg.version.dimmed(),
            format!("[{}]", pkg.package_manager).dimmed()
        );
    }
    if state.packages.len() > shown {
        ui::dim(&format!(
            "... and {} more (use -v to list all)",
            state.packages.len() - shown
        ));
    }

    ui::section(&format!("Services ({})", state.services.len()));
    for svc in &state.services {
        let status = match svc.status {
            ServiceStatus::Running => svc.status.to_string().green(),
            ServiceStatus::Stopped => svc.status.to_string().dimmed(),
            ServiceStatus::Failed => svc.status.to_string().red(),
        };
        let port = svc.port.map(|p| format!(" :{p}")).unwrap_or_default();
        let enabled = if svc.enabled { "" } else { " (disabled)" };
        println!("  {} {status}{port}{}", svc.name, enabled.dimmed());
    }

    ui::section(&format!("Users ({})", state.users.len()));
    for user in &state.users {
        println!(
            "  {} [{}] {}",
            user.name,
            user.groups.join(", "),
            user.shell.dimmed()
        );
    }

    ui::section("Listening ports");
    if state.ports.is_empty() {
        ui::dim("none");
    } else {
        let ports: Vec<String> = state.ports.iter().map(ToString::to_string).collect();
        println!("  {}", ports.join(", "));
    }
}
