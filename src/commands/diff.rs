//! `converge diff` - preview what apply would change

use anyhow::Result;
use colored::Colorize;
use convergence::{CancelToken, PackageAction, ServiceAction, TemplateDiff, UserAction};

use super::{orchestrator, print_json, report};
use crate::Context;
use crate::cli::DiffArgs;
use crate::template;
use crate::ui;

pub fn run(ctx: &Context, args: DiffArgs) -> Result<()> {
    let mut template = template::load(&args.template)?;
    if let Some(manager) = args.package_manager {
        template.package_manager = Some(manager);
    }

    let orchestrator = orchestrator(ctx)?;
    let pb = ui::spinner(&format!("Inspecting {}", args.instance), ctx.quiet || args.json);
    let plan = orchestrator.plan(&args.instance, &template, &CancelToken::new());
    pb.finish_and_clear();
    let plan = plan.map_err(|e| report(ctx, e))?;

    if args.json {
        return print_json(&plan.diff);
    }

    ui::header(&format!("{} → {}", args.instance, template.name));
    print_diff(&plan.diff);
    Ok(())
}

/// Render a diff grouped by category, then conflicts, then a summary line
pub fn print_diff(diff: &TemplateDiff) {
    let packages: Vec<_> = diff
        .packages_to_install
        .iter()
        .chain(&diff.packages_to_remove)
        .collect();
    if !packages.is_empty() {
        ui::section(&format!("Packages ({})", diff.package_manager));
        for pkg in packages {
            let target = if pkg.target_version.is_empty() {
                "latest"
            } else {
                pkg.target_version.as_str()
            };
            match pkg.action {
                PackageAction::Install => ui::change('+', &format!("{} {}", pkg.name, target)),
                PackageAction::Upgrade => ui::change(
                    '~',
                    &format!("{} {} → {}", pkg.name, pkg.current_version, target),
                ),
                PackageAction::Remove => ui::change('-', &pkg.name),
            }
        }
    }

    let services: Vec<_> = diff
        .services_to_configure
        .iter()
        .chain(&diff.services_to_stop)
        .collect();
    if !services.is_empty() {
        ui::section("Services");
        for svc in services {
            let port = svc.port.map(|p| format!(" (port {p})")).unwrap_or_default();
            let symbol = match svc.action {
                ServiceAction::Configure => '+',
                ServiceAction::Stop => '-',
                ServiceAction::Start | ServiceAction::Restart => '~',
            };
            ui::change(symbol, &format!("{} {}{port}", svc.action, svc.name));
        }
    }

    let users: Vec<_> = diff
        .users_to_create
        .iter()
        .chain(&diff.users_to_modify)
        .collect();
    if !users.is_empty() {
        ui::section("Users");
        for user in users {
            let target = user.target_groups.join(", ");
            match user.action {
                UserAction::Create => {
                    ui::change('+', &format!("{} [{target}] {}", user.name, user.shell));
                }
                UserAction::Modify => ui::change(
                    '~',
                    &format!(
                        "{} [{}] → [{target}]",
                        user.name,
                        user.current_groups.join(", ")
                    ),
                ),
            }
        }
    }

    if !diff.ports_to_open.is_empty() {
        ui::section("Ports");
        let ports: Vec<String> = diff.ports_to_open.iter().map(ToString::to_string).collect();
        ui::change('+', &format!("open {}", ports.join(", ")));
    }

    if diff.has_conflicts() {
        ui::section("Conflicts");
        for conflict in &diff.conflicts {
            ui::warn(&format!(
                "[{}] {} {}",
                conflict.kind,
                conflict.description,
                format!("(resolution: {})", conflict.resolution).dimmed()
            ));
        }
    }

    println!();
    if diff.has_changes() {
        ui::info(&diff.summary());
    } else {
        ui::success(&diff.summary());
    }
}
