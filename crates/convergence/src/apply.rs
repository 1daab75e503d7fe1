//! Apply engine
//!
//! Turns a [`TemplateDiff`] into scripts and runs them in a fixed order:
//! packages, services, users, ports. The first failing category stops the
//! apply; port failures are downgraded to warnings.

use std::sync::Arc;

use crate::diff::{PackageDiff, ServiceAction, TemplateDiff};
use crate::error::ApplyError;
use crate::manager::backend_for;
use crate::remote::{CancelToken, ExecutionResult, RemoteExecutor};
use crate::script::{ScriptGenerator, ShellScripts};
use crate::types::{ApplyResult, PackageManager, ResourceCategory, Template};

/// Executes diffs against an instance.
#[derive(Clone)]
pub struct ApplyEngine {
    executor: Arc<dyn RemoteExecutor>,
    scripts: Arc<dyn ScriptGenerator>,
}

impl ApplyEngine {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            scripts: Arc::new(ShellScripts),
        }
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptGenerator>) -> Self {
        self.scripts = scripts;
        self
    }

    /// Apply every change in `diff` to `instance`
    pub fn apply(
        &self,
        instance: &str,
        diff: &TemplateDiff,
        template: &Template,
        cancel: &CancelToken,
    ) -> Result<ApplyResult, ApplyError> {
        log::info!(
            "Applying template {} to {instance}: {}",
            template.name,
            diff.summary()
        );
        let mut result = ApplyResult {
            packages_installed: self.apply_packages(instance, diff, cancel)?,
            ..Default::default()
        };

        if !diff.services_to_configure.is_empty() || !diff.services_to_stop.is_empty() {
            let services: Vec<_> = diff
                .services_to_configure
                .iter()
                .chain(&diff.services_to_stop)
                .cloned()
                .collect();
            let script = self.scripts.service_script(&services);
            self.run(instance, ResourceCategory::Services, "configure services", &script, cancel)?;
            result.services_configured = diff
                .services_to_configure
                .iter()
                .filter(|s| s.action == ServiceAction::Configure)
                .count();
        }

        if !diff.users_to_create.is_empty() || !diff.users_to_modify.is_empty() {
            let script = self
                .scripts
                .user_script(&diff.users_to_create, &diff.users_to_modify);
            self.run(instance, ResourceCategory::Users, "manage users", &script, cancel)?;
            result.users_created = diff.users_to_create.len();
        }

        if !diff.ports_to_open.is_empty() {
            let script = self.scripts.port_script(&diff.ports_to_open);
            if let Err(e) = self.run(instance, ResourceCategory::Ports, "open ports", &script, cancel) {
                log::warn!("{instance}: {e}");
                result
                    .warnings
                    .push(format!("Failed to open ports {:?}: {e}", diff.ports_to_open));
            }
        }

        log::info!(
            "Applied template {} to {instance}: {} packages, {} services, {} users",
            template.name,
            result.packages_installed,
            result.services_configured,
            result.users_created
        );
        Ok(result)
    }

    fn apply_packages(
        &self,
        instance: &str,
        diff: &TemplateDiff,
        cancel: &CancelToken,
    ) -> Result<usize, ApplyError> {
        let mut installed = 0;
        for (manager, install, remove) in group_by_manager(diff) {
            let backend = backend_for(manager).ok_or(ApplyError::UnsupportedManager { manager })?;
            let script = self.scripts.package_script(backend, &install, &remove);
            let action = format!("install packages with {manager}");
            self.run(instance, ResourceCategory::Packages, &action, &script, cancel)?;
            installed += install.len();
        }
        Ok(installed)
    }

    fn run(
        &self,
        instance: &str,
        category: ResourceCategory,
        action: &str,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ApplyError> {
        let transport = |source| ApplyError::Transport {
            category,
            action: action.to_string(),
            source,
        };
        cancel.check().map_err(transport)?;

        log::debug!("{instance}: running {category} script");
        let result = self
            .executor
            .execute_script(instance, script, cancel)
            .map_err(transport)?;

        if !result.success() {
            return Err(ApplyError::ScriptFailed {
                category,
                action: action.to_string(),
                exit_code: result.exit_code,
                stderr: result.error_output(),
            });
        }
        Ok(result)
    }
}

type ManagerBatch = (PackageManager, Vec<PackageDiff>, Vec<PackageDiff>);

/// Group package entries by manager, keeping first-seen order
fn group_by_manager(diff: &TemplateDiff) -> Vec<ManagerBatch> {
    let mut batches: Vec<ManagerBatch> = Vec::new();
    let entries = diff
        .packages_to_install
        .iter()
        .map(|p| (p, true))
        .chain(diff.packages_to_remove.iter().map(|p| (p, false)));

    for (pkg, install) in entries {
        let idx = match batches.iter().position(|(m, _, _)| *m == pkg.package_manager) {
            Some(idx) => idx,
            None => {
                batches.push((pkg.package_manager, Vec::new(), Vec::new()));
                batches.len() - 1
            }
        };
        let (_, to_install, to_remove) = &mut batches[idx];
        if install {
            to_install.push(pkg.clone());
        } else {
            to_remove.push(pkg.clone());
        }
    }
    batches
}
