//! Apply orchestration
//!
//! Drives one apply through its phases:
//!
//! ```text
//! Validated -> Inspected -> Diffed -> DryRunReported
//!                                  -> ConflictBlocked
//!                                  -> Converged
//!                                  -> CheckpointCreated -> Applied -> Recorded
//!                                                       -> RolledBack
//! ```
//!
//! Nothing touches the instance before `CheckpointCreated`. Once a
//! checkpoint exists, a failed apply is rolled back exactly once.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::apply::ApplyEngine;
use crate::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointRecord, RemoteCheckpointManager, RollbackReport,
};
use crate::diff::{TemplateDiff, compute_diff};
use crate::error::{ApplyError, Error, LeaseError, Result, RollbackFailure};
use crate::history::{HistoryStore, RemoteHistoryStore};
use crate::inspector::{InspectorOptions, StateInspector};
use crate::lease::{InstanceLease, LeaseDir};
use crate::remote::{CancelToken, RemoteExecutor};
use crate::types::{AppliedTemplate, InstanceState, Template};

/// Where an apply ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validated,
    Inspected,
    Diffed,
    DryRunReported,
    ConflictBlocked,
    /// Nothing to do; no checkpoint was taken
    Converged,
    CheckpointCreated,
    Applied,
    RolledBack,
    Recorded,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validated => "validated",
            Self::Inspected => "inspected",
            Self::Diffed => "diffed",
            Self::DryRunReported => "dry-run-reported",
            Self::ConflictBlocked => "conflict-blocked",
            Self::Converged => "converged",
            Self::CheckpointCreated => "checkpoint-created",
            Self::Applied => "applied",
            Self::RolledBack => "rolled-back",
            Self::Recorded => "recorded",
        };
        f.write_str(name)
    }
}

/// A request to converge one instance to one template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub instance_name: String,
    pub template: Template,
    /// Overrides the template's package manager when set
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

impl ApplyRequest {
    pub fn new(instance_name: &str, template: Template) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            template,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(Error::InvalidRequest("instance name is required".to_string()));
        }
        if self.template.name.trim().is_empty() {
            return Err(Error::InvalidRequest("template name is required".to_string()));
        }
        Ok(())
    }

    /// The template with any request-level manager override applied
    fn effective_template(&self) -> Cow<'_, Template> {
        match self.package_manager.as_deref().map(str::trim) {
            Some(manager) if !manager.is_empty() => {
                let mut template = self.template.clone();
                template.package_manager = Some(manager.to_string());
                Cow::Owned(template)
            }
            _ => Cow::Borrowed(&self.template),
        }
    }
}

/// Outcome of a successful apply, dry run, or no-op
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResponse {
    pub success: bool,
    pub message: String,
    pub packages_installed: usize,
    pub services_configured: usize,
    pub users_created: usize,
    pub rollback_checkpoint: Option<String>,
    pub warnings: Vec<String>,
    pub execution_time: Duration,
    pub phase: Phase,
    /// The planned diff, for dry runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TemplateDiff>,
}

/// Observed state and the diff computed from it
#[derive(Debug, Clone)]
pub struct Plan {
    pub state: InstanceState,
    pub diff: TemplateDiff,
}

/// Wires inspector, diff, apply, checkpoints, history and leases together.
pub struct Orchestrator {
    executor: Arc<dyn RemoteExecutor>,
    inspector: StateInspector,
    apply_engine: ApplyEngine,
    checkpoints: Arc<dyn CheckpointManager>,
    history: Arc<dyn HistoryStore>,
    leases: LeaseDir,
    inspector_options: InspectorOptions,
    rollback_timeout: Option<Duration>,
}

impl Orchestrator {
    /// Orchestrator with on-instance checkpoints and history
    pub fn new(executor: Arc<dyn RemoteExecutor>, leases: LeaseDir) -> Self {
        let history: Arc<dyn HistoryStore> = Arc::new(RemoteHistoryStore::new(executor.clone()));
        let inspector = StateInspector::new(executor.clone(), history.clone());
        let checkpoints = Arc::new(RemoteCheckpointManager::new(
            executor.clone(),
            inspector.clone(),
        ));
        Self {
            apply_engine: ApplyEngine::new(executor.clone()),
            executor,
            inspector,
            checkpoints,
            history,
            leases,
            inspector_options: InspectorOptions::default(),
            rollback_timeout: None,
        }
    }

    pub fn with_inspector_options(mut self, options: InspectorOptions) -> Self {
        self.inspector_options = options;
        self.rebuild_inspection()
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self.rebuild_inspection()
    }

    /// Replace the checkpoint manager; `with_history` and
    /// `with_inspector_options` reset it, so call this last
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointManager>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_apply_engine(mut self, engine: ApplyEngine) -> Self {
        self.apply_engine = engine;
        self
    }

    /// Deadline for the rollback after a failed apply
    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = Some(timeout);
        self
    }

    fn rebuild_inspection(mut self) -> Self {
        self.inspector = StateInspector::new(self.executor.clone(), self.history.clone())
            .with_options(self.inspector_options.clone());
        self.checkpoints = Arc::new(RemoteCheckpointManager::new(
            self.executor.clone(),
            self.inspector.clone(),
        ));
        self
    }

    // ========================================================================
    // Read-only operations
    // ========================================================================

    pub fn inspect(&self, instance: &str, cancel: &CancelToken) -> Result<InstanceState> {
        self.inspector.inspect(instance, cancel)
    }

    /// Inspect and diff without changing anything
    pub fn plan(&self, instance: &str, template: &Template, cancel: &CancelToken) -> Result<Plan> {
        let state = self.inspector.inspect(instance, cancel)?;
        let diff = compute_diff(&state, template)?;
        Ok(Plan { state, diff })
    }

    pub fn checkpoints(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<CheckpointRecord>> {
        self.checkpoints
            .list_checkpoints(instance, cancel)
            .map_err(|source| Error::Checkpoints {
                instance: instance.to_string(),
                source,
            })
    }

    pub fn history(&self, instance: &str, cancel: &CancelToken) -> Result<Vec<AppliedTemplate>> {
        self.history
            .load(instance, cancel)
            .map_err(|source| Error::History {
                instance: instance.to_string(),
                source,
            })
    }

    // ========================================================================
    // Mutating operations
    // ========================================================================

    /// Converge `request.instance_name` to `request.template`
    pub fn apply(&self, request: &ApplyRequest, cancel: &CancelToken) -> Result<ApplyResponse> {
        let started = Instant::now();
        request.validate()?;
        let instance = request.instance_name.trim();
        let template = request.effective_template();
        enter(instance, Phase::Validated);

        let _lease = self.lease(instance)?;
        ensure_live(cancel, Phase::Validated)?;

        let state = self.inspector.inspect(instance, cancel)?;
        enter(instance, Phase::Inspected);

        let diff = compute_diff(&state, &template)?;
        enter(instance, Phase::Diffed);
        log::info!("{instance}: {}", diff.summary());

        let mut warnings = Vec::new();
        if diff.has_conflicts() {
            warnings.push(format!("{} conflicts found", diff.conflicts.len()));
        }
        if template.has_hooks() {
            warnings.push("Template hooks are not run by incremental apply".to_string());
        }

        if request.dry_run {
            enter(instance, Phase::DryRunReported);
            return Ok(ApplyResponse {
                success: true,
                message: format!("Dry run: {}", diff.summary()),
                packages_installed: diff.packages_to_install.len(),
                services_configured: diff.services_to_configure.len(),
                users_created: diff.users_to_create.len(),
                rollback_checkpoint: None,
                warnings,
                execution_time: started.elapsed(),
                phase: Phase::DryRunReported,
                plan: Some(diff),
            });
        }

        if diff.has_conflicts() && !request.force {
            enter(instance, Phase::ConflictBlocked);
            for conflict in &diff.conflicts {
                log::warn!("{instance}: {} conflict: {}", conflict.kind, conflict.description);
            }
            return Err(Error::ConflictsUnresolved {
                conflicts: diff.conflicts,
            });
        }

        if !diff.has_changes() {
            enter(instance, Phase::Converged);
            return Ok(ApplyResponse {
                success: true,
                message: format!("{instance} already matches template {}", template.name),
                packages_installed: 0,
                services_configured: 0,
                users_created: 0,
                rollback_checkpoint: None,
                warnings,
                execution_time: started.elapsed(),
                phase: Phase::Converged,
                plan: None,
            });
        }

        ensure_live(cancel, Phase::Diffed)?;
        let checkpoint = self
            .checkpoints
            .create_checkpoint(instance, cancel)
            .map_err(Error::CheckpointFailed)?;
        enter(instance, Phase::CheckpointCreated);

        let result = match self.apply_engine.apply(instance, &diff, &template, cancel) {
            Ok(result) => result,
            Err(apply_error) => return Err(self.roll_back(instance, checkpoint, apply_error)),
        };
        enter(instance, Phase::Applied);
        warnings.extend(result.warnings.iter().cloned());

        let entry = AppliedTemplate {
            name: template.name.clone(),
            version: template.version.clone(),
            applied_at: Utc::now(),
            package_manager: diff.package_manager,
            checkpoint: checkpoint.id.clone(),
            packages_installed: result.packages_installed,
            services_configured: result.services_configured,
            users_created: result.users_created,
            warnings: result.warnings.clone(),
        };
        let phase = match self.history.append(instance, &entry, cancel) {
            Ok(()) => {
                enter(instance, Phase::Recorded);
                Phase::Recorded
            }
            Err(e) => {
                log::warn!("{instance}: failed to record template application: {e}");
                warnings.push(format!("Failed to record template application: {e}"));
                Phase::Applied
            }
        };

        Ok(ApplyResponse {
            success: true,
            message: format!("Template {} applied to {instance}", template.name),
            packages_installed: result.packages_installed,
            services_configured: result.services_configured,
            users_created: result.users_created,
            rollback_checkpoint: Some(checkpoint.id),
            warnings,
            execution_time: started.elapsed(),
            phase,
            plan: None,
        })
    }

    /// Restore `instance` to a stored checkpoint
    pub fn rollback(
        &self,
        instance: &str,
        checkpoint_id: &str,
        cancel: &CancelToken,
    ) -> Result<RollbackReport> {
        let _lease = self.lease(instance)?;
        let checkpoint = Checkpoint::new(checkpoint_id, instance);

        let failure = match self
            .checkpoints
            .rollback_to_checkpoint(instance, &checkpoint, cancel)
        {
            Ok(report) if report.is_complete() => return Ok(report),
            Ok(report) => RollbackFailure::Incomplete(report),
            Err(e) => RollbackFailure::Aborted(e),
        };
        Err(Error::Rollback {
            instance: instance.to_string(),
            checkpoint: checkpoint.id,
            source: failure,
        })
    }

    fn lease(&self, instance: &str) -> Result<InstanceLease> {
        self.leases.acquire(instance).map_err(|e| match e {
            LeaseError::Busy { instance } => Error::InstanceBusy { instance },
            source @ LeaseError::Io { .. } => Error::Lease {
                instance: instance.to_string(),
                source,
            },
        })
    }

    /// Undo a failed apply; runs once, on its own cancel token
    fn roll_back(&self, instance: &str, checkpoint: Checkpoint, apply_error: ApplyError) -> Error {
        log::error!("{instance}: {apply_error}; rolling back to {}", checkpoint.id);

        let token = match self.rollback_timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };

        match self
            .checkpoints
            .rollback_to_checkpoint(instance, &checkpoint, &token)
        {
            Ok(report) if report.is_complete() => {
                enter(instance, Phase::RolledBack);
                Error::RolledBack {
                    source: apply_error,
                    checkpoint: checkpoint.id,
                    report,
                }
            }
            Ok(report) => {
                log::error!("{instance}: rollback incomplete, manual intervention required");
                Error::RollbackFailed {
                    instance: instance.to_string(),
                    checkpoint: checkpoint.id,
                    apply: apply_error,
                    rollback: RollbackFailure::Incomplete(report),
                }
            }
            Err(e) => {
                log::error!("{instance}: rollback failed, manual intervention required: {e}");
                Error::RollbackFailed {
                    instance: instance.to_string(),
                    checkpoint: checkpoint.id,
                    apply: apply_error,
                    rollback: RollbackFailure::Aborted(e),
                }
            }
        }
    }
}

fn enter(instance: &str, phase: Phase) {
    log::info!("{instance}: {phase}");
}

fn ensure_live(cancel: &CancelToken, reached: Phase) -> Result<()> {
    cancel
        .check()
        .map_err(|_| Error::Cancelled { phase: reached })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CategoryOutcome;
    use crate::error::{CheckpointError, Impact};
    use crate::testing::{MockExecutor, ubuntu_host};
    use crate::types::{ServiceConfig, UserConfig};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Checkpoint double counting calls, with a scripted rollback outcome
    #[derive(Default)]
    struct CountingCheckpoints {
        created: AtomicUsize,
        rollbacks: AtomicUsize,
        rollback_fails: bool,
        tokens_cancelled: Mutex<Vec<bool>>,
    }

    impl CheckpointManager for CountingCheckpoints {
        fn create_checkpoint(
            &self,
            instance: &str,
            _cancel: &CancelToken,
        ) -> std::result::Result<Checkpoint, CheckpointError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Checkpoint::new("checkpoint-test", instance))
        }

        fn rollback_to_checkpoint(
            &self,
            _instance: &str,
            _checkpoint: &Checkpoint,
            cancel: &CancelToken,
        ) -> std::result::Result<RollbackReport, CheckpointError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.tokens_cancelled.lock().unwrap().push(cancel.is_cancelled());
            if self.rollback_fails {
                Ok(RollbackReport {
                    packages: CategoryOutcome::Failed("apt-get remove curl: exit 100".to_string()),
                    ..Default::default()
                })
            } else {
                Ok(RollbackReport {
                    packages: CategoryOutcome::Reverted,
                    ..Default::default()
                })
            }
        }

        fn list_checkpoints(
            &self,
            _instance: &str,
            _cancel: &CancelToken,
        ) -> std::result::Result<Vec<CheckpointRecord>, CheckpointError> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        mock: Arc<MockExecutor>,
        checkpoints: Arc<CountingCheckpoints>,
        orchestrator: Orchestrator,
        _leases: TempDir,
    }

    fn fixture(checkpoints: CountingCheckpoints) -> Fixture {
        let leases = TempDir::new().unwrap();
        let mock = Arc::new(ubuntu_host());
        let checkpoints = Arc::new(checkpoints);
        let orchestrator = Orchestrator::new(mock.clone(), LeaseDir::new(leases.path()))
            .with_checkpoints(checkpoints.clone());
        Fixture {
            mock,
            checkpoints,
            orchestrator,
            _leases: leases,
        }
    }

    /// Three packages to install and one port conflict (apache2-style on 22)
    fn conflicting_template() -> Template {
        let mut template = Template::new("web");
        template.packages.system = vec!["git=2.40".to_string(), "curl".to_string(), "vim".to_string()];
        template.services = vec![ServiceConfig::new("gitea", Some(22))];
        template
    }

    fn web_template() -> Template {
        let mut template = Template::new("web");
        template.version = "1.2".to_string();
        template.packages.system = vec!["curl".to_string()];
        template.services = vec![ServiceConfig::new("redis", Some(6379))];
        template.users = vec![UserConfig::new("deploy", &["www-data"])];
        template
    }

    #[test]
    fn test_dry_run_reports_and_mutates_nothing() {
        let f = fixture(CountingCheckpoints::default());
        let mut request = ApplyRequest::new("web-1", conflicting_template());
        request.dry_run = true;

        let response = f.orchestrator.apply(&request, &CancelToken::new()).unwrap();

        assert!(response.success);
        assert_eq!(response.packages_installed, 3);
        assert_eq!(response.warnings, vec!["1 conflicts found"]);
        assert_eq!(response.phase, Phase::DryRunReported);
        assert!(response.rollback_checkpoint.is_none());
        assert!(response.plan.is_some());
        assert_eq!(f.checkpoints.created.load(Ordering::SeqCst), 0);
        assert!(f.mock.scripts().is_empty());
    }

    #[test]
    fn test_conflicts_block_without_force() {
        let f = fixture(CountingCheckpoints::default());
        let request = ApplyRequest::new("web-1", conflicting_template());

        let err = f.orchestrator.apply(&request, &CancelToken::new()).unwrap_err();

        assert!(matches!(err, Error::ConflictsUnresolved { ref conflicts } if conflicts.len() == 1));
        assert_eq!(err.impact(), Impact::Untouched);
        assert_eq!(f.checkpoints.created.load(Ordering::SeqCst), 0);
        assert!(f.mock.scripts().is_empty());
    }

    #[test]
    fn test_force_applies_despite_conflicts() {
        let f = fixture(CountingCheckpoints::default());
        let mut request = ApplyRequest::new("web-1", conflicting_template());
        request.force = true;

        let response = f.orchestrator.apply(&request, &CancelToken::new()).unwrap();

        assert_eq!(response.packages_installed, 3);
        assert_eq!(response.rollback_checkpoint.as_deref(), Some("checkpoint-test"));
        assert!(response.warnings.contains(&"1 conflicts found".to_string()));
        assert_eq!(f.checkpoints.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_successful_apply_records_history() {
        let f = fixture(CountingCheckpoints::default());
        let request = ApplyRequest::new("web-1", web_template());

        let response = f.orchestrator.apply(&request, &CancelToken::new()).unwrap();

        assert_eq!(response.phase, Phase::Recorded);
        assert_eq!(response.packages_installed, 1);
        assert_eq!(response.services_configured, 1);
        assert_eq!(response.users_created, 1);
        assert_eq!(f.checkpoints.rollbacks.load(Ordering::SeqCst), 0);

        let history = f.mock.scripts_containing("applied-templates.json");
        assert_eq!(history.len(), 1);
        assert!(history[0].contains("\"checkpoint-test\""));
        assert!(history[0].contains("\"1.2\""));
    }

    #[test]
    fn test_service_failure_rolls_back_once() {
        let f = fixture(CountingCheckpoints::default());
        f.mock.fail("Service changes", 5, "Unit redis.service not found.");
        let request = ApplyRequest::new("web-1", web_template());

        let err = f.orchestrator.apply(&request, &CancelToken::new()).unwrap_err();

        assert_eq!(f.checkpoints.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(err.impact(), Impact::Reverted);
        assert_eq!(err.checkpoint(), Some("checkpoint-test"));
        let msg = err.to_string();
        assert!(msg.contains("rolled back"));
        assert!(msg.contains("Unit redis.service not found."));
        // nothing after services ran
        assert!(f.mock.scripts_containing("User changes").is_empty());
        assert!(f.mock.scripts_containing("applied-templates.json").is_empty());
    }

    #[test]
    fn test_failed_rollback_carries_both_errors() {
        let f = fixture(CountingCheckpoints {
            rollback_fails: true,
            ..Default::default()
        });
        f.mock.fail("Service changes", 5, "Unit redis.service not found.");
        let request = ApplyRequest::new("web-1", web_template());

        let err = f.orchestrator.apply(&request, &CancelToken::new()).unwrap_err();

        assert_eq!(f.checkpoints.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(err.impact(), Impact::Indeterminate);
        let msg = err.to_string();
        assert!(msg.contains("Unit redis.service not found."));
        assert!(msg.contains("rollback also failed"));
        assert!(msg.contains("apt-get remove curl"));
        assert!(msg.contains("web-1"));
    }

    /// Cancels `token` as soon as the package script has run
    struct CancelAfterPackages {
        inner: MockExecutor,
        token: CancelToken,
    }

    impl RemoteExecutor for CancelAfterPackages {
        fn execute(
            &self,
            instance: &str,
            command: &str,
            cancel: &CancelToken,
        ) -> std::result::Result<crate::remote::ExecutionResult, crate::remote::TransportError>
        {
            self.inner.execute(instance, command, cancel)
        }

        fn execute_script(
            &self,
            instance: &str,
            script: &str,
            cancel: &CancelToken,
        ) -> std::result::Result<crate::remote::ExecutionResult, crate::remote::TransportError>
        {
            let result = self.inner.execute_script(instance, script, cancel);
            if script.contains("Package changes") {
                self.token.cancel();
            }
            result
        }

        fn copy_file(
            &self,
            instance: &str,
            local: &std::path::Path,
            remote: &str,
            cancel: &CancelToken,
        ) -> std::result::Result<(), crate::remote::TransportError> {
            self.inner.copy_file(instance, local, remote, cancel)
        }

        fn get_file(
            &self,
            instance: &str,
            remote: &str,
            local: &std::path::Path,
            cancel: &CancelToken,
        ) -> std::result::Result<(), crate::remote::TransportError> {
            self.inner.get_file(instance, remote, local, cancel)
        }
    }

    #[test]
    fn test_cancelled_apply_rolls_back_with_fresh_token() {
        let leases = TempDir::new().unwrap();
        let cancel = CancelToken::new();
        let executor = Arc::new(CancelAfterPackages {
            inner: ubuntu_host(),
            token: cancel.clone(),
        });
        let checkpoints = Arc::new(CountingCheckpoints::default());
        let orchestrator = Orchestrator::new(executor.clone(), LeaseDir::new(leases.path()))
            .with_checkpoints(checkpoints.clone());

        let err = orchestrator
            .apply(&ApplyRequest::new("web-1", web_template()), &cancel)
            .unwrap_err();

        assert_eq!(err.impact(), Impact::Reverted);
        assert!(matches!(
            err,
            Error::RolledBack {
                source: ApplyError::Transport { .. },
                ..
            }
        ));
        assert_eq!(*checkpoints.tokens_cancelled.lock().unwrap(), vec![false]);
        assert!(executor.inner.scripts_containing("Service changes").is_empty());
    }

    #[test]
    fn test_group_change_replaces_membership() {
        let f = fixture(CountingCheckpoints::default());
        let mut template = Template::new("ops");
        template.users = vec![UserConfig::new("ubuntu", &["sudo", "docker"])];
        let mut request = ApplyRequest::new("web-1", template);
        request.force = true;

        let response = f.orchestrator.apply(&request, &CancelToken::new()).unwrap();

        assert_eq!(response.users_created, 0);
        let users = f.mock.scripts_containing("User changes");
        assert_eq!(users.len(), 1);
        assert!(users[0].contains("usermod -G sudo,docker ubuntu"));
        assert!(!users[0].contains("usermod -a"));
    }

    #[test]
    fn test_converged_instance_takes_no_checkpoint() {
        let f = fixture(CountingCheckpoints::default());
        let mut template = Template::new("base");
        template.packages.system = vec!["git".to_string(), "nginx=1.18.0".to_string()];
        template.services = vec![ServiceConfig::new("nginx", Some(80))];
        template.users = vec![UserConfig::new("alice", &["sudo"])];

        let response = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", template), &CancelToken::new())
            .unwrap();

        assert_eq!(response.phase, Phase::Converged);
        assert_eq!(f.checkpoints.created.load(Ordering::SeqCst), 0);
        assert!(f.mock.scripts().is_empty());
    }

    #[test]
    fn test_request_override_replaces_template_manager() {
        let f = fixture(CountingCheckpoints::default());
        let mut template = Template::new("hpc");
        template.packages.spack = vec!["hdf5".to_string()];
        let mut request = ApplyRequest::new("web-1", template);
        request.package_manager = Some("spack".to_string());
        request.dry_run = true;

        let response = f.orchestrator.apply(&request, &CancelToken::new()).unwrap();
        let plan = response.plan.unwrap();
        assert_eq!(plan.packages_to_install[0].name, "hdf5");
        assert_eq!(response.warnings, vec!["1 conflicts found"]);
    }

    #[test]
    fn test_invalid_requests_touch_nothing() {
        let f = fixture(CountingCheckpoints::default());

        let err = f
            .orchestrator
            .apply(&ApplyRequest::new(" ", web_template()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", Template::default()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(f.mock.calls().is_empty());
    }

    #[test]
    fn test_busy_instance_is_rejected() {
        let f = fixture(CountingCheckpoints::default());
        let _held = f.orchestrator.leases.acquire("web-1").unwrap();

        let err = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", web_template()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InstanceBusy { .. }));
        assert!(f.mock.calls().is_empty());
    }

    #[test]
    fn test_unreachable_instance_fails_inspection() {
        let f = fixture(CountingCheckpoints::default());
        f.mock.unreachable("true");

        let err = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", web_template()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InspectionFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancelled_before_start() {
        let f = fixture(CountingCheckpoints::default());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", web_template()), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { phase: Phase::Validated }));
        assert!(f.mock.calls().is_empty());
    }

    #[test]
    fn test_history_write_failure_is_a_warning() {
        let f = fixture(CountingCheckpoints::default());
        f.mock.fail("applied-templates.json.tmp", 1, "Read-only file system");

        let response = f
            .orchestrator
            .apply(&ApplyRequest::new("web-1", web_template()), &CancelToken::new())
            .unwrap();

        assert!(response.success);
        assert_eq!(response.phase, Phase::Applied);
        assert!(response.warnings.iter().any(|w| w.contains("Read-only file system")));
    }

    #[test]
    fn test_manual_rollback_of_unknown_checkpoint_is_untouched() {
        let leases = TempDir::new().unwrap();
        let mock = Arc::new(ubuntu_host());
        let orchestrator = Orchestrator::new(mock, LeaseDir::new(leases.path()));

        let err = orchestrator
            .rollback("web-1", "checkpoint-missing", &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Rollback { .. }));
        assert_eq!(err.impact(), Impact::Untouched);
    }

    #[test]
    fn test_history_is_loaded() {
        let f = fixture(CountingCheckpoints::default());
        assert!(f.orchestrator.history("web-1", &CancelToken::new()).unwrap().is_empty());
        assert!(f.orchestrator.checkpoints("web-1", &CancelToken::new()).unwrap().is_empty());
    }
}
