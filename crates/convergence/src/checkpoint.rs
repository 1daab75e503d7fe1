//! Checkpoints and rollback
//!
//! A checkpoint is a JSON snapshot of the inspected packages, services and
//! users plus copies of a few critical files, stored on the instance. Rollback
//! re-inspects and reverses the difference, category by category, in the
//! reverse of apply order. A category is only reversed when both the
//! snapshot and the re-inspection read it in full. A checkpoint is marked
//! restored once a rollback to it completes; an incomplete one can be rerun.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::CheckpointError;
use crate::inspector::StateInspector;
use crate::manager::backend_for;
use crate::remote::{CancelToken, ExecutionResult, RemoteExecutor};
use crate::script::{quote, write_file_script};
use crate::types::{
    Coverage, ExistingUser, InstalledPackage, InstanceState, PackageManager, RunningService,
};

/// Where checkpoints live on an instance
pub const CHECKPOINT_DIR: &str = "/var/lib/converge/checkpoints";

/// Files copied aside when a checkpoint is created
pub const BACKUP_FILES: &[&str] = &["/etc/sudoers", "/etc/environment", "/etc/apt/sources.list"];

/// Handle to a stored checkpoint, bound to one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub instance: String,
}

impl Checkpoint {
    pub fn new(id: &str, instance: &str) -> Self {
        Self {
            id: id.to_string(),
            instance: instance.to_string(),
        }
    }

    /// A fresh checkpoint id for `instance`
    pub fn generate(instance: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "checkpoint-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &suffix[..8]
        );
        Self::new(&id, instance)
    }
}

/// A backed-up file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub original_path: String,
    pub backup_path: String,
}

/// Everything stored for a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub instance: String,
    pub created_at: DateTime<Utc>,
    pub packages: Vec<InstalledPackage>,
    pub services: Vec<RunningService>,
    pub users: Vec<ExistingUser>,
    #[serde(default)]
    pub files: Vec<BackupFile>,
    /// Categories the snapshot read in full; missing means none
    #[serde(default)]
    pub coverage: Coverage,
    /// Set when listed and the checkpoint has been restored
    #[serde(default, skip_serializing)]
    pub restored: bool,
}

impl CheckpointRecord {
    fn from_state(checkpoint: &Checkpoint, state: InstanceState, files: Vec<BackupFile>) -> Self {
        Self {
            id: checkpoint.id.clone(),
            instance: checkpoint.instance.clone(),
            created_at: Utc::now(),
            packages: state.packages,
            services: state.services,
            users: state.users,
            files,
            coverage: state.coverage,
            restored: false,
        }
    }
}

/// Result of reversing one category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryOutcome {
    /// Nothing differed from the snapshot
    #[default]
    Unchanged,
    Reverted,
    Failed(String),
}

impl CategoryOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Per-category outcome of a rollback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub packages: CategoryOutcome,
    pub services: CategoryOutcome,
    pub users: CategoryOutcome,
    pub files: CategoryOutcome,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.categories().iter().all(|(_, o)| !o.is_failed())
    }

    pub fn categories(&self) -> [(&'static str, &CategoryOutcome); 4] {
        [
            ("packages", &self.packages),
            ("services", &self.services),
            ("users", &self.users),
            ("files", &self.files),
        ]
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self
            .categories()
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                CategoryOutcome::Failed(why) => Some(format!("{name}: {why}")),
                _ => None,
            })
            .collect();
        if failures.is_empty() {
            write!(f, "all categories restored")
        } else {
            write!(f, "{}", failures.join("; "))
        }
    }
}

/// Creates and restores checkpoints.
pub trait CheckpointManager: Send + Sync {
    /// Snapshot `instance` before it is changed
    fn create_checkpoint(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Checkpoint, CheckpointError>;

    /// Restore `instance` to `checkpoint`, best effort per category
    fn rollback_to_checkpoint(
        &self,
        instance: &str,
        checkpoint: &Checkpoint,
        cancel: &CancelToken,
    ) -> Result<RollbackReport, CheckpointError>;

    /// Checkpoints stored on `instance`, oldest first
    fn list_checkpoints(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError>;
}

/// Checkpoints stored as JSON files on the instance
#[derive(Clone)]
pub struct RemoteCheckpointManager {
    executor: Arc<dyn RemoteExecutor>,
    inspector: StateInspector,
    dir: String,
}

impl RemoteCheckpointManager {
    pub fn new(executor: Arc<dyn RemoteExecutor>, inspector: StateInspector) -> Self {
        Self {
            executor,
            inspector,
            dir: CHECKPOINT_DIR.to_string(),
        }
    }

    fn record_path(&self, id: &str) -> String {
        format!("{}/{id}.json", self.dir)
    }

    fn marker_path(&self, id: &str) -> String {
        format!("{}/{id}.restored", self.dir)
    }

    fn backup_dir(&self, id: &str) -> String {
        format!("{}/{id}", self.dir)
    }

    fn run(
        &self,
        instance: &str,
        action: &'static str,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, CheckpointError> {
        self.executor
            .execute(instance, command, cancel)
            .map_err(|source| CheckpointError::Transport { action, source })
    }

    fn run_script(
        &self,
        instance: &str,
        action: &'static str,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, CheckpointError> {
        self.executor
            .execute_script(instance, script, cancel)
            .map_err(|source| CheckpointError::Transport { action, source })
    }

    /// Copy critical files aside; failures here only shrink the backup set
    fn backup_files(
        &self,
        instance: &str,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<BackupFile>, CheckpointError> {
        let dir = self.backup_dir(id);
        let files = BACKUP_FILES
            .iter()
            .map(|f| quote(f))
            .collect::<Vec<_>>()
            .join(" ");
        let script = format!(
            "#!/bin/bash\nset -u\n\ndir={dir}\nmkdir -p \"$dir\"\nfor f in {files}; do\n    if [ -f \"$f\" ]; then\n        mkdir -p \"$dir$(dirname \"$f\")\" && cp -p \"$f\" \"$dir$f\" && echo \"$f\"\n    fi\ndone\n",
            dir = quote(&dir),
        );

        let result = self.run_script(instance, "back up files", &script, cancel)?;
        if !result.success() {
            log::warn!(
                "{instance}: file backup for {id} failed: {}",
                result.error_output()
            );
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with('/'))
            .map(|path| BackupFile {
                original_path: path.to_string(),
                backup_path: format!("{dir}{path}"),
            })
            .collect())
    }

    fn load_record(
        &self,
        instance: &str,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let command = format!("cat {}", quote(&self.record_path(id)));
        let result = self.run(instance, "read checkpoint", &command, cancel)?;
        if !result.success() {
            return Err(CheckpointError::NotFound {
                id: id.to_string(),
                instance: instance.to_string(),
            });
        }
        serde_json::from_str(&result.stdout).map_err(|source| CheckpointError::Corrupt {
            id: id.to_string(),
            source,
        })
    }

    /// Fails if a rollback to `id` already completed
    fn ensure_unrestored(
        &self,
        instance: &str,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<(), CheckpointError> {
        let marker = quote(&self.marker_path(id));
        let check = self.run(instance, "check checkpoint marker", &format!("test -e {marker}"), cancel)?;
        if check.success() {
            return Err(CheckpointError::AlreadyRestored { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a completed rollback; the restore already happened, so
    /// failing to write the marker is only logged
    fn mark_restored(&self, instance: &str, id: &str, cancel: &CancelToken) {
        let command = format!("touch {}", quote(&self.marker_path(id)));
        match self.run(instance, "mark checkpoint restored", &command, cancel) {
            Ok(result) if result.success() => {}
            Ok(result) => log::warn!(
                "{instance}: could not mark {id} restored: {}",
                result.error_output()
            ),
            Err(e) => log::warn!("{instance}: could not mark {id} restored: {e}"),
        }
    }

    /// A category that cannot be compared is reported, never reversed
    fn skip_category(instance: &str, category: &'static str, why: String) -> CategoryOutcome {
        log::error!("{instance}: not restoring {category}: {why}");
        CategoryOutcome::Failed(why)
    }

    /// Run one best-effort category script and classify the result
    fn restore_category(
        &self,
        instance: &str,
        category: &'static str,
        script: Option<String>,
        cancel: &CancelToken,
    ) -> CategoryOutcome {
        let Some(script) = script else {
            return CategoryOutcome::Unchanged;
        };
        match self.executor.execute_script(instance, &script, cancel) {
            Ok(result) if result.success() => {
                log::info!("{instance}: restored {category}");
                CategoryOutcome::Reverted
            }
            Ok(result) => {
                let why = format!("exit code {}: {}", result.exit_code, result.error_output());
                log::error!("{instance}: failed to restore {category}: {why}");
                CategoryOutcome::Failed(why)
            }
            Err(e) => {
                log::error!("{instance}: failed to restore {category}: {e}");
                CategoryOutcome::Failed(e.to_string())
            }
        }
    }
}

impl CheckpointManager for RemoteCheckpointManager {
    fn create_checkpoint(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Checkpoint, CheckpointError> {
        let state = self
            .inspector
            .observe(instance, cancel)
            .map_err(CheckpointError::Inspection)?;

        let checkpoint = Checkpoint::generate(instance);
        let unread = uncovered(&state.coverage);
        if !unread.is_empty() {
            log::warn!(
                "{instance}: checkpoint {} could not read {}; those will not be rolled back",
                checkpoint.id,
                unread.join(", ")
            );
        }
        let files = self.backup_files(instance, &checkpoint.id, cancel)?;
        let record = CheckpointRecord::from_state(&checkpoint, state, files);

        let contents = serde_json::to_string_pretty(&record)?;
        let script = write_file_script(&self.record_path(&checkpoint.id), &contents);
        let result = self.run_script(instance, "write checkpoint", &script, cancel)?;
        if !result.success() {
            return Err(CheckpointError::Command {
                action: "write checkpoint",
                exit_code: result.exit_code,
                stderr: result.error_output(),
            });
        }

        log::info!(
            "Created checkpoint {} on {instance} ({} packages, {} services, {} users, {} files)",
            checkpoint.id,
            record.packages.len(),
            record.services.len(),
            record.users.len(),
            record.files.len()
        );
        Ok(checkpoint)
    }

    fn rollback_to_checkpoint(
        &self,
        instance: &str,
        checkpoint: &Checkpoint,
        cancel: &CancelToken,
    ) -> Result<RollbackReport, CheckpointError> {
        if checkpoint.instance != instance {
            return Err(CheckpointError::WrongInstance {
                id: checkpoint.id.clone(),
                owner: checkpoint.instance.clone(),
                instance: instance.to_string(),
            });
        }

        let record = self.load_record(instance, &checkpoint.id, cancel)?;
        if record.instance != instance {
            return Err(CheckpointError::WrongInstance {
                id: record.id,
                owner: record.instance,
                instance: instance.to_string(),
            });
        }
        self.ensure_unrestored(instance, &checkpoint.id, cancel)?;

        log::info!("Rolling back {instance} to {}", checkpoint.id);
        let current = self
            .inspector
            .observe(instance, cancel)
            .map_err(CheckpointError::Inspection)?;
        let (then, now) = (&record.coverage, &current.coverage);

        let users = match coverage_gap("users", then.users, now.users) {
            Some(why) => Self::skip_category(instance, "users", why),
            None => self.restore_category(instance, "users", users_script(&record, &current), cancel),
        };
        let services = match coverage_gap("services", then.services, now.services) {
            Some(why) => Self::skip_category(instance, "services", why),
            None => self.restore_category(
                instance,
                "services",
                services_script(&record, &current),
                cancel,
            ),
        };
        let comparable: BTreeSet<PackageManager> = then
            .package_managers
            .intersection(&now.package_managers)
            .copied()
            .collect();
        let packages = match (
            self.restore_category(
                instance,
                "packages",
                packages_script(&record, &current, &comparable),
                cancel,
            ),
            package_gap(then, now),
        ) {
            (failed @ CategoryOutcome::Failed(_), _) => failed,
            (_, Some(why)) => Self::skip_category(instance, "packages", why),
            (outcome, None) => outcome,
        };

        let report = RollbackReport {
            packages,
            services,
            users,
            files: self.restore_category(instance, "files", files_script(&record), cancel),
        };

        if report.is_complete() {
            self.mark_restored(instance, &checkpoint.id, cancel);
            log::info!("Rolled back {instance} to {}", checkpoint.id);
        } else {
            log::error!("Rollback of {instance} to {} incomplete: {report}", checkpoint.id);
        }
        Ok(report)
    }

    fn list_checkpoints(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let command = format!("ls -1 {} 2>/dev/null", quote(&self.dir));
        let listing = self.run(instance, "list checkpoints", &command, cancel)?;
        if !listing.success() {
            return Ok(Vec::new());
        }

        let names: Vec<&str> = listing.stdout.lines().map(str::trim).collect();
        let mut records = Vec::new();
        for name in &names {
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.load_record(instance, id, cancel) {
                Ok(mut record) => {
                    let marker = format!("{id}.restored");
                    record.restored = names.contains(&marker.as_str());
                    records.push(record);
                }
                Err(CheckpointError::Transport { action, source }) => {
                    return Err(CheckpointError::Transport { action, source });
                }
                Err(e) => log::warn!("{instance}: skipping checkpoint {id}: {e}"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

// ============================================================================
// Restore scripts
// ============================================================================
//
// Each script keeps going after a failed step and exits non-zero at the end
// if anything failed, so one bad package does not block the rest.

fn restore_header(title: &str) -> String {
    format!("#!/bin/bash\nset -u\nstatus=0\n\n# {title}\n")
}

fn step(script: &mut String, command: &str) {
    let _ = writeln!(script, "{command} || status=1");
}

fn finish(mut script: String, steps: usize) -> Option<String> {
    if steps == 0 {
        return None;
    }
    script.push_str("exit $status\n");
    Some(script)
}

/// Names of the categories `coverage` is missing
fn uncovered(coverage: &Coverage) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !coverage.users {
        missing.push("users");
    }
    if !coverage.services {
        missing.push("services");
    }
    missing
}

fn coverage_gap(category: &str, then: bool, now: bool) -> Option<String> {
    match (then, now) {
        (true, true) => None,
        (false, _) => Some(format!("{category} were not fully captured in the checkpoint")),
        (true, false) => Some(format!("{category} could not be fully inspected for rollback")),
    }
}

/// Managers listed at only one of the two inspections
fn package_gap(then: &Coverage, now: &Coverage) -> Option<String> {
    let one_sided: Vec<String> = then
        .package_managers
        .symmetric_difference(&now.package_managers)
        .map(ToString::to_string)
        .collect();
    (!one_sided.is_empty()).then(|| {
        format!(
            "{} packages were not listed both in the checkpoint and for rollback",
            one_sided.join(", ")
        )
    })
}

fn packages_script(
    record: &CheckpointRecord,
    current: &InstanceState,
    comparable: &BTreeSet<PackageManager>,
) -> Option<String> {
    let mut script = restore_header("Restore packages");
    let mut steps = 0;

    let in_snapshot = |pkg: &InstalledPackage| {
        record
            .packages
            .iter()
            .find(|p| p.name == pkg.name && p.package_manager == pkg.package_manager)
    };

    for pkg in &current.packages {
        if !comparable.contains(&pkg.package_manager) {
            continue;
        }
        let Some(backend) = backend_for(pkg.package_manager) else {
            continue;
        };
        match in_snapshot(pkg) {
            None => {
                step(&mut script, &backend.remove_fragment(&pkg.name));
                steps += 1;
            }
            Some(old) if old.version != pkg.version => {
                step(&mut script, &backend.install_fragment(&old.name, Some(&old.version)));
                steps += 1;
            }
            Some(_) => {}
        }
    }
    finish(script, steps)
}

fn services_script(record: &CheckpointRecord, current: &InstanceState) -> Option<String> {
    let mut script = restore_header("Restore services");
    let mut steps = 0;

    for now in &current.services {
        let name = quote(&now.name);
        match record.services.iter().find(|s| s.name == now.name) {
            None => {
                step(&mut script, &format!("systemctl stop {name}"));
                step(&mut script, &format!("systemctl disable {name}"));
                steps += 2;
            }
            Some(then) => {
                if then.enabled != now.enabled {
                    let verb = if then.enabled { "enable" } else { "disable" };
                    step(&mut script, &format!("systemctl {verb} {name}"));
                    steps += 1;
                }
                if then.is_running() != now.is_running() {
                    let verb = if then.is_running() { "start" } else { "stop" };
                    step(&mut script, &format!("systemctl {verb} {name}"));
                    steps += 1;
                }
            }
        }
    }
    finish(script, steps)
}

fn users_script(record: &CheckpointRecord, current: &InstanceState) -> Option<String> {
    let mut script = restore_header("Restore users");
    let mut steps = 0;

    for now in &current.users {
        let name = quote(&now.name);
        match record.users.iter().find(|u| u.name == now.name) {
            None => {
                step(&mut script, &format!("userdel -r {name}"));
                steps += 1;
            }
            Some(then) => {
                let mut a: Vec<_> = then.groups.iter().collect();
                let mut b: Vec<_> = now.groups.iter().collect();
                a.sort();
                b.sort();
                if a != b {
                    step(
                        &mut script,
                        &format!("usermod -G {} {name}", quote(&then.groups.join(","))),
                    );
                    steps += 1;
                }
            }
        }
    }
    finish(script, steps)
}

fn files_script(record: &CheckpointRecord) -> Option<String> {
    let mut script = restore_header("Restore files");
    for file in &record.files {
        step(
            &mut script,
            &format!("cp -p {} {}", quote(&file.backup_path), quote(&file.original_path)),
        );
    }
    finish(script, record.files.len())
}
