//! Diff calculation between observed state and a template
//!
//! [`compute_diff`] is a pure function: the same state and template always
//! yield the same diff, in template declaration order. Nothing here talks
//! to an instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{ParseManagerError, Result};
use crate::types::{
    InstanceState, PackageManager, PasswordPolicy, ServiceStatus, Template,
};

// ============================================================================
// Diff types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    Install,
    Upgrade,
    Remove,
}

impl fmt::Display for PackageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// A package change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDiff {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_version: String,
    /// Empty when the template does not pin a version
    pub target_version: String,
    pub action: PackageAction,
    pub package_manager: PackageManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    /// Enable and start a service not yet present
    Configure,
    Start,
    Restart,
    Stop,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configure => write!(f, "configure"),
            Self::Start => write!(f, "start"),
            Self::Restart => write!(f, "restart"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// A service change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiff {
    pub name: String,
    #[serde(default)]
    pub current_status: Option<ServiceStatus>,
    pub target_status: ServiceStatus,
    pub action: ServiceAction,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    Create,
    Modify,
}

/// A user change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDiff {
    pub name: String,
    #[serde(default)]
    pub current_groups: Vec<String>,
    pub target_groups: Vec<String>,
    pub action: UserAction,
    pub shell: String,
    pub password: PasswordPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    PackageManager,
    Port,
    User,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PackageManager => write!(f, "package_manager"),
            Self::Port => write!(f, "port"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Suggested way to get past a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Force,
    Skip,
    Merge,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Force => write!(f, "force"),
            Self::Skip => write!(f, "skip"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Something about the template that clashes with what is on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDiff {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub description: String,
    pub resolution: Resolution,
}

/// Changes needed to bring an instance to a template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDiff {
    pub packages_to_install: Vec<PackageDiff>,
    pub packages_to_remove: Vec<PackageDiff>,
    pub services_to_configure: Vec<ServiceDiff>,
    pub services_to_stop: Vec<ServiceDiff>,
    pub users_to_create: Vec<UserDiff>,
    pub users_to_modify: Vec<UserDiff>,
    pub ports_to_open: Vec<u16>,
    pub conflicts: Vec<ConflictDiff>,
    /// Manager the package entries were planned for
    pub package_manager: PackageManager,
}

impl TemplateDiff {
    /// True if applying would change anything (conflicts alone don't count)
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    pub fn total_changes(&self) -> usize {
        self.packages_to_install.len()
            + self.packages_to_remove.len()
            + self.services_to_configure.len()
            + self.services_to_stop.len()
            + self.users_to_create.len()
            + self.users_to_modify.len()
            + self.ports_to_open.len()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Human-readable summary, e.g. "3 packages to install, 1 user to modify"
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            (self.packages_to_install.len(), "package", "to install"),
            (self.packages_to_remove.len(), "package", "to remove"),
            (self.services_to_configure.len(), "service", "to configure"),
            (self.services_to_stop.len(), "service", "to stop"),
            (self.users_to_create.len(), "user", "to create"),
            (self.users_to_modify.len(), "user", "to modify"),
            (self.ports_to_open.len(), "port", "to open"),
            (self.conflicts.len(), "conflict", "found"),
        ]
        .into_iter()
        .filter(|(n, _, _)| *n > 0)
        .map(|(n, noun, what)| format!("{n} {noun}{} {what}", if n == 1 { "" } else { "s" }))
        .collect();

        if parts.is_empty() {
            "No changes needed".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ============================================================================
// Calculation
// ============================================================================

/// Compute what it takes to move `state` to `template`.
///
/// Fails only when the effective package manager has no package set.
pub fn compute_diff(state: &InstanceState, template: &Template) -> Result<TemplateDiff> {
    let manager = effective_manager(state, template)?;
    let mut diff = TemplateDiff {
        package_manager: manager,
        ..Default::default()
    };

    diff_packages(state, template, manager, &mut diff)?;
    diff_services(state, template, &mut diff);
    diff_users(state, template, &mut diff);
    diff_ports(state, template, &mut diff);
    detect_conflicts(state, template, &mut diff);

    Ok(diff)
}

fn effective_manager(state: &InstanceState, template: &Template) -> Result<PackageManager> {
    match template.manager_override() {
        Some(name) => Ok(name.parse()?),
        None => Ok(state.package_manager),
    }
}

/// Declared package specs for `manager`, each tagged with the manager it installs through
fn declared_packages(
    template: &Template,
    manager: PackageManager,
) -> std::result::Result<Vec<(&str, PackageManager)>, ParseManagerError> {
    match manager {
        PackageManager::Apt | PackageManager::Dnf => Ok(tag(&template.packages.system, manager)),
        PackageManager::Conda => {
            let mut specs = tag(&template.packages.conda, PackageManager::Conda);
            specs.extend(tag(&template.packages.pip, PackageManager::Pip));
            Ok(specs)
        }
        PackageManager::Spack => Ok(tag(&template.packages.spack, PackageManager::Spack)),
        PackageManager::Ami => Ok(Vec::new()),
        PackageManager::Pip | PackageManager::Unknown => {
            Err(ParseManagerError(manager.to_string()))
        }
    }
}

fn tag(specs: &[String], manager: PackageManager) -> Vec<(&str, PackageManager)> {
    specs.iter().map(|s| (s.as_str(), manager)).collect()
}

/// Split "name=1.2" / "name>=1.2" into a base name and an exact pinned version.
///
/// Only `=` and `==` pin; range operators leave the version unpinned.
pub fn parse_package_spec(spec: &str) -> (&str, Option<&str>) {
    let spec = spec.trim();
    match spec.find(['=', '>', '<']) {
        None => (spec, None),
        Some(idx) => {
            let name = spec[..idx].trim();
            let rest = &spec[idx..];
            let version = rest
                .strip_prefix('=')
                .map(|v| v.trim_start_matches('=').trim())
                .filter(|v| !v.is_empty());
            (name, version)
        }
    }
}

fn diff_packages(
    state: &InstanceState,
    template: &Template,
    manager: PackageManager,
    diff: &mut TemplateDiff,
) -> Result<()> {
    for (spec, pkg_manager) in declared_packages(template, manager)? {
        let (name, version) = parse_package_spec(spec);
        if name.is_empty() {
            continue;
        }
        match state.package_for(name, pkg_manager) {
            None => diff.packages_to_install.push(PackageDiff {
                name: name.to_string(),
                current_version: String::new(),
                target_version: version.unwrap_or_default().to_string(),
                action: PackageAction::Install,
                package_manager: pkg_manager,
            }),
            Some(installed) => {
                if let Some(target) = version.filter(|v| *v != installed.version) {
                    diff.packages_to_install.push(PackageDiff {
                        name: name.to_string(),
                        current_version: installed.version.clone(),
                        target_version: target.to_string(),
                        action: PackageAction::Upgrade,
                        package_manager: pkg_manager,
                    });
                }
            }
        }
    }
    Ok(())
}

fn diff_services(state: &InstanceState, template: &Template, diff: &mut TemplateDiff) {
    for svc in &template.services {
        match state.service(&svc.name) {
            None => diff.services_to_configure.push(ServiceDiff {
                name: svc.name.clone(),
                current_status: None,
                target_status: ServiceStatus::Running,
                action: ServiceAction::Configure,
                port: svc.declared_port(),
            }),
            Some(current) if svc.enable && !current.is_running() => {
                diff.services_to_configure.push(ServiceDiff {
                    name: svc.name.clone(),
                    current_status: Some(current.status),
                    target_status: ServiceStatus::Running,
                    action: ServiceAction::Start,
                    port: svc.declared_port(),
                });
            }
            Some(_) => {}
        }
    }
}

fn same_groups(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

fn diff_users(state: &InstanceState, template: &Template, diff: &mut TemplateDiff) {
    for user in &template.users {
        match state.user(&user.name) {
            None => diff.users_to_create.push(UserDiff {
                name: user.name.clone(),
                current_groups: Vec::new(),
                target_groups: user.groups.clone(),
                action: UserAction::Create,
                shell: user.shell_or_default().to_string(),
                password: user.password,
            }),
            Some(existing) if !same_groups(&existing.groups, &user.groups) => {
                diff.users_to_modify.push(UserDiff {
                    name: user.name.clone(),
                    current_groups: existing.groups.clone(),
                    target_groups: user.groups.clone(),
                    action: UserAction::Modify,
                    shell: existing.shell.clone(),
                    password: user.password,
                });
            }
            Some(_) => {}
        }
    }
}

fn diff_ports(state: &InstanceState, template: &Template, diff: &mut TemplateDiff) {
    let declared = template
        .services
        .iter()
        .filter_map(|s| s.declared_port())
        .chain(template.instance_defaults.ports.iter().copied().filter(|p| *p > 0));

    let mut seen = BTreeSet::new();
    for port in declared {
        if !state.has_port(port) && seen.insert(port) {
            diff.ports_to_open.push(port);
        }
    }
}

fn detect_conflicts(state: &InstanceState, template: &Template, diff: &mut TemplateDiff) {
    // Nothing to disagree with when detection found no manager
    if let Some(name) = template.manager_override()
        && state.package_manager != PackageManager::Unknown
        && name.parse::<PackageManager>().ok() != Some(state.package_manager)
    {
        diff.conflicts.push(ConflictDiff {
            kind: ConflictKind::PackageManager,
            description: format!(
                "Template requires {name} but instance uses {}",
                state.package_manager
            ),
            resolution: Resolution::Force,
        });
    }

    for svc in &template.services {
        let Some(port) = svc.declared_port() else {
            continue;
        };
        if !state.has_port(port) {
            continue;
        }
        let owned_by_same = state
            .service(&svc.name)
            .is_some_and(|s| s.port == Some(port));
        if owned_by_same {
            continue;
        }
        let description = match state.services.iter().find(|s| s.port == Some(port)) {
            Some(other) => format!(
                "Port {port} for service {} is already bound to {}",
                svc.name, other.name
            ),
            None => format!("Port {port} for service {} is already in use", svc.name),
        };
        diff.conflicts.push(ConflictDiff {
            kind: ConflictKind::Port,
            description,
            resolution: Resolution::Skip,
        });
    }

    for user in &template.users {
        if let Some(existing) = state.user(&user.name)
            && !same_groups(&existing.groups, &user.groups)
        {
            diff.conflicts.push(ConflictDiff {
                kind: ConflictKind::User,
                description: format!("User {} exists with different group membership", user.name),
                resolution: Resolution::Merge,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{
        ExistingUser, InstalledPackage, RunningService, ServiceConfig, UserConfig,
    };

    fn apt_state() -> InstanceState {
        InstanceState {
            packages: vec![InstalledPackage::new("git", "2.30", PackageManager::Apt)],
            package_manager: PackageManager::Apt,
            ..Default::default()
        }
    }

    fn template_with_system(packages: &[&str]) -> Template {
        let mut template = Template::new("dev");
        template.packages.system = packages.iter().map(ToString::to_string).collect();
        template
    }

    #[test]
    fn test_pinned_version_mismatch_upgrades_and_missing_installs() {
        let diff = compute_diff(&apt_state(), &template_with_system(&["git=2.40", "curl"])).unwrap();

        assert_eq!(diff.packages_to_install.len(), 2);
        let git = &diff.packages_to_install[0];
        assert_eq!(git.name, "git");
        assert_eq!(git.current_version, "2.30");
        assert_eq!(git.target_version, "2.40");
        assert_eq!(git.action, PackageAction::Upgrade);

        let curl = &diff.packages_to_install[1];
        assert_eq!(curl.name, "curl");
        assert_eq!(curl.target_version, "");
        assert_eq!(curl.action, PackageAction::Install);
    }

    #[test]
    fn test_present_package_without_pin_is_left_alone() {
        let diff = compute_diff(&apt_state(), &template_with_system(&["git", "git=2.30"])).unwrap();
        assert!(diff.packages_to_install.is_empty());
        assert!(!diff.has_changes());
        assert_eq!(diff.summary(), "No changes needed");
    }

    #[test]
    fn test_parse_package_spec() {
        assert_eq!(parse_package_spec("git=2.40"), ("git", Some("2.40")));
        assert_eq!(parse_package_spec("flask==3.0"), ("flask", Some("3.0")));
        assert_eq!(parse_package_spec("numpy>=1.2"), ("numpy", None));
        assert_eq!(parse_package_spec("scipy<2"), ("scipy", None));
        assert_eq!(parse_package_spec(" curl "), ("curl", None));
        assert_eq!(parse_package_spec("vim="), ("vim", None));
    }

    #[test]
    fn test_conda_includes_pip_packages() {
        let state = InstanceState {
            package_manager: PackageManager::Conda,
            packages: vec![InstalledPackage::new("numpy", "1.26", PackageManager::Conda)],
            ..Default::default()
        };
        let mut template = Template::new("ml");
        template.packages.conda = vec!["numpy".to_string()];
        template.packages.pip = vec!["torch==2.1".to_string()];
        template.packages.system = vec!["ignored".to_string()];

        let diff = compute_diff(&state, &template).unwrap();
        assert_eq!(diff.packages_to_install.len(), 1);
        assert_eq!(diff.packages_to_install[0].name, "torch");
        assert_eq!(diff.packages_to_install[0].package_manager, PackageManager::Pip);
        assert_eq!(diff.packages_to_install[0].target_version, "2.1");
    }

    #[test]
    fn test_ami_plans_no_packages() {
        let state = InstanceState {
            package_manager: PackageManager::Ami,
            ..Default::default()
        };
        let diff = compute_diff(&state, &template_with_system(&["git"])).unwrap();
        assert!(diff.packages_to_install.is_empty());
    }

    #[test]
    fn test_unknown_manager_fails_planning() {
        let state = InstanceState::default();
        let err = compute_diff(&state, &template_with_system(&["git"])).unwrap_err();
        assert!(matches!(err, Error::PlanningFailed(_)));
    }

    #[test]
    fn test_unparseable_override_fails_planning() {
        let mut template = template_with_system(&["git"]);
        template.package_manager = Some("brew".to_string());
        let err = compute_diff(&apt_state(), &template).unwrap_err();
        assert!(err.to_string().contains("brew"));
    }

    #[test]
    fn test_override_plans_for_requested_manager_and_conflicts() {
        let mut template = Template::new("hpc");
        template.package_manager = Some("spack".to_string());
        template.packages.spack = vec!["hdf5@1.14".to_string()];

        let diff = compute_diff(&apt_state(), &template).unwrap();
        assert_eq!(diff.package_manager, PackageManager::Spack);
        assert_eq!(diff.packages_to_install[0].package_manager, PackageManager::Spack);
        assert_eq!(diff.conflicts.len(), 1);
        assert_eq!(diff.conflicts[0].kind, ConflictKind::PackageManager);
        assert_eq!(diff.conflicts[0].resolution, Resolution::Force);
    }

    #[test]
    fn test_matching_override_is_not_a_conflict() {
        let mut template = template_with_system(&[]);
        template.package_manager = Some("APT".to_string());
        let diff = compute_diff(&apt_state(), &template).unwrap();
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn test_override_on_undetected_manager_is_not_a_conflict() {
        let mut template = Template::new("hpc");
        template.package_manager = Some("spack".to_string());
        template.packages.spack = vec!["hdf5".to_string()];

        let diff = compute_diff(&InstanceState::default(), &template).unwrap();
        assert_eq!(diff.package_manager, PackageManager::Spack);
        assert_eq!(diff.packages_to_install.len(), 1);
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn test_services_absent_configure_and_stopped_start() {
        let mut state = apt_state();
        state.services = vec![
            RunningService {
                name: "redis".to_string(),
                status: ServiceStatus::Stopped,
                port: None,
                enabled: false,
            },
            RunningService {
                name: "cron".to_string(),
                status: ServiceStatus::Failed,
                port: None,
                enabled: true,
            },
        ];
        let mut template = Template::new("svc");
        let mut disabled = ServiceConfig::new("cron", None);
        disabled.enable = false;
        template.services = vec![
            ServiceConfig::new("nginx", Some(80)),
            ServiceConfig::new("redis", Some(6379)),
            disabled,
        ];

        let diff = compute_diff(&state, &template).unwrap();
        assert_eq!(diff.services_to_configure.len(), 2);
        assert_eq!(diff.services_to_configure[0].action, ServiceAction::Configure);
        assert_eq!(diff.services_to_configure[0].current_status, None);
        assert_eq!(diff.services_to_configure[1].action, ServiceAction::Start);
        assert_eq!(diff.services_to_configure[1].current_status, Some(ServiceStatus::Stopped));
        assert!(diff.services_to_stop.is_empty());
    }

    #[test]
    fn test_user_group_change_is_modify_and_merge_conflict() {
        let mut state = apt_state();
        state.users = vec![ExistingUser {
            name: "alice".to_string(),
            groups: vec!["sudo".to_string()],
            shell: "/bin/zsh".to_string(),
        }];
        let mut template = Template::new("users");
        template.users = vec![
            UserConfig::new("alice", &["sudo", "docker"]),
            UserConfig::new("bob", &[]),
        ];

        let diff = compute_diff(&state, &template).unwrap();
        assert_eq!(diff.users_to_modify.len(), 1);
        let alice = &diff.users_to_modify[0];
        assert_eq!(alice.current_groups, vec!["sudo"]);
        assert_eq!(alice.target_groups, vec!["sudo", "docker"]);
        assert_eq!(alice.shell, "/bin/zsh");

        assert_eq!(diff.users_to_create.len(), 1);
        assert_eq!(diff.users_to_create[0].shell, "/bin/bash");

        assert_eq!(diff.conflicts.len(), 1);
        assert_eq!(diff.conflicts[0].resolution, Resolution::Merge);
    }

    #[test]
    fn test_inspected_groups_are_replaced_not_merged() {
        use crate::history::RemoteHistoryStore;
        use crate::inspector::StateInspector;
        use crate::remote::CancelToken;
        use crate::testing::ubuntu_host;
        use std::sync::Arc;

        let mock = Arc::new(ubuntu_host());
        let history = Arc::new(RemoteHistoryStore::new(mock.clone()));
        let state = StateInspector::new(mock, history)
            .inspect("web-1", &CancelToken::new())
            .unwrap();
        let mut template = Template::new("users");
        template.users = vec![UserConfig::new("ubuntu", &["sudo", "docker"])];

        let diff = compute_diff(&state, &template).unwrap();
        assert!(diff.users_to_create.is_empty());
        assert_eq!(diff.users_to_modify.len(), 1);
        let ubuntu = &diff.users_to_modify[0];
        assert_eq!(ubuntu.action, UserAction::Modify);
        assert_eq!(ubuntu.current_groups, vec!["adm", "sudo"]);
        assert_eq!(ubuntu.target_groups, vec!["sudo", "docker"]);
    }

    #[test]
    fn test_group_order_does_not_matter() {
        let mut state = apt_state();
        state.users = vec![ExistingUser {
            name: "alice".to_string(),
            groups: vec!["docker".to_string(), "sudo".to_string()],
            shell: "/bin/bash".to_string(),
        }];
        let mut template = Template::new("users");
        template.users = vec![UserConfig::new("alice", &["sudo", "docker"])];

        let diff = compute_diff(&state, &template).unwrap();
        assert!(!diff.has_changes());
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn test_port_held_by_other_service_conflicts_with_skip() {
        let mut state = apt_state();
        state.ports = BTreeSet::from([80]);
        state.services = vec![RunningService {
            name: "apache2".to_string(),
            status: ServiceStatus::Running,
            port: Some(80),
            enabled: true,
        }];
        let mut template = Template::new("web");
        template.services = vec![ServiceConfig::new("nginx", Some(80))];

        let diff = compute_diff(&state, &template).unwrap();
        assert_eq!(diff.conflicts.len(), 1);
        let conflict = &diff.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::Port);
        assert_eq!(conflict.resolution, Resolution::Skip);
        assert!(conflict.description.contains("apache2"));
        assert!(diff.ports_to_open.is_empty());
    }

    #[test]
    fn test_port_held_by_same_service_is_fine() {
        let mut state = apt_state();
        state.ports = BTreeSet::from([80]);
        state.services = vec![RunningService {
            name: "nginx".to_string(),
            status: ServiceStatus::Running,
            port: Some(80),
            enabled: true,
        }];
        let mut template = Template::new("web");
        template.services = vec![ServiceConfig::new("nginx", Some(80))];

        let diff = compute_diff(&state, &template).unwrap();
        assert!(diff.conflicts.is_empty());
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_ports_are_unioned_without_duplicates() {
        let mut state = apt_state();
        state.ports = BTreeSet::from([22]);
        let mut template = Template::new("web");
        template.services = vec![
            ServiceConfig::new("jupyter", Some(8888)),
            ServiceConfig::new("nginx", Some(80)),
        ];
        template.instance_defaults.ports = vec![22, 8888, 443, 0];

        let diff = compute_diff(&state, &template).unwrap();
        assert_eq!(diff.ports_to_open, vec![8888, 80, 443]);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let mut state = apt_state();
        state.ports = BTreeSet::from([80, 22]);
        let mut template = template_with_system(&["git=2.40", "curl", "vim"]);
        template.services = vec![ServiceConfig::new("nginx", Some(80))];
        template.users = vec![UserConfig::new("alice", &["sudo"])];
        template.instance_defaults.ports = vec![443, 8080];

        let first = compute_diff(&state, &template).unwrap();
        for _ in 0..5 {
            assert_eq!(compute_diff(&state, &template).unwrap(), first);
        }
    }

    #[test]
    fn test_converged_state_has_no_changes() {
        let mut template = template_with_system(&["git=2.40", "curl"]);
        template.services = vec![ServiceConfig::new("nginx", Some(80))];
        template.users = vec![UserConfig::new("alice", &["sudo", "docker"])];
        template.instance_defaults.ports = vec![443];

        let state = InstanceState {
            packages: vec![
                InstalledPackage::new("git", "2.40", PackageManager::Apt),
                InstalledPackage::new("curl", "7.81.0", PackageManager::Apt),
            ],
            services: vec![RunningService {
                name: "nginx".to_string(),
                status: ServiceStatus::Running,
                port: Some(80),
                enabled: true,
            }],
            users: vec![ExistingUser {
                name: "alice".to_string(),
                groups: vec!["docker".to_string(), "sudo".to_string()],
                shell: "/bin/bash".to_string(),
            }],
            ports: BTreeSet::from([80, 443]),
            package_manager: PackageManager::Apt,
            ..Default::default()
        };

        let diff = compute_diff(&state, &template).unwrap();
        assert!(!diff.has_changes());
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn test_summary_counts() {
        let diff = compute_diff(&apt_state(), &template_with_system(&["git=2.40", "curl", "vim"]))
            .unwrap();
        assert_eq!(diff.summary(), "3 packages to install");
    }
}
