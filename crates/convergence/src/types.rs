//! Core types for template convergence
//!
//! Two halves: the declared side ([`Template`] and its parts) and the
//! observed side ([`InstanceState`] and its parts). A diff is computed
//! between the two; see [`crate::diff`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseManagerError;

/// Default login shell for accounts created from a template
pub const DEFAULT_SHELL: &str = "/bin/bash";

// ============================================================================
// Package managers
// ============================================================================

/// A package manager known to the convergence engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Conda,
    Pip,
    Spack,
    /// Pre-built image; nothing to install incrementally
    Ami,
    /// No manager could be detected on the instance
    #[default]
    Unknown,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Conda => "conda",
            Self::Pip => "pip",
            Self::Spack => "spack",
            Self::Ami => "ami",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageManager {
    type Err = ParseManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apt" | "apt-get" => Ok(Self::Apt),
            "dnf" | "yum" => Ok(Self::Dnf),
            "conda" => Ok(Self::Conda),
            "pip" => Ok(Self::Pip),
            "spack" => Ok(Self::Spack),
            "ami" => Ok(Self::Ami),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseManagerError(other.to_string())),
        }
    }
}

// ============================================================================
// Template (desired state)
// ============================================================================

/// Declared desired state for an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Base OS (e.g. "ubuntu-22.04") or parent template
    #[serde(default)]
    pub base: String,
    /// Parent templates, informational; resolution happens before apply
    #[serde(default)]
    pub inherits: Vec<String>,
    /// Package manager override; empty or "auto" defers to the instance
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub packages: PackageSets,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub instance_defaults: InstanceDefaults,
    #[serde(default)]
    pub pre_install: Option<String>,
    #[serde(default)]
    pub post_install: Option<String>,
}

impl Template {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The explicit package manager override, if one is set
    pub fn manager_override(&self) -> Option<&str> {
        self.package_manager
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("auto"))
    }

    /// Whether the template carries launch-time hooks
    pub fn has_hooks(&self) -> bool {
        self.pre_install.as_deref().is_some_and(|h| !h.trim().is_empty())
            || self.post_install.as_deref().is_some_and(|h| !h.trim().is_empty())
    }
}

/// Package lists partitioned by manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSets {
    /// apt / dnf packages
    #[serde(default)]
    pub system: Vec<String>,
    #[serde(default)]
    pub conda: Vec<String>,
    /// pip packages, installed alongside conda
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub spack: Vec<String>,
}

/// A service the template wants configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Config file lines
    #[serde(default)]
    pub config: Vec<String>,
}

impl ServiceConfig {
    pub fn new(name: &str, port: Option<u16>) -> Self {
        Self {
            name: name.to_string(),
            port,
            enable: true,
            config: Vec::new(),
        }
    }

    /// Declared port, ignoring zero
    pub fn declared_port(&self) -> Option<u16> {
        self.port.filter(|p| *p > 0)
    }
}

fn default_true() -> bool {
    true
}

/// Password handling for newly created accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordPolicy {
    /// Account password is locked; key-based login only
    #[default]
    Locked,
    /// Empty password that must be changed on first login
    Expired,
    /// Leave the password untouched
    Unset,
}

/// A user account the template wants present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub password: PasswordPolicy,
}

impl UserConfig {
    pub fn new(name: &str, groups: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            groups: groups.iter().map(ToString::to_string).collect(),
            shell: None,
            password: PasswordPolicy::default(),
        }
    }

    pub fn shell_or_default(&self) -> &str {
        self.shell
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SHELL)
    }
}

/// Instance-level defaults declared by the template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDefaults {
    #[serde(default)]
    pub ports: Vec<u16>,
}

// ============================================================================
// Instance state (observed)
// ============================================================================

/// Observed state of an instance at one point in time
///
/// Always produced whole by an inspection; never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub packages: Vec<InstalledPackage>,
    pub services: Vec<RunningService>,
    pub users: Vec<ExistingUser>,
    /// Listening ports; iteration order carries no meaning
    pub ports: BTreeSet<u16>,
    pub package_manager: PackageManager,
    pub applied_templates: Vec<AppliedTemplate>,
    pub inspected_at: DateTime<Utc>,
    /// Which categories were read in full
    #[serde(default)]
    pub coverage: Coverage,
}

/// Categories an inspection read without a failed probe.
///
/// A category that is not covered came back empty or partial because a
/// listing command exited non-zero, and must not be compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    /// Managers whose installed-package listing succeeded
    #[serde(default)]
    pub package_managers: BTreeSet<PackageManager>,
    #[serde(default)]
    pub services: bool,
    #[serde(default)]
    pub users: bool,
}

impl Coverage {
    /// Everything readable on a host where only `managers` are installed
    pub fn full(managers: impl IntoIterator<Item = PackageManager>) -> Self {
        Self {
            package_managers: managers.into_iter().collect(),
            services: true,
            users: true,
        }
    }
}

impl InstanceState {
    pub fn package(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Look up a package, preferring the copy owned by `manager`
    pub fn package_for(&self, name: &str, manager: PackageManager) -> Option<&InstalledPackage> {
        self.packages
            .iter()
            .find(|p| p.name == name && p.package_manager == manager)
            .or_else(|| self.package(name))
    }

    pub fn service(&self, name: &str) -> Option<&RunningService> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn user(&self, name: &str) -> Option<&ExistingUser> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// The most recently applied template, if any
    pub fn last_applied(&self) -> Option<&AppliedTemplate> {
        self.applied_templates.iter().max_by_key(|t| t.applied_at)
    }
}

/// A package installed on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub package_manager: PackageManager,
}

impl InstalledPackage {
    pub fn new(name: &str, version: &str, package_manager: PackageManager) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            package_manager,
        }
    }
}

/// Runtime status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A service unit found on the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningService {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub port: Option<u16>,
    pub enabled: bool,
}

impl RunningService {
    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}

/// A regular (non-system) user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingUser {
    pub name: String,
    /// Supplementary groups; the primary group is not listed
    pub groups: Vec<String>,
    pub shell: String,
}

/// History entry for a template applied to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTemplate {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub applied_at: DateTime<Utc>,
    pub package_manager: PackageManager,
    pub checkpoint: String,
    pub packages_installed: usize,
    pub services_configured: usize,
    pub users_created: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ============================================================================
// Apply results
// ============================================================================

/// Resource categories, in the order they are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Packages,
    Services,
    Users,
    Ports,
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Packages => write!(f, "packages"),
            Self::Services => write!(f, "services"),
            Self::Users => write!(f, "users"),
            Self::Ports => write!(f, "ports"),
        }
    }
}

/// Counts produced by a successful apply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub packages_installed: usize,
    pub services_configured: usize,
    pub users_created: usize,
    /// Non-fatal problems, e.g. ports that could not be opened
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ApplyResult {
    pub fn total_changes(&self) -> usize {
        self.packages_installed + self.services_configured + self.users_created
    }
}
