//! Package manager backends
//!
//! Each backend knows how to detect itself on an instance, list what it has
//! installed, and produce shell fragments for installing and removing
//! packages. Adding a manager means adding one type here.

use serde::Deserialize;
use thiserror::Error;

use crate::script::quote;
use crate::types::{InstalledPackage, PackageManager};

/// A package listing that could not be understood
#[derive(Debug, Error)]
#[error("failed to parse {manager} package list: {message}")]
pub struct ParseError {
    pub manager: PackageManager,
    pub message: String,
}

/// Operations the engine needs from a package manager.
pub trait PackageBackend: Send + Sync {
    fn manager(&self) -> PackageManager;

    /// Command that exits zero when the manager is present
    fn probe_command(&self) -> &'static str;

    /// Command that lists installed packages
    fn list_command(&self) -> &'static str;

    /// Parse the output of [`Self::list_command`]
    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError>;

    /// Run once before any install, e.g. refreshing indexes
    fn setup_fragment(&self) -> Option<&'static str> {
        None
    }

    /// Install `name`, pinned to `version` when given
    fn install_fragment(&self, name: &str, version: Option<&str>) -> String;

    fn remove_fragment(&self, name: &str) -> String;
}

/// Debian/Ubuntu packages via dpkg and apt-get
#[derive(Debug, Clone, Copy, Default)]
pub struct Apt;

impl PackageBackend for Apt {
    fn manager(&self) -> PackageManager {
        PackageManager::Apt
    }

    fn probe_command(&self) -> &'static str {
        "command -v apt-get"
    }

    fn list_command(&self) -> &'static str {
        "dpkg -l"
    }

    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError> {
        // Only "ii" rows are fully installed; arch suffixes like ":amd64" are dropped
        Ok(output
            .lines()
            .filter(|line| line.starts_with("ii "))
            .filter_map(|line| {
                let mut fields = line.split_whitespace().skip(1);
                let name = fields.next()?;
                let version = fields.next()?;
                let name = name.split(':').next().unwrap_or(name);
                Some(InstalledPackage::new(name, version, PackageManager::Apt))
            })
            .collect())
    }

    fn setup_fragment(&self) -> Option<&'static str> {
        Some("DEBIAN_FRONTEND=noninteractive apt-get update -y")
    }

    fn install_fragment(&self, name: &str, version: Option<&str>) -> String {
        let target = match version {
            Some(v) => format!("{name}={v}"),
            None => name.to_string(),
        };
        format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
            quote(&target)
        )
    }

    fn remove_fragment(&self, name: &str) -> String {
        format!(
            "DEBIAN_FRONTEND=noninteractive apt-get remove -y {}",
            quote(name)
        )
    }
}

/// Fedora/RHEL packages via dnf
#[derive(Debug, Clone, Copy, Default)]
pub struct Dnf;

impl PackageBackend for Dnf {
    fn manager(&self) -> PackageManager {
        PackageManager::Dnf
    }

    fn probe_command(&self) -> &'static str {
        "command -v dnf"
    }

    fn list_command(&self) -> &'static str {
        "dnf list installed"
    }

    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError> {
        Ok(output
            .lines()
            .skip_while(|line| !line.starts_with("Installed Packages"))
            .skip(1)
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?;
                let version = fields.next()?;
                // "bash.x86_64" -> "bash"
                let name = name.rsplit_once('.').map_or(name, |(base, _arch)| base);
                Some(InstalledPackage::new(name, version, PackageManager::Dnf))
            })
            .collect())
    }

    fn install_fragment(&self, name: &str, version: Option<&str>) -> String {
        let target = match version {
            Some(v) => format!("{name}-{v}"),
            None => name.to_string(),
        };
        format!("dnf install -y {}", quote(&target))
    }

    fn remove_fragment(&self, name: &str) -> String {
        format!("dnf remove -y {}", quote(name))
    }
}

#[derive(Deserialize)]
struct JsonPackage {
    name: String,
    version: String,
}

fn parse_json_list(
    output: &str,
    manager: PackageManager,
) -> Result<Vec<InstalledPackage>, ParseError> {
    let packages: Vec<JsonPackage> =
        serde_json::from_str(output.trim()).map_err(|e| ParseError {
            manager,
            message: e.to_string(),
        })?;
    Ok(packages
        .into_iter()
        .map(|p| InstalledPackage {
            name: p.name,
            version: p.version,
            package_manager: manager,
        })
        .collect())
}

/// Conda environments
#[derive(Debug, Clone, Copy, Default)]
pub struct Conda;

impl PackageBackend for Conda {
    fn manager(&self) -> PackageManager {
        PackageManager::Conda
    }

    fn probe_command(&self) -> &'static str {
        "command -v conda"
    }

    fn list_command(&self) -> &'static str {
        "conda list --json"
    }

    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError> {
        parse_json_list(output, PackageManager::Conda)
    }

    fn install_fragment(&self, name: &str, version: Option<&str>) -> String {
        let target = match version {
            Some(v) => format!("{name}={v}"),
            None => name.to_string(),
        };
        format!("conda install -y {}", quote(&target))
    }

    fn remove_fragment(&self, name: &str) -> String {
        format!("conda remove -y {}", quote(name))
    }
}

/// Python packages via pip
#[derive(Debug, Clone, Copy, Default)]
pub struct Pip;

impl PackageBackend for Pip {
    fn manager(&self) -> PackageManager {
        PackageManager::Pip
    }

    fn probe_command(&self) -> &'static str {
        "command -v pip"
    }

    fn list_command(&self) -> &'static str {
        "pip list --format=json"
    }

    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError> {
        parse_json_list(output, PackageManager::Pip)
    }

    fn install_fragment(&self, name: &str, version: Option<&str>) -> String {
        let target = match version {
            Some(v) => format!("{name}=={v}"),
            None => name.to_string(),
        };
        format!("pip install {}", quote(&target))
    }

    fn remove_fragment(&self, name: &str) -> String {
        format!("pip uninstall -y {}", quote(name))
    }
}

/// HPC packages via spack
#[derive(Debug, Clone, Copy, Default)]
pub struct Spack;

impl PackageBackend for Spack {
    fn manager(&self) -> PackageManager {
        PackageManager::Spack
    }

    fn probe_command(&self) -> &'static str {
        "command -v spack"
    }

    fn list_command(&self) -> &'static str {
        "spack find --format '{name} {version}'"
    }

    fn parse_installed(&self, output: &str) -> Result<Vec<InstalledPackage>, ParseError> {
        // Section headers look like "-- linux-ubuntu22.04-x86_64 / gcc@11.4.0 --"
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("--") && !line.starts_with("==>"))
            .filter_map(|line| {
                let (name, version) = line.split_once(char::is_whitespace)?;
                Some(InstalledPackage::new(name, version.trim(), PackageManager::Spack))
            })
            .collect())
    }

    fn install_fragment(&self, name: &str, version: Option<&str>) -> String {
        let target = match version {
            Some(v) => format!("{name}@{v}"),
            None => name.to_string(),
        };
        format!("spack install {}", quote(&target))
    }

    fn remove_fragment(&self, name: &str) -> String {
        format!("spack uninstall -y {}", quote(name))
    }
}

static BACKENDS: [&dyn PackageBackend; 5] = [&Apt, &Dnf, &Conda, &Pip, &Spack];

/// Managers probed when detecting an instance's primary manager, in order
pub const DETECTION_ORDER: [PackageManager; 4] = [
    PackageManager::Conda,
    PackageManager::Apt,
    PackageManager::Dnf,
    PackageManager::Spack,
];

/// All registered backends
pub fn backends() -> &'static [&'static dyn PackageBackend] {
    &BACKENDS
}

/// The backend for `manager`, if one exists
pub fn backend_for(manager: PackageManager) -> Option<&'static dyn PackageBackend> {
    BACKENDS.iter().copied().find(|b| b.manager() == manager)
}
