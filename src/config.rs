//! converge configuration (`config.toml`)
//!
//! ```toml
//! [ssh]
//! user = "ubuntu"
//! key_path = "~/.ssh/fleet_ed25519"
//! port = 22
//! connect_timeout_secs = 10
//! command_timeout_secs = 1800
//! sudo = true
//!
//! [inspect]
//! min_uid = 1000
//!
//! [apply]
//! rollback_timeout_secs = 600
//!
//! [instances]
//! web-1 = "10.0.4.17"
//! ```
//!
//! Every field is optional; a missing file is the default config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergeConfig {
    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub inspect: InspectConfig,

    #[serde(default)]
    pub apply: ApplyConfig,

    /// Instance name to SSH host; names not listed are used as hosts directly
    #[serde(default)]
    pub instances: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub key_path: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for a single remote command or script
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Run scripts through `sudo -n`
    #[serde(default = "default_true")]
    pub sudo: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            key_path: None,
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            sudo: true,
        }
    }
}

impl SshConfig {
    /// Key path with `~` and environment variables expanded
    pub fn key_file(&self) -> Option<PathBuf> {
        self.key_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(paths::expand)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectConfig {
    /// Accounts below this UID are system accounts and are not reported
    #[serde(default = "default_min_uid")]
    pub min_uid: u32,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            min_uid: default_min_uid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Deadline for the automatic rollback after a failed apply; 0 disables it
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            rollback_timeout_secs: default_rollback_timeout(),
        }
    }
}

impl ApplyConfig {
    pub fn rollback_timeout(&self) -> Option<Duration> {
        (self.rollback_timeout_secs > 0).then(|| Duration::from_secs(self.rollback_timeout_secs))
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    1800
}

fn default_min_uid() -> u32 {
    1000
}

fn default_rollback_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl ConvergeConfig {
    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))
    }
}

// ============================================================================
// Tests
// ============================================================================
