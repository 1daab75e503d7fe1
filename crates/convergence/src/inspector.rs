//! State inspection
//!
//! Builds an [`InstanceState`] by running read-only commands on the
//! instance. Only transport failures abort an inspection; a command that
//! is missing or exits non-zero leaves its category empty and drops it
//! from [`Coverage`].

use rayon::prelude::*;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use chrono::Utc;

use crate::error::{Error, HistoryError, Result};
use crate::history::HistoryStore;
use crate::manager::{DETECTION_ORDER, backend_for, backends};
use crate::remote::{CancelToken, RemoteExecutor, TransportError};
use crate::script::quote;
use crate::types::{
    AppliedTemplate, Coverage, ExistingUser, InstalledPackage, InstanceState, PackageManager,
    RunningService, ServiceStatus,
};

const LIST_UNITS: &str = "systemctl list-units --type=service --all --no-pager --plain --no-legend";
const LIST_UNIT_FILES: &str = "systemctl list-unit-files --type=service --no-pager --no-legend";
const LIST_USERS: &str = "getent passwd 2>/dev/null || cat /etc/passwd";
const LIST_LISTENERS: &str = "ss -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null";

static PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)\s").expect("valid port regex"));
static SS_PROCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"users:\(\("([^"]+)""#).expect("valid ss regex"));
static NETSTAT_PROCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+/(\S+)\s*$").expect("valid netstat regex"));

/// Tuning for inspections
#[derive(Debug, Clone)]
pub struct InspectorOptions {
    /// Accounts below this uid are system accounts and are skipped
    pub min_uid: u32,
}

impl Default for InspectorOptions {
    fn default() -> Self {
        Self { min_uid: 1000 }
    }
}

/// A listening TCP socket and the process that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub process: Option<String>,
}

/// Reads the current state of an instance.
#[derive(Clone)]
pub struct StateInspector {
    executor: Arc<dyn RemoteExecutor>,
    history: Arc<dyn HistoryStore>,
    options: InspectorOptions,
}

impl StateInspector {
    pub fn new(executor: Arc<dyn RemoteExecutor>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            executor,
            history,
            options: InspectorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: InspectorOptions) -> Self {
        self.options = options;
        self
    }

    /// Inspect `instance`, failing only if it cannot be reached
    pub fn inspect(&self, instance: &str, cancel: &CancelToken) -> Result<InstanceState> {
        self.observe(instance, cancel)
            .map_err(|source| Error::InspectionFailed {
                instance: instance.to_string(),
                source,
            })
    }

    pub(crate) fn observe(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<InstanceState, TransportError> {
        log::info!("Inspecting {instance}");

        // Reachability: any transport failure here is fatal, exit code is not
        cancel.check()?;
        self.executor.execute(instance, "true", cancel)?;

        let (packages, package_managers) = self.inspect_packages(instance, cancel)?;
        let package_manager = self.detect_package_manager(instance, cancel)?;

        let listeners = self
            .probe(instance, LIST_LISTENERS, cancel)?
            .map(|out| parse_listeners(&out))
            .unwrap_or_default();
        let ports: BTreeSet<u16> = listeners.iter().map(|l| l.port).collect();

        let (mut services, services_covered) = self.inspect_services(instance, cancel)?;
        attach_ports(&mut services, &listeners);

        let (users, users_covered) = self.inspect_users(instance, cancel)?;
        let applied_templates = self.load_history(instance, cancel)?;

        log::debug!(
            "{instance}: {} packages, {} services, {} users, {} ports, manager {package_manager}",
            packages.len(),
            services.len(),
            users.len(),
            ports.len()
        );

        Ok(InstanceState {
            packages,
            services,
            users,
            ports,
            package_manager,
            applied_templates,
            inspected_at: Utc::now(),
            coverage: Coverage {
                package_managers,
                services: services_covered,
                users: users_covered,
            },
        })
    }

    /// Run a read-only command; `None` when it ran but failed
    fn probe(
        &self,
        instance: &str,
        command: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<Option<String>, TransportError> {
        cancel.check()?;
        let result = self.executor.execute(instance, command, cancel)?;
        if result.success() {
            Ok(Some(result.stdout))
        } else {
            log::debug!(
                "{instance}: `{command}` exited with {}: {}",
                result.exit_code,
                result.error_output()
            );
            Ok(None)
        }
    }

    fn inspect_packages(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<(Vec<InstalledPackage>, BTreeSet<PackageManager>), TransportError>
    {
        let mut packages = Vec::new();
        let mut covered = BTreeSet::new();
        for backend in backends() {
            let Some(output) = self.probe(instance, backend.list_command(), cancel)? else {
                continue;
            };
            match backend.parse_installed(&output) {
                Ok(found) => {
                    packages.extend(found);
                    covered.insert(backend.manager());
                }
                Err(e) => log::warn!("{instance}: {e}"),
            }
        }
        Ok((packages, covered))
    }

    fn detect_package_manager(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<PackageManager, TransportError> {
        for manager in DETECTION_ORDER {
            let Some(backend) = backend_for(manager) else {
                continue;
            };
            if self.probe(instance, backend.probe_command(), cancel)?.is_some() {
                return Ok(manager);
            }
        }
        Ok(PackageManager::Unknown)
    }

    fn inspect_services(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<(Vec<RunningService>, bool), TransportError> {
        let Some(units) = self.probe(instance, LIST_UNITS, cancel)? else {
            return Ok((Vec::new(), false));
        };
        let enabled = self
            .probe(instance, LIST_UNIT_FILES, cancel)?
            .map(|out| parse_unit_files(&out));
        // Enablement is guessed from the load state without unit files
        let covered = enabled.is_some();
        Ok((parse_units(&units, enabled.as_ref()), covered))
    }

    fn inspect_users(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<(Vec<ExistingUser>, bool), TransportError> {
        let Some(passwd) = self.probe(instance, LIST_USERS, cancel)? else {
            return Ok((Vec::new(), false));
        };
        let accounts = parse_passwd(&passwd, self.options.min_uid);

        // Group lookups are independent round trips
        let groups: Vec<Option<Vec<String>>> = accounts
            .par_iter()
            .map(|(name, _)| self.user_groups(instance, name, cancel))
            .collect::<std::result::Result<_, _>>()?;
        let covered = groups.iter().all(Option::is_some);

        let users = accounts
            .into_iter()
            .zip(groups)
            .map(|((name, shell), groups)| ExistingUser {
                name,
                groups: groups.unwrap_or_default(),
                shell,
            })
            .collect();
        Ok((users, covered))
    }

    fn user_groups(
        &self,
        instance: &str,
        user: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<Option<Vec<String>>, TransportError> {
        let user = quote(user);
        let command = format!("id -gn {user} && id -Gn {user}");
        Ok(self
            .probe(instance, &command, cancel)?
            .map(|out| parse_supplementary_groups(&out)))
    }

    fn load_history(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<AppliedTemplate>, TransportError> {
        match self.history.load(instance, cancel) {
            Ok(entries) => Ok(entries),
            Err(HistoryError::Transport(e)) => Err(e),
            Err(e) => {
                log::warn!("{instance}: {e}");
                Ok(Vec::new())
            }
        }
    }
}

/// Parse `systemctl list-units` rows into services
fn parse_units(output: &str, enabled: Option<&HashMap<String, bool>>) -> Vec<RunningService> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let name = fields[0].strip_suffix(".service")?;
            let (load, active) = (fields[1], fields[2]);
            let status = match active {
                "active" if load == "loaded" => ServiceStatus::Running,
                "failed" => ServiceStatus::Failed,
                _ => ServiceStatus::Stopped,
            };
            let enabled = match enabled {
                Some(map) => map.get(name).copied().unwrap_or(false),
                None => load == "loaded",
            };
            Some(RunningService {
                name: name.to_string(),
                status,
                port: None,
                enabled,
            })
        })
        .collect()
}

/// Parse `systemctl list-unit-files` rows into name -> enabled
fn parse_unit_files(output: &str) -> HashMap<String, bool> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?.strip_suffix(".service")?;
            let state = fields.next()?;
            Some((name.to_string(), state == "enabled"))
        })
        .collect()
}

/// Regular accounts as (name, shell), in passwd order
fn parse_passwd(output: &str, min_uid: u32) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let uid: u32 = fields[2].parse().ok()?;
            (uid >= min_uid).then(|| (fields[0].to_string(), fields[6].to_string()))
        })
        .collect()
}

/// First line is the primary group, second line all groups
fn parse_supplementary_groups(output: &str) -> Vec<String> {
    let mut lines = output.lines();
    let primary = lines.next().unwrap_or_default().trim();
    let mut groups: Vec<String> = Vec::new();
    for group in lines.next().unwrap_or_default().split_whitespace() {
        if group != primary && !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }
    groups
}

/// Parse `ss -tlnp` or `netstat -tlnp` output
pub fn parse_listeners(output: &str) -> Vec<Listener> {
    output
        .lines()
        .filter_map(|line| {
            let port = PORT_RE.captures(line)?.get(1)?.as_str().parse().ok()?;
            let process = SS_PROCESS_RE
                .captures(line)
                .or_else(|| NETSTAT_PROCESS_RE.captures(line))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            Some(Listener { port, process })
        })
        .collect()
}

/// Give each service the lowest port its process listens on.
///
/// A process named after the unit wins; otherwise a daemon binary whose
/// name is the unit plus a trailing `d` (`sshd` for `ssh`) is accepted.
fn attach_ports(services: &mut [RunningService], listeners: &[Listener]) {
    for service in services.iter_mut() {
        let unit = service.name.as_str();
        service.port = lowest_port(listeners, |process| process == unit)
            .or_else(|| lowest_port(listeners, |process| is_daemon_of(process, unit)));
    }
}

fn lowest_port(listeners: &[Listener], matches: impl Fn(&str) -> bool) -> Option<u16> {
    listeners
        .iter()
        .filter(|l| l.process.as_deref().is_some_and(&matches))
        .map(|l| l.port)
        .min()
}

fn is_daemon_of(process: &str, unit: &str) -> bool {
    process.strip_suffix('d') == Some(unit) || unit.strip_suffix('d') == Some(process)
}
