//! Shell script generation
//!
//! Scripts are built as plain strings and shipped whole to the instance.
//! Every value that came from a template is shell-quoted.

use std::fmt::Write as _;

use crate::diff::{PackageDiff, ServiceAction, ServiceDiff, UserDiff};
use crate::manager::PackageBackend;
use crate::types::PasswordPolicy;

/// Builds the per-category scripts an apply runs.
pub trait ScriptGenerator: Send + Sync {
    /// Install/upgrade `install` then remove `remove`, all for one manager
    fn package_script(
        &self,
        backend: &dyn PackageBackend,
        install: &[PackageDiff],
        remove: &[PackageDiff],
    ) -> String;

    fn service_script(&self, services: &[ServiceDiff]) -> String;

    fn user_script(&self, create: &[UserDiff], modify: &[UserDiff]) -> String;

    fn port_script(&self, ports: &[u16]) -> String;
}

/// Bash scripts with `set -euo pipefail`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellScripts;

impl ScriptGenerator for ShellScripts {
    fn package_script(
        &self,
        backend: &dyn PackageBackend,
        install: &[PackageDiff],
        remove: &[PackageDiff],
    ) -> String {
        let mut script = header(&format!("Package changes ({})", backend.manager()));

        if !install.is_empty() {
            if let Some(setup) = backend.setup_fragment() {
                let _ = writeln!(script, "{setup}");
            }
            for pkg in install {
                let version = Some(pkg.target_version.as_str()).filter(|v| !v.is_empty());
                let _ = writeln!(script, "{}", backend.install_fragment(&pkg.name, version));
            }
        }
        for pkg in remove {
            let _ = writeln!(script, "{}", backend.remove_fragment(&pkg.name));
        }

        let _ = writeln!(
            script,
            "echo {}",
            quote(&format!(
                "{} installed, {} removed",
                install.len(),
                remove.len()
            ))
        );
        script
    }

    fn service_script(&self, services: &[ServiceDiff]) -> String {
        let mut script = header("Service changes");
        for svc in services {
            let name = quote(&svc.name);
            let _ = writeln!(script, "# {}: {}", svc.name, svc.action);
            match svc.action {
                ServiceAction::Configure => {
                    let _ = writeln!(script, "systemctl enable {name}");
                    let _ = writeln!(script, "systemctl start {name}");
                }
                ServiceAction::Start => {
                    let _ = writeln!(script, "systemctl start {name}");
                }
                ServiceAction::Restart => {
                    let _ = writeln!(script, "systemctl restart {name}");
                }
                ServiceAction::Stop => {
                    let _ = writeln!(script, "systemctl stop {name}");
                }
            }
        }
        script
    }

    fn user_script(&self, create: &[UserDiff], modify: &[UserDiff]) -> String {
        let mut script = header("User changes");

        for user in create {
            let name = quote(&user.name);
            let _ = writeln!(script, "# Create user {}", user.name);
            let _ = writeln!(script, "if ! id -u {name} >/dev/null 2>&1; then");
            let _ = writeln!(script, "    useradd -m -s {} {name}", quote(&user.shell));
            let _ = writeln!(script, "fi");
            for group in &user.target_groups {
                let _ = writeln!(script, "getent group {0} >/dev/null || groupadd {0}", quote(group));
                let _ = writeln!(script, "usermod -a -G {} {name}", quote(group));
            }
            match user.password {
                PasswordPolicy::Locked => {
                    let _ = writeln!(script, "passwd -l {name}");
                }
                PasswordPolicy::Expired => {
                    let _ = writeln!(script, "passwd -d {name}");
                    let _ = writeln!(script, "passwd -e {name}");
                }
                PasswordPolicy::Unset => {}
            }
        }

        // -G without -a replaces the supplementary group list wholesale
        for user in modify {
            let _ = writeln!(script, "# Modify groups for {}", user.name);
            for group in &user.target_groups {
                let _ = writeln!(script, "getent group {0} >/dev/null || groupadd {0}", quote(group));
            }
            let _ = writeln!(
                script,
                "usermod -G {} {}",
                quote(&user.target_groups.join(",")),
                quote(&user.name)
            );
        }
        script
    }

    fn port_script(&self, ports: &[u16]) -> String {
        let mut script = header("Firewall ports");
        let list = ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        let _ = writeln!(script, "if command -v ufw >/dev/null 2>&1; then");
        for port in ports {
            let _ = writeln!(script, "    ufw allow {port}/tcp");
        }
        let _ = writeln!(script, "elif command -v firewall-cmd >/dev/null 2>&1; then");
        for port in ports {
            let _ = writeln!(script, "    firewall-cmd --permanent --add-port={port}/tcp");
        }
        let _ = writeln!(script, "    firewall-cmd --reload");
        let _ = writeln!(script, "else");
        let _ = writeln!(script, "    echo 'No host firewall found; ports {list} need external rules'");
        let _ = writeln!(script, "fi");
        script
    }
}

fn header(title: &str) -> String {
    format!("#!/bin/bash\nset -euo pipefail\n\n# {title}\n")
}

/// Quote `value` for a POSIX shell, leaving plain words untouched
pub fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Script that writes `contents` to `path` atomically via a temp file
pub fn write_file_script(path: &str, contents: &str) -> String {
    let dir = path.rsplit_once('/').map_or(".", |(dir, _)| dir);
    let dir = if dir.is_empty() { "/" } else { dir };
    let tmp = format!("{path}.tmp");
    format!(
        "#!/bin/bash\nset -euo pipefail\n\nmkdir -p {dir}\ncat > {tmp} <<'CONVERGE_EOF'\n{contents}\nCONVERGE_EOF\nmv -f {tmp} {path}\n",
        dir = quote(dir),
        tmp = quote(&tmp),
        path = quote(path),
    )
}
