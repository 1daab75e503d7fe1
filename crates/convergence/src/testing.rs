//! Test doubles shared by the module tests.

use std::path::Path;
use std::sync::Mutex;

use crate::remote::{CancelToken, ExecutionResult, RemoteExecutor, TransportError};

/// One thing the engine asked the executor to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Command(String),
    Script(String),
    /// File copy in either direction, keyed by the remote path
    Transfer(String),
}

impl Call {
    pub fn text(&self) -> &str {
        match self {
            Self::Command(text) | Self::Script(text) | Self::Transfer(text) => text,
        }
    }
}

#[derive(Debug, Clone)]
enum Response {
    Output(ExecutionResult),
    Unreachable,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    response: Response,
}

/// In-memory executor matching commands by substring.
///
/// The most recently added matching rule wins. Unmatched commands exit 127,
/// unmatched scripts exit 0.
#[derive(Debug, Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to matching commands with `exit_code` and `stdout`
    pub fn on(&self, pattern: &str, exit_code: i32, stdout: &str) -> &Self {
        self.push(pattern, Response::Output(ExecutionResult::new(exit_code, stdout, "")))
    }

    /// Fail matching commands with `exit_code` and `stderr`
    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(pattern, Response::Output(ExecutionResult::new(exit_code, "", stderr)))
    }

    /// Matching commands never reach the instance
    pub fn unreachable(&self, pattern: &str) -> &Self {
        self.push(pattern, Response::Unreachable)
    }

    fn push(&self, pattern: &str, response: Response) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            response,
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Script(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Scripts whose text contains `needle`
    pub fn scripts_containing(&self, needle: &str) -> Vec<String> {
        self.scripts()
            .into_iter()
            .filter(|s| s.contains(needle))
            .collect()
    }

    fn respond(
        &self,
        instance: &str,
        call: Call,
        default_exit: i32,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        cancel.check()?;
        let text = call.text().to_string();
        self.calls.lock().unwrap().push(call);

        let rules = self.rules.lock().unwrap();
        match rules.iter().rev().find(|r| text.contains(&r.pattern)) {
            Some(Rule {
                response: Response::Output(result),
                ..
            }) => Ok(result.clone()),
            Some(Rule {
                response: Response::Unreachable,
                ..
            }) => Err(TransportError::Unreachable {
                instance: instance.to_string(),
                message: "connection refused".to_string(),
            }),
            None => Ok(ExecutionResult::new(default_exit, "", "")),
        }
    }
}

impl RemoteExecutor for MockExecutor {
    fn execute(
        &self,
        instance: &str,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        self.respond(instance, Call::Command(command.to_string()), 127, cancel)
    }

    fn execute_script(
        &self,
        instance: &str,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        self.respond(instance, Call::Script(script.to_string()), 0, cancel)
    }

    fn copy_file(
        &self,
        instance: &str,
        _local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.respond(instance, Call::Transfer(remote.to_string()), 0, cancel)
            .map(|_| ())
    }

    fn get_file(
        &self,
        instance: &str,
        remote: &str,
        _local: &Path,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.respond(instance, Call::Transfer(remote.to_string()), 0, cancel)
            .map(|_| ())
    }
}

pub const DPKG_OUTPUT: &str = "\
Desired=Unknown/Install/Remove/Purge/Hold
| Status=Not/Inst/Conf-files/Unpacked/halF-conf/Half-inst/trig-aWait/Trig-pend
|/ Err?=(none)/Reinst-required (Status,Err: uppercase=bad)
||/ Name           Version        Architecture Description
+++-==============-==============-============-=================================
ii  git            2.30           amd64        fast, scalable, distributed revision control system
ii  nginx          1.18.0         amd64        small, powerful, scalable web/proxy server
rc  oldpkg         0.9            amd64        removed package with config left
ii  openssh-server 1:8.9p1        amd64        secure shell (SSH) server
";

pub const SYSTEMCTL_UNITS: &str = "\
nginx.service      loaded active   running A high performance web server
ssh.service        loaded active   running OpenBSD Secure Shell server
postgresql.service loaded inactive dead    PostgreSQL RDBMS
cron.service       loaded failed   failed  Regular background program processing daemon
";

pub const SYSTEMCTL_UNIT_FILES: &str = "\
nginx.service      enabled  enabled
ssh.service        enabled  enabled
postgresql.service disabled enabled
cron.service       enabled  enabled
";

pub const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/bin/bash
alice:x:1001:1001:Alice:/home/alice:/bin/zsh
";

pub const SS_OUTPUT: &str = "\
State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process
LISTEN 0      511          0.0.0.0:80        0.0.0.0:*     users:((\"nginx\",pid=812,fd=6))
LISTEN 0      128          0.0.0.0:22        0.0.0.0:*     users:((\"sshd\",pid=701,fd=3))
LISTEN 0      128             [::]:22           [::]:*     users:((\"sshd\",pid=701,fd=4))
";

/// An Ubuntu-like instance: apt, nginx on 80, sshd on 22, two regular users
pub fn ubuntu_host() -> MockExecutor {
    let mock = MockExecutor::new();
    mock.on("command -v apt-get", 0, "/usr/bin/apt-get\n")
        .on("dpkg -l", 0, DPKG_OUTPUT)
        .on("systemctl list-units", 0, SYSTEMCTL_UNITS)
        .on("systemctl list-unit-files", 0, SYSTEMCTL_UNIT_FILES)
        .on("getent passwd", 0, PASSWD)
        .on("id -gn ubuntu", 0, "ubuntu\nubuntu adm sudo\n")
        .on("id -gn alice", 0, "alice\nalice sudo\n")
        .on("ss -tlnp", 0, SS_OUTPUT);
    mock
}
