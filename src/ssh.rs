//! SSH transport for the convergence engine
//!
//! Commands run through the system `ssh` binary in batch mode; scripts are
//! piped to `bash -s` over stdin so nothing is left on the instance. Exit
//! status 255 is ssh's own failure code and is reported as unreachable.

use convergence::script::quote;
use convergence::{CancelToken, ExecutionResult, RemoteExecutor, TransportError};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use crate::config::ConvergeConfig;

/// How often a running command checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// ssh exits with 255 when it could not run the remote command
const SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: Option<String>,
    key_file: Option<PathBuf>,
    port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
    sudo: bool,
    hosts: BTreeMap<String, String>,
}

impl SshExecutor {
    pub fn from_config(config: &ConvergeConfig) -> Self {
        Self {
            user: config.ssh.user.clone().filter(|u| !u.trim().is_empty()),
            key_file: config.ssh.key_file(),
            port: config.ssh.port,
            connect_timeout: config.ssh.connect_timeout(),
            command_timeout: config.ssh.command_timeout(),
            sudo: config.ssh.sudo,
            hosts: config.instances.clone(),
        }
    }

    /// `user@host` for an instance name
    fn destination(&self, instance: &str) -> String {
        let host = self.hosts.get(instance).map_or(instance, String::as_str);
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Options shared by ssh and scp
    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(key) = &self.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    fn ssh_args(&self, instance: &str, remote_command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination(instance));
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-q".to_string());
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args.push(from);
        args.push(to);
        args
    }

    /// Remote command line, elevated when configured
    fn remote_command(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo -n sh -c {}", quote(command))
        } else {
            command.to_string()
        }
    }

    fn remote_script_runner(&self) -> &'static str {
        if self.sudo { "sudo -n bash -s" } else { "bash -s" }
    }

    fn run_ssh(
        &self,
        instance: &str,
        remote_command: &str,
        stdin: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        let mut command = Command::new("ssh");
        command.args(self.ssh_args(instance, remote_command));
        let result = run_process(instance, command, stdin, self.command_timeout, cancel)?;
        unreachable_on_ssh_failure(instance, result)
    }

    fn run_scp(
        &self,
        instance: &str,
        from: String,
        to: String,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        let mut command = Command::new("scp");
        command.args(self.scp_args(from, to));
        let result = run_process(instance, command, None, self.command_timeout, cancel)?;
        if result.success() {
            Ok(())
        } else {
            Err(TransportError::Unreachable {
                instance: instance.to_string(),
                message: format!("scp failed: {}", result.error_output()),
            })
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(
        &self,
        instance: &str,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        log::debug!("{instance}: $ {command}");
        self.run_ssh(instance, &self.remote_command(command), None, cancel)
    }

    fn execute_script(
        &self,
        instance: &str,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError> {
        log::debug!("{instance}: running script ({} bytes)", script.len());
        log::trace!("{instance}: script:\n{script}");
        self.run_ssh(instance, self.remote_script_runner(), Some(script), cancel)
    }

    fn copy_file(
        &self,
        instance: &str,
        local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        log::debug!("{instance}: copy {} -> {remote}", local.display());
        let to = format!("{}:{remote}", self.destination(instance));
        self.run_scp(instance, local.display().to_string(), to, cancel)
    }

    fn get_file(
        &self,
        instance: &str,
        remote: &str,
        local: &Path,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        log::debug!("{instance}: fetch {remote} -> {}", local.display());
        let from = format!("{}:{remote}", self.destination(instance));
        self.run_scp(instance, from, local.display().to_string(), cancel)
    }
}

fn unreachable_on_ssh_failure(
    instance: &str,
    result: ExecutionResult,
) -> Result<ExecutionResult, TransportError> {
    if result.exit_code == SSH_FAILURE {
        return Err(TransportError::Unreachable {
            instance: instance.to_string(),
            message: result.error_output(),
        });
    }
    Ok(result)
}

/// Run a local process to completion, honouring `timeout` and `cancel`.
///
/// The process is killed when either fires.
fn run_process(
    instance: &str,
    mut command: Command,
    stdin: Option<&str>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExecutionResult, TransportError> {
    cancel.check()?;
    let io_err = |source| TransportError::Io {
        instance: instance.to_string(),
        source,
    };

    let started = Instant::now();
    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(io_err)?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(thread::spawn(move || pipe.write_all(input.as_bytes())))
        }
        _ => None,
    };
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = loop {
        match child.wait_timeout(POLL_INTERVAL).map_err(io_err)? {
            Some(status) => break status,
            None => {
                if let Err(e) = cancel.check() {
                    kill(&mut child);
                    return Err(e);
                }
                if started.elapsed() >= timeout {
                    kill(&mut child);
                    return Err(TransportError::TimedOut(timeout));
                }
            }
        }
    };

    if let Some(writer) = writer
        && let Ok(Err(e)) = writer.join()
    {
        // The remote side may exit before reading all of stdin
        log::debug!("{instance}: stdin closed early: {e}");
    }

    Ok(ExecutionResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
        duration: started.elapsed(),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

// ============================================================================
// Tests
// ============================================================================
