//! Remote execution abstraction
//!
//! Everything the engine does to an instance goes through a
//! [`RemoteExecutor`]. The SSH implementation lives in the binary; tests use
//! an in-memory double.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of a command that ran to completion on the instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn new(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty
    pub fn error_output(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// The command could not be run at all.
///
/// A command that runs and exits non-zero is not a transport error; it is
/// an [`ExecutionResult`] with a non-zero exit code.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("instance {instance} is unreachable: {message}")]
    Unreachable { instance: String, message: String },

    #[error("remote operation cancelled")]
    Cancelled,

    #[error("remote operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("I/O error talking to {instance}: {source}")]
    Io { instance: String, source: io::Error },
}

impl TransportError {
    /// Whether the failure may go away on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::TimedOut(_))
    }
}

/// Cooperative cancellation with an optional deadline.
///
/// Clones share the same flag, so cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<(Instant, Duration)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some((Instant::now() + timeout, timeout)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match self.deadline {
            Some((at, timeout)) if Instant::now() >= at => Err(TransportError::TimedOut(timeout)),
            _ => Ok(()),
        }
    }
}

/// Runs commands and moves files on a named instance.
///
/// Implementations must honour the [`CancelToken`]: check it before
/// starting and abandon in-flight work once it fires.
pub trait RemoteExecutor: Send + Sync {
    /// Run a single shell command
    fn execute(
        &self,
        instance: &str,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError>;

    /// Run a multi-line shell script
    fn execute_script(
        &self,
        instance: &str,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TransportError>;

    /// Copy a local file onto the instance
    fn copy_file(
        &self,
        instance: &str,
        local: &Path,
        remote: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;

    /// Fetch a file from the instance
    fn get_file(
        &self,
        instance: &str,
        remote: &str,
        local: &Path,
        cancel: &CancelToken,
    ) -> Result<(), TransportError>;
}
