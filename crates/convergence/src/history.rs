//! Applied-template history kept on the instance
//!
//! History lives on the instance itself so any operator machine sees the
//! same record. Writes replace the file atomically.

use std::sync::Arc;

use crate::error::HistoryError;
use crate::remote::{CancelToken, RemoteExecutor};
use crate::script::{quote, write_file_script};
use crate::types::AppliedTemplate;

/// Default location of the history file on an instance
pub const HISTORY_PATH: &str = "/var/lib/converge/applied-templates.json";

/// Storage for the list of templates applied to an instance.
pub trait HistoryStore: Send + Sync {
    /// Load the history; a missing record is an empty history
    fn load(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AppliedTemplate>, HistoryError>;

    /// Append one entry
    fn append(
        &self,
        instance: &str,
        entry: &AppliedTemplate,
        cancel: &CancelToken,
    ) -> Result<(), HistoryError>;
}

/// History stored as a JSON array in a file on the instance
#[derive(Clone)]
pub struct RemoteHistoryStore {
    executor: Arc<dyn RemoteExecutor>,
    path: String,
}

impl RemoteHistoryStore {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            path: HISTORY_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }
}

impl HistoryStore for RemoteHistoryStore {
    fn load(
        &self,
        instance: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AppliedTemplate>, HistoryError> {
        let command = format!("cat {}", quote(&self.path));
        let result = self.executor.execute(instance, &command, cancel)?;

        if !result.success() || result.stdout.trim().is_empty() {
            log::debug!("No template history on {instance}");
            return Ok(Vec::new());
        }

        match serde_json::from_str(&result.stdout) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                log::warn!("Ignoring unreadable template history on {instance}: {e}");
                Ok(Vec::new())
            }
        }
    }

    fn append(
        &self,
        instance: &str,
        entry: &AppliedTemplate,
        cancel: &CancelToken,
    ) -> Result<(), HistoryError> {
        let mut entries = self.load(instance, cancel)?;
        entries.push(entry.clone());

        let contents = serde_json::to_string_pretty(&entries)?;
        let script = write_file_script(&self.path, &contents);
        let result = self.executor.execute_script(instance, &script, cancel)?;
        if !result.success() {
            return Err(HistoryError::Command {
                exit_code: result.exit_code,
                stderr: result.error_output(),
            });
        }

        log::debug!(
            "Recorded template {} on {instance} ({} entries)",
            entry.name,
            entries.len()
        );
        Ok(())
    }
}
