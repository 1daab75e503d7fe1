//! Error types for template convergence.
//!
//! Every failure of an apply says what happened to the instance, not just
//! what went wrong: see [`Error::impact`]. Callers use this to decide
//! between "safe to retry", "undone, fix the template" and "a human needs
//! to look at this box".

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::RollbackReport;
use crate::diff::ConflictDiff;
use crate::orchestrator::Phase;
use crate::remote::TransportError;
use crate::types::{PackageManager, ResourceCategory};

/// What a failed operation left behind on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    /// Nothing was changed
    Untouched,
    /// Changes were made and then undone
    Reverted,
    /// Changes were made and could not be fully undone
    Indeterminate,
}

impl Impact {
    /// Get a user-friendly description of this impact.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Untouched => "The instance was not modified",
            Self::Reverted => "The instance was restored to its previous state",
            Self::Indeterminate => "The instance is in an indeterminate state",
        }
    }

    /// Get actionable advice for this impact.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Untouched => "Fix the reported problem and run the command again",
            Self::Reverted => "Fix the template or the instance, then apply again",
            Self::Indeterminate => {
                "Inspect the instance manually; a checkpoint is kept for recovery"
            }
        }
    }
}

/// An unrecognised package manager name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported package manager: {0}")]
pub struct ParseManagerError(pub String);

/// Failure of one category during apply.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to {action}: script exited with code {exit_code}: {stderr}")]
    ScriptFailed {
        category: ResourceCategory,
        action: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to {action}: {source}")]
    Transport {
        category: ResourceCategory,
        action: String,
        source: TransportError,
    },

    #[error("no package backend for {manager}")]
    UnsupportedManager { manager: PackageManager },
}

impl ApplyError {
    pub fn category(&self) -> ResourceCategory {
        match self {
            Self::ScriptFailed { category, .. } | Self::Transport { category, .. } => *category,
            Self::UnsupportedManager { .. } => ResourceCategory::Packages,
        }
    }
}

/// Checkpoint creation, loading or restore failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to capture instance state: {0}")]
    Inspection(#[source] TransportError),

    #[error("failed to {action}: {source}")]
    Transport {
        action: &'static str,
        source: TransportError,
    },

    #[error("failed to {action}: exit code {exit_code}: {stderr}")]
    Command {
        action: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error("checkpoint {id} not found on {instance}")]
    NotFound { id: String, instance: String },

    #[error("checkpoint {id} belongs to {owner}, not {instance}")]
    WrongInstance {
        id: String,
        owner: String,
        instance: String,
    },

    #[error("checkpoint {id} has already been restored")]
    AlreadyRestored { id: String },

    #[error("corrupt checkpoint {id}: {source}")]
    Corrupt {
        id: String,
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    /// Whether the failure happened before anything on the instance was restored
    pub fn is_before_restore(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::WrongInstance { .. }
                | Self::AlreadyRestored { .. }
                | Self::Corrupt { .. }
        )
    }
}

/// Template history read/write failures.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to write history: exit code {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Local lease acquisition failures.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("instance {instance} is locked by another apply")]
    Busy { instance: String },

    #[error("failed to open lease file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Why a rollback did not bring the instance back.
#[derive(Debug)]
pub enum RollbackFailure {
    /// The restore could not run at all
    Aborted(CheckpointError),
    /// The restore ran but some categories failed
    Incomplete(RollbackReport),
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(e) => write!(f, "{e}"),
            Self::Incomplete(report) => write!(f, "incomplete restore: {report}"),
        }
    }
}

impl std::error::Error for RollbackFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Aborted(e) => Some(e),
            Self::Incomplete(_) => None,
        }
    }
}

/// Errors returned by the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid apply request: {0}")]
    InvalidRequest(String),

    #[error("instance {instance} is busy: another apply holds its lease")]
    InstanceBusy { instance: String },

    #[error("failed to acquire lease for {instance}: {source}")]
    Lease {
        instance: String,
        source: LeaseError,
    },

    #[error("failed to inspect instance {instance}: {source}")]
    InspectionFailed {
        instance: String,
        source: TransportError,
    },

    #[error("failed to calculate template diff: {0}")]
    PlanningFailed(#[from] ParseManagerError),

    #[error("template conflicts found (use --force to override): {}", describe_conflicts(.conflicts))]
    ConflictsUnresolved { conflicts: Vec<ConflictDiff> },

    #[error("operation cancelled after phase {phase}")]
    Cancelled { phase: Phase },

    #[error("failed to create rollback checkpoint: {0}")]
    CheckpointFailed(#[source] CheckpointError),

    #[error("template application failed (rolled back): {source}")]
    RolledBack {
        source: ApplyError,
        checkpoint: String,
        report: RollbackReport,
    },

    #[error(
        "template application failed: {apply} (rollback also failed: {rollback}); \
         instance {instance} needs manual intervention, checkpoint {checkpoint} is kept"
    )]
    RollbackFailed {
        instance: String,
        checkpoint: String,
        apply: ApplyError,
        #[source]
        rollback: RollbackFailure,
    },

    #[error("rollback of {instance} to {checkpoint} failed: {source}")]
    Rollback {
        instance: String,
        checkpoint: String,
        source: RollbackFailure,
    },

    #[error("failed to list checkpoints on {instance}: {source}")]
    Checkpoints {
        instance: String,
        source: CheckpointError,
    },

    #[error("failed to read template history on {instance}: {source}")]
    History {
        instance: String,
        source: HistoryError,
    },
}

impl Error {
    /// What this failure left behind on the instance.
    pub fn impact(&self) -> Impact {
        match self {
            Self::RolledBack { .. } => Impact::Reverted,
            Self::Rollback {
                source: RollbackFailure::Aborted(e),
                ..
            } if e.is_before_restore() => Impact::Untouched,
            Self::RollbackFailed { .. } | Self::Rollback { .. } => Impact::Indeterminate,
            _ => Impact::Untouched,
        }
    }

    /// Whether running the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InstanceBusy { .. }
            | Self::Cancelled { .. }
            | Self::CheckpointFailed(_)
            | Self::Checkpoints { .. }
            | Self::History { .. } => true,
            Self::InspectionFailed { source, .. } => source.is_transient(),
            Self::RolledBack { source, .. } => {
                matches!(source, ApplyError::Transport { source, .. } if source.is_transient())
            }
            _ => false,
        }
    }

    /// The checkpoint kept for recovery, if the failure left one behind.
    pub fn checkpoint(&self) -> Option<&str> {
        match self {
            Self::RolledBack { checkpoint, .. }
            | Self::RollbackFailed { checkpoint, .. }
            | Self::Rollback { checkpoint, .. } => Some(checkpoint),
            _ => None,
        }
    }
}

fn describe_conflicts(conflicts: &[ConflictDiff]) -> String {
    conflicts
        .iter()
        .map(|c| c.description.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for convergence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CategoryOutcome;
    use crate::diff::{ConflictKind, Resolution};

    fn script_failure() -> ApplyError {
        ApplyError::ScriptFailed {
            category: ResourceCategory::Services,
            action: "configure services".to_string(),
            exit_code: 1,
            stderr: "Unit nginx.service not found".to_string(),
        }
    }

    #[test]
    fn test_impact_for_each_outcome() {
        let untouched = Error::InvalidRequest("missing instance".to_string());
        assert_eq!(untouched.impact(), Impact::Untouched);

        let reverted = Error::RolledBack {
            source: script_failure(),
            checkpoint: "checkpoint-1".to_string(),
            report: RollbackReport::default(),
        };
        assert_eq!(reverted.impact(), Impact::Reverted);
        assert_eq!(reverted.checkpoint(), Some("checkpoint-1"));

        let indeterminate = Error::RollbackFailed {
            instance: "web-1".to_string(),
            checkpoint: "checkpoint-1".to_string(),
            apply: script_failure(),
            rollback: RollbackFailure::Aborted(CheckpointError::AlreadyRestored {
                id: "checkpoint-1".to_string(),
            }),
        };
        assert_eq!(indeterminate.impact(), Impact::Indeterminate);
    }

    #[test]
    fn test_rolled_back_message_carries_cause() {
        let err = Error::RolledBack {
            source: script_failure(),
            checkpoint: "checkpoint-1".to_string(),
            report: RollbackReport::default(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rolled back"));
        assert!(msg.contains("Unit nginx.service not found"));
    }

    #[test]
    fn test_rollback_failed_message_carries_both_errors() {
        let report = RollbackReport {
            services: CategoryOutcome::Failed("systemctl timed out".to_string()),
            ..Default::default()
        };
        let err = Error::RollbackFailed {
            instance: "web-1".to_string(),
            checkpoint: "checkpoint-1".to_string(),
            apply: script_failure(),
            rollback: RollbackFailure::Incomplete(report),
        };
        let msg = err.to_string();
        assert!(msg.contains("Unit nginx.service not found"));
        assert!(msg.contains("rollback also failed"));
        assert!(msg.contains("systemctl timed out"));
    }

    #[test]
    fn test_conflicts_message_lists_descriptions() {
        let err = Error::ConflictsUnresolved {
            conflicts: vec![ConflictDiff {
                kind: ConflictKind::Port,
                description: "Port 80 is already in use".to_string(),
                resolution: Resolution::Skip,
            }],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("template conflicts found (use --force to override)"));
        assert!(msg.contains("Port 80 is already in use"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = Error::InstanceBusy {
            instance: "web-1".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.impact(), Impact::Untouched);
    }
}
