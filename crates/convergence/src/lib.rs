//! # Convergence
//!
//! Incremental template application for running instances.
//!
//! Given a declared [`Template`] and a live instance, this crate inspects
//! what is there, computes the difference, applies only that difference,
//! and restores the instance if anything fails along the way.
//!
//! ## Core Concepts
//!
//! - **InstanceState**: What an inspection found on the instance
//! - **TemplateDiff**: The changes needed to reach the template, plus conflicts
//! - **Checkpoint**: A snapshot taken before mutation, restorable once
//! - **Orchestrator**: Runs validate, inspect, diff, checkpoint, apply, record
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use convergence::{ApplyRequest, CancelToken, LeaseDir, Orchestrator, Template};
//!
//! let orchestrator = Orchestrator::new(Arc::new(my_executor), LeaseDir::new("/tmp/leases"));
//!
//! let mut request = ApplyRequest::new("web-1", Template::new("web"));
//! request.dry_run = true;
//!
//! let response = orchestrator.apply(&request, &CancelToken::new())?;
//! println!("{}", response.message);
//! ```
//!
//! ## Provider Traits
//!
//! Everything that crosses the process boundary is a trait:
//!
//! - [`RemoteExecutor`]: Runs commands and scripts on an instance
//! - [`PackageBackend`]: One package manager (apt, dnf, conda, pip, spack)
//! - [`ScriptGenerator`]: Renders diffs into shell scripts
//! - [`CheckpointManager`]: Creates and restores checkpoints
//! - [`HistoryStore`]: Keeps the applied-template history

pub mod apply;
pub mod checkpoint;
pub mod diff;
pub mod error;
pub mod history;
pub mod inspector;
pub mod lease;
pub mod manager;
pub mod orchestrator;
pub mod remote;
pub mod script;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use apply::ApplyEngine;
pub use checkpoint::{
    CategoryOutcome, Checkpoint, CheckpointManager, CheckpointRecord, RemoteCheckpointManager,
    RollbackReport,
};
pub use diff::{
    ConflictDiff, ConflictKind, PackageAction, PackageDiff, Resolution, ServiceAction,
    ServiceDiff, TemplateDiff, UserAction, UserDiff, compute_diff,
};
pub use error::{ApplyError, CheckpointError, Error, HistoryError, Impact, LeaseError, Result};
pub use history::{HistoryStore, RemoteHistoryStore};
pub use inspector::{InspectorOptions, StateInspector};
pub use lease::{InstanceLease, LeaseDir};
pub use manager::PackageBackend;
pub use orchestrator::{ApplyRequest, ApplyResponse, Orchestrator, Phase, Plan};
pub use remote::{CancelToken, ExecutionResult, RemoteExecutor, TransportError};
pub use script::{ScriptGenerator, ShellScripts};
pub use types::{
    AppliedTemplate, ApplyResult, Coverage, ExistingUser, InstalledPackage, InstanceState,
    PackageManager, PasswordPolicy, RunningService, ServiceConfig, ServiceStatus, Template,
    UserConfig,
};
