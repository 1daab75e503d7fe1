//! Per-instance leases
//!
//! Only one apply or rollback may run against an instance at a time. A
//! lease is an exclusive, non-blocking `flock` on a file named after the
//! instance, held until the guard is dropped.

use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::LeaseError;

/// Directory holding lease files
#[derive(Debug, Clone)]
pub struct LeaseDir {
    root: PathBuf,
}

impl LeaseDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lease file path for `instance`
    pub fn path_for(&self, instance: &str) -> PathBuf {
        let name: String = instance
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{name}.lease"))
    }

    /// Take the lease for `instance` without waiting
    pub fn acquire(&self, instance: &str) -> Result<InstanceLease, LeaseError> {
        let path = self.path_for(instance);
        let io_err = |source: io::Error| LeaseError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.root).map_err(io_err)?;
        let file = File::create(&path).map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::debug!("Acquired lease for {instance} at {}", path.display());
                Ok(InstanceLease {
                    _file: file,
                    path,
                    instance: instance.to_string(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LeaseError::Busy {
                instance: instance.to_string(),
            }),
            Err(source) => Err(LeaseError::Io { path, source }),
        }
    }
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct InstanceLease {
    // Lock lives as long as the handle stays open
    _file: File,
    path: PathBuf,
    instance: String,
}

impl InstanceLease {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        log::debug!("Released lease for {}", self.instance);
    }
}
