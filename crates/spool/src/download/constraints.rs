//! Pre-start gates: external job constraints and free disk space.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::Disks;
use tracing::{debug, warn};

use super::request::{DownloadRequest, JobConstraints};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ConstraintResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Queried once when a job starts.
pub trait ConstraintChecker: Send + Sync {
    fn check(&self, constraints: &JobConstraints, request: &DownloadRequest) -> ConstraintResult;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConstraintChecker;

impl ConstraintChecker for NoopConstraintChecker {
    fn check(&self, _: &JobConstraints, _: &DownloadRequest) -> ConstraintResult {
        ConstraintResult::allowed()
    }
}

/// Free space on the filesystem holding a path.
pub trait DiskSpaceProbe: Send + Sync {
    /// `None` when the space cannot be determined.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskProbe;

impl SysinfoDiskProbe {
    /// Closest existing ancestor, made absolute, so paths of not yet created
    /// output directories still match a mount point.
    fn resolve(path: &Path) -> Option<PathBuf> {
        path.ancestors()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
            .or_else(|| path.is_relative().then_some(Path::new(".")))
            .and_then(|p| std::fs::canonicalize(p).ok())
    }
}

impl DiskSpaceProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let resolved = Self::resolve(path)?;
        let disks = Disks::new_with_refreshed_list();

        // Longest matching mount point is the most specific filesystem.
        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;
        for disk in disks.list() {
            let mount_point = disk.mount_point();
            if resolved.starts_with(mount_point) {
                let mount_len = mount_point.as_os_str().len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }
        best_match.map(|(disk, _)| disk.available_space())
    }
}

/// Evaluates the constraints that are observable on a desktop or server host.
///
/// Only `requires_storage_not_low` can be checked here; network metering,
/// charging and idle state are platform signals this checker has no access
/// to, so they are treated as satisfied.
pub struct HostConstraintChecker {
    probe: Arc<dyn DiskSpaceProbe>,
    low_storage_threshold: u64,
}

impl HostConstraintChecker {
    pub const DEFAULT_LOW_STORAGE_THRESHOLD: u64 = 512 * 1024 * 1024;

    pub fn new(probe: Arc<dyn DiskSpaceProbe>) -> Self {
        Self {
            probe,
            low_storage_threshold: Self::DEFAULT_LOW_STORAGE_THRESHOLD,
        }
    }

    pub fn with_low_storage_threshold(mut self, bytes: u64) -> Self {
        self.low_storage_threshold = bytes;
        self
    }
}

impl ConstraintChecker for HostConstraintChecker {
    fn check(&self, constraints: &JobConstraints, request: &DownloadRequest) -> ConstraintResult {
        if constraints.requires_unmetered || constraints.requires_charging || constraints.requires_idle
        {
            debug!(
                job_id = %request.id,
                "Network, charging and idle constraints are not observable on this host"
            );
        }

        if constraints.requires_storage_not_low {
            match self.probe.available_bytes(&request.output_dir) {
                Some(available) if available < self.low_storage_threshold => {
                    return ConstraintResult::denied(format!(
                        "storage is low: {available} bytes free, {} required",
                        self.low_storage_threshold
                    ));
                }
                Some(_) => {}
                None => warn!(
                    job_id = %request.id,
                    path = %request.output_dir.display(),
                    "Could not determine free space for storage constraint"
                ),
            }
        }
        ConstraintResult::allowed()
    }
}
