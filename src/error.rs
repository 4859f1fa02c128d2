//! Error taxonomy returned to RPC callers.
//!
//! Precondition and policy failures are reported immediately; helper
//! failures are classified from the job completion continuation (see
//! `crate::job`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DkError {
    #[error("{0}")]
    General(String),

    #[error("operation not supported")]
    NotSupported,

    #[error("device is not mountable")]
    NotMountable,

    #[error("device is mounted")]
    Mounted,

    #[error("device is not mounted")]
    NotMounted,

    #[error("device was not mounted by this service")]
    NotMountedByDeviceKit,

    #[error("device is referenced in /etc/fstab")]
    FstabEntry,

    #[error("mount option not allowed: {0}")]
    MountOptionNotAllowed(String),

    #[error("filesystem is busy: {0}")]
    FilesystemBusy(String),

    #[error("cannot remount: {0}")]
    CannotRemount(String),

    #[error("unmount option not allowed: {0}")]
    UnmountOptionNotAllowed(String),

    #[error("no job in progress")]
    NoJobInProgress,

    #[error("a job is already in progress for this device")]
    JobAlreadyInProgress,

    #[error("job cannot be cancelled")]
    JobCannotBeCancelled,

    #[error("job was cancelled")]
    JobWasCancelled,

    #[error("device is not a partition")]
    NotPartition,

    #[error("device is not partitioned")]
    NotPartitioned,
}

impl DkError {
    /// Classify a finished helper invocation per spec.md §7: cancellation
    /// first, then known stderr patterns, then a generic exit-code error.
    pub fn from_helper_exit(was_cancelled: bool, exit_code: Option<i32>, stderr: &str) -> Self {
        if was_cancelled {
            return DkError::JobWasCancelled;
        }
        if stderr.contains("device is busy") {
            return DkError::FilesystemBusy(stderr.trim().to_string());
        }
        DkError::General(format!(
            "helper failed with exit code {}: {}",
            exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr.trim(),
        ))
    }
}
