//! External collaborators this crate depends on but does not implement
//! (spec.md §1 "Out of scope" / §6 External interfaces): the object
//! registry, the authorization service, the mount ledger, and the
//! daemon's change-notification bus. A real daemon binary supplies
//! concrete implementations; this crate only needs the trait boundary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use tokio::sync::oneshot;

use crate::device::{DeviceRecord, JobFields};

/// The caller identity resolved from the RPC context (spec.md §4.5:
/// "resolve caller identity from the RPC context (fail if absent)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: u32,
}

/// A just-appeared device, as reported by the enclosing daemon's
/// "device-added" event (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct DeviceAdded {
    pub object_path: String,
    pub is_partition: bool,
    pub partition_slave: Option<String>,
    pub partition_offset: u64,
    pub partition_size: u64,
}

/// The enclosing daemon's device registry: lookup by object path, and a
/// one-shot subscription to "device-added" events. Implemented by the
/// surrounding daemon; never by this crate.
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, object_path: &str) -> Option<Arc<DeviceRecord>>;

    /// Register interest in the next "device-added" event matching
    /// `predicate`; the returned receiver yields the matching device's
    /// object path. Used by the partition-appearance waiter (spec.md
    /// §4.6). Dropping the receiver cancels the subscription.
    fn subscribe_added(
        &self,
        predicate: Box<dyn Fn(&DeviceAdded) -> bool + Send + Sync>,
    ) -> oneshot::Receiver<String>;
}

/// Synchronous-from-the-caller's-viewpoint authorization check (spec.md
/// §6: "check(caller, action, context) -> granted|denied").
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    async fn check(&self, caller: &CallerIdentity, action: &str) -> Result<bool, Error>;
}

/// The external "mounts file" ledger (spec.md §6): records which mount
/// directories this service itself created, so they can be torn down on
/// unmount.
pub trait MountLedger: Send + Sync {
    /// `(uid_of_mount, remove_dir_on_unmount)` if this device was mounted
    /// by this service.
    fn has_device(&self, device_file: &std::path::Path) -> Option<(u32, bool)>;

    fn add(&self, device_file: &std::path::Path, uid: u32, remove_dir_on_unmount: bool) -> Result<(), Error>;

    fn remove(&self, device_file: &std::path::Path, mount_path: &PathBuf) -> Result<(), Error>;
}

/// Emits "changed" and "job-changed" to the surrounding daemon (spec.md
/// §4.2, §6 Signals).
pub trait ChangeNotifier: Send + Sync {
    fn changed(&self, object_path: &str);
    fn job_changed(&self, object_path: &str, fields: JobFields);
}
