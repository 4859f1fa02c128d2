//! Operation handlers (spec.md §4.5): one per exposed RPC. Each follows
//! the same skeleton — resolve caller identity, run preconditions, check
//! authorization, validate inputs, assemble `argv`, hand off to the job
//! engine with a handler-specific completion.

pub mod cancel;
pub mod erase;
pub mod filesystem;
pub mod mount;
pub mod partition;
pub mod partition_table;
pub mod unmount;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;

use crate::config::DkConfig;
use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::{AuthService, ChangeNotifier, DeviceRegistry, MountLedger};

/// Everything a handler needs beyond its own RPC arguments: the
/// injected collaborators plus this daemon's configuration.
pub struct HandlerContext<'a> {
    pub config: &'a DkConfig,
    pub registry: &'a dyn DeviceRegistry,
    pub auth: &'a dyn AuthService,
    pub ledger: &'a dyn MountLedger,
    pub notifier: &'a dyn ChangeNotifier,
}

/// A single per-device job slot registry, keyed by object path. A real
/// daemon owns one of these per device alongside its `DeviceRecord`; tests
/// construct the slot directly.
pub fn new_job_slot() -> Arc<JobSlot> {
    Arc::new(JobSlot::default())
}

/// Whether any fstab entry's canonicalized device path matches this
/// device's device file (spec.md §4.5 Mount precondition). Per spec.md
/// §9's open question, only the fstab side is canonicalized; a device
/// file that is itself a symlink is compared as given.
pub fn is_device_in_fstab(device_file: &Path, fstab_path: &Path) -> bool {
    let contents = match std::fs::read_to_string(fstab_path) {
        Ok(contents) => contents,
        Err(_) => return false,
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let raw_device = match line.split_whitespace().next() {
            Some(field) => field,
            None => continue,
        };
        if let Ok(canonical) = std::fs::canonicalize(raw_device) {
            if canonical == device_file {
                return true;
            }
        }
    }
    false
}

/// Choose and create a fresh mount-point directory under `media_root`.
/// Base name is `id_label` if set, else `id_uuid`, else `disk` (spec.md
/// §4.5). Collisions are resolved by appending `_` and retrying — kept as
/// specified even though spec.md §9 flags this as producing
/// monotonically longer names; no REDESIGN FLAG calls for changing it.
pub fn choose_and_create_mount_dir(media_root: &Path, device: &DeviceRecord) -> Result<PathBuf, Error> {
    let base = device
        .id_label
        .clone()
        .or_else(|| device.id_uuid.clone())
        .unwrap_or_else(|| "disk".to_string());

    let mut candidate = media_root.join(&base);
    while candidate.exists() {
        let mut name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push('_');
        candidate = media_root.join(name);
    }

    std::fs::create_dir(&candidate)?;
    std::fs::set_permissions(&candidate, std::os::unix::fs::PermissionsExt::from_mode(0o700))?;

    Ok(candidate)
}

/// Force the kernel to re-emit a "change" event for a device by writing
/// `add` to its `uevent` sysfs file (spec.md §6 Kernel interactions).
pub fn trigger_kernel_change(native_path: &Path) -> Result<(), Error> {
    std::fs::write(native_path.join("uevent"), b"change")?;
    Ok(())
}

/// Look up `object_path` or fail with a descriptive error — every handler
/// needs this first.
pub fn require_device(registry: &dyn DeviceRegistry, object_path: &str) -> Result<Arc<DeviceRecord>, DkError> {
    registry
        .lookup(object_path)
        .ok_or_else(|| DkError::General(format!("no such device: {}", object_path)))
}
