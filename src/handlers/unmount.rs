//! `Unmount` (spec.md §4.5, §6).

use std::sync::Arc;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_UNMOUNT_OTHERS: &str = "org.freedesktop.devicekit.disks.unmount-others";

pub async fn unmount(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    device: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    options: &[String],
) -> Result<(), DkError> {
    let mount_path = match device.mount_path() {
        Some(path) if device.is_mounted() => path,
        _ => return Err(DkError::NotMounted),
    };

    let (uid_of_mount, remove_dir_on_unmount) = ctx
        .ledger
        .has_device(&device.device_file)
        .ok_or(DkError::NotMountedByDeviceKit)?;

    if uid_of_mount != caller.uid {
        let granted = ctx
            .auth
            .check(caller, ACTION_UNMOUNT_OTHERS)
            .await
            .map_err(|err| DkError::General(err.to_string()))?;
        if !granted {
            return Err(DkError::General(
                "not authorized to unmount another user's mount".to_string(),
            ));
        }
    }

    let force = options.iter().any(|o| o == "force");
    for option in options {
        if option != "force" {
            return Err(DkError::UnmountOptionNotAllowed(option.clone()));
        }
    }

    let mut argv = vec![ctx.config.helpers.umount.to_string_lossy().into_owned()];
    if force {
        argv.push("-l".to_string());
    }
    argv.push(mount_path.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(device, "Unmount".to_string(), false, &argv, ctx.notifier, caller.uid)
        .await?;

    outcome.into_result()?;

    device.set_mounted(None, ctx.notifier);
    ctx.ledger
        .remove(&device.device_file, &mount_path)
        .map_err(|err| DkError::General(err.to_string()))?;

    if remove_dir_on_unmount {
        let _ = std::fs::remove_dir(&mount_path);
    }

    Ok(())
}
