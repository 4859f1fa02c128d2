//! `CreateFilesystem` (spec.md §4.5, §6).

use std::sync::Arc;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_CHANGE_FILESYSTEM: &str = "org.freedesktop.devicekit.disks.change-filesystem";

pub async fn create_filesystem(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    device: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    fstype: &str,
    options: &[String],
) -> Result<(), DkError> {
    if device.is_mounted() {
        return Err(DkError::Mounted);
    }

    if !ctx
        .auth
        .check(caller, ACTION_CHANGE_FILESYSTEM)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("create-filesystem not authorized".to_string()));
    }

    let mut argv = vec![
        ctx.config.helpers.mkfs.to_string_lossy().into_owned(),
        "-t".to_string(),
        fstype.to_string(),
    ];
    argv.extend(options.iter().cloned());
    argv.push(device.device_file.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(device, "CreateFilesystem".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    outcome.into_result()?;

    super::trigger_kernel_change(&device.native_path).map_err(|err| DkError::General(err.to_string()))?;

    Ok(())
}
