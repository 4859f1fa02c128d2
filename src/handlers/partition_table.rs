//! `CreatePartitionTable` (spec.md §4.5, §6).

use std::sync::Arc;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_CHANGE_PARTITION_TABLE: &str = "org.freedesktop.devicekit.disks.change-partition-table";

pub async fn create_partition_table(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    device: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    scheme: &str,
    options: &[String],
) -> Result<(), DkError> {
    if scheme.is_empty() {
        return Err(DkError::General("partition table scheme is required".to_string()));
    }
    if device.is_mounted() {
        return Err(DkError::Mounted);
    }

    if !ctx
        .auth
        .check(caller, ACTION_CHANGE_PARTITION_TABLE)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("create-partition-table not authorized".to_string()));
    }

    let mut argv = vec![
        ctx.config.helpers.part_table_create.to_string_lossy().into_owned(),
        scheme.to_string(),
    ];
    argv.extend(options.iter().cloned());
    argv.push(device.device_file.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(device, "CreatePartitionTable".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    outcome.into_result()?;

    super::trigger_kernel_change(&device.native_path).map_err(|err| DkError::General(err.to_string()))?;

    Ok(())
}
