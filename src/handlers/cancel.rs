//! `CancelJob` (spec.md §4.5, §9: authorization requires either the
//! caller that started the job, or an explicit `cancel-others` grant).

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_CANCEL_OTHERS: &str = "org.freedesktop.devicekit.disks.cancel-others";

pub async fn cancel_job(
    ctx: &HandlerContext<'_>,
    job_slot: &JobSlot,
    device: &DeviceRecord,
    caller: &CallerIdentity,
) -> Result<(), DkError> {
    if job_slot.started_by() != Some(caller.uid) {
        let granted = ctx
            .auth
            .check(caller, ACTION_CANCEL_OTHERS)
            .await
            .map_err(|err| DkError::General(err.to_string()))?;
        if !granted {
            return Err(DkError::General(
                "not authorized to cancel another user's job".to_string(),
            ));
        }
    }

    job_slot.cancel(device)
}
