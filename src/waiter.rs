//! Partition-appearance waiter (spec.md §4.6).
//!
//! After `CreatePartition`'s helper exits successfully, its stderr
//! trailer carries the predicted `(offset, size)` of the new partition.
//! This waits for the enclosing daemon's "device-added" event to report a
//! matching child of the parent device, racing a 10-second timeout. The
//! "shared refcounted state" the original implementation needs (C has no
//! borrow checker to express "whichever fires first releases the other")
//! is just a `tokio::select!` between a oneshot receiver and a timeout
//! here: dropping the losing branch's future cancels its subscription.

use std::time::Duration;

use crate::error::DkError;
use crate::ports::{DeviceAdded, DeviceRegistry};

/// Parse the two `job-create-partition-{offset,size}:` trailer lines out
/// of a helper's stderr buffer. Exactly both must be present, or the
/// operation fails with a descriptive `General` error (spec.md §4.6).
pub fn parse_partition_trailer(stderr: &str) -> Result<(u64, u64), DkError> {
    let mut offset = None;
    let mut size = None;

    for line in stderr.lines() {
        if let Some(rest) = line.strip_prefix("job-create-partition-offset: ") {
            offset = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("job-create-partition-size: ") {
            size = rest.trim().parse::<u64>().ok();
        }
    }

    match (offset, size) {
        (Some(offset), Some(size)) => Ok((offset, size)),
        _ => Err(DkError::General(
            "create-partition helper did not report both offset and size".to_string(),
        )),
    }
}

/// Wait up to `timeout` for a device matching `parent_object_path`,
/// `offset`, and `size` to appear. Returns the new device's object path,
/// or a timeout error (spec.md §4.6, §8 scenario 6).
pub async fn wait_for_partition(
    registry: &dyn DeviceRegistry,
    parent_object_path: &str,
    offset: u64,
    size: u64,
    timeout: Duration,
) -> Result<String, DkError> {
    let parent = parent_object_path.to_string();
    let predicate = move |added: &DeviceAdded| {
        added.is_partition
            && added.partition_slave.as_deref() == Some(parent.as_str())
            && added.partition_offset == offset
            && added.partition_size == size
    };

    let receiver = registry.subscribe_added(Box::new(predicate));

    match tokio::time::timeout(timeout, receiver).await {
        Ok(Ok(object_path)) => Ok(object_path),
        Ok(Err(_)) => Err(DkError::General(
            "device registry closed before partition appeared".to_string(),
        )),
        Err(_) => Err(DkError::General(
            "timeout waiting for partition to appear".to_string(),
        )),
    }
}
