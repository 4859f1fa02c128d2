//! `CreatePartition`, `DeletePartition`, `ModifyPartition` (spec.md §4.5,
//! §4.6, §6).

use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;
use crate::waiter;

use super::HandlerContext;

const ACTION_CHANGE_PARTITION: &str = "org.freedesktop.devicekit.disks.change-partition";

pub struct CreatePartitionRequest {
    pub offset: u64,
    pub size: u64,
    pub r#type: String,
    pub label: String,
    pub flags: Vec<String>,
    pub options: Vec<String>,
    pub fstype: String,
    pub fsoptions: Vec<String>,
}

/// Create a partition on `parent` (a partition-table device). On success,
/// returns the new child's object path — after `CreateFilesystem` on it
/// too, if `request.fstype` is non-empty (spec.md §4.6). `child_job_slot`
/// is the job slot the daemon keeps for the new device; only consulted
/// when a filesystem is also requested.
pub async fn create_partition(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    child_job_slot: &Arc<JobSlot>,
    parent: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    request: CreatePartitionRequest,
) -> Result<String, DkError> {
    if !parent.is_partition_table {
        return Err(DkError::NotPartitioned);
    }

    if !ctx
        .auth
        .check(caller, ACTION_CHANGE_PARTITION)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("create-partition not authorized".to_string()));
    }

    let mut argv = vec![
        ctx.config.helpers.part_create.to_string_lossy().into_owned(),
        request.offset.to_string(),
        request.size.to_string(),
        request.r#type.clone(),
        request.label.clone(),
        request.flags.join(","),
    ];
    argv.extend(request.options.iter().cloned());
    argv.push(parent.device_file.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(parent, "CreatePartition".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    let stderr = outcome.into_result()?;

    let (offset, size) = waiter::parse_partition_trailer(&stderr)?;

    let new_object_path = waiter::wait_for_partition(
        ctx.registry,
        &parent.object_path,
        offset,
        size,
        Duration::from_secs(ctx.config.partition_wait_secs),
    )
    .await?;

    if !request.fstype.is_empty() {
        let child = super::require_device(ctx.registry, &new_object_path)?;
        super::filesystem::create_filesystem(ctx, child_job_slot, &child, caller, &request.fstype, &request.fsoptions)
            .await?;
    }

    Ok(new_object_path)
}

/// Delete a partition (spec.md §4.5). `partition` must itself be a
/// partition; the enclosing device (resolved via its `partition_slave`
/// object path) receives the "change" signal afterwards, not `partition`.
pub async fn delete_partition(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    partition: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    options: &[String],
) -> Result<(), DkError> {
    if !partition.is_partition {
        return Err(DkError::NotPartition);
    }
    if partition.is_mounted() {
        return Err(DkError::Mounted);
    }

    if !ctx
        .auth
        .check(caller, ACTION_CHANGE_PARTITION)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("delete-partition not authorized".to_string()));
    }

    let parent_object_path = partition
        .partition
        .slave
        .clone()
        .ok_or_else(|| DkError::General("partition has no enclosing device".to_string()))?;
    let parent = super::require_device(ctx.registry, &parent_object_path)?;

    let mut argv = vec![ctx.config.helpers.part_delete.to_string_lossy().into_owned()];
    argv.extend(options.iter().cloned());
    argv.push(partition.device_file.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(partition, "DeletePartition".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    outcome.into_result()?;

    super::trigger_kernel_change(&parent.native_path).map_err(|err| DkError::General(err.to_string()))?;

    Ok(())
}

/// Modify a partition's type/label/flags in place (spec.md §4.5). The
/// "change" signal is emitted on the enclosing device, matching
/// `DeletePartition`.
pub async fn modify_partition(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    partition: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    r#type: &str,
    label: &str,
    flags: &[String],
) -> Result<(), DkError> {
    if !partition.is_partition {
        return Err(DkError::NotPartition);
    }

    if !ctx
        .auth
        .check(caller, ACTION_CHANGE_PARTITION)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("modify-partition not authorized".to_string()));
    }

    let parent_object_path = partition
        .partition
        .slave
        .clone()
        .ok_or_else(|| DkError::General("partition has no enclosing device".to_string()))?;
    let parent = super::require_device(ctx.registry, &parent_object_path)?;

    let argv = vec![
        ctx.config.helpers.part_modify.to_string_lossy().into_owned(),
        r#type.to_string(),
        label.to_string(),
        flags.join(","),
        partition.device_file.to_string_lossy().into_owned(),
    ];

    let outcome = job_slot
        .start(partition, "ModifyPartition".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    outcome.into_result()?;

    super::trigger_kernel_change(&parent.native_path).map_err(|err| DkError::General(err.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DkConfig;
    use crate::device::{JobFields, PartitionInfo};
    use crate::ports::{AuthService, CallerIdentity, ChangeNotifier, DeviceAdded, DeviceRegistry, MountLedger};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    struct AllowAllAuth;
    #[async_trait::async_trait]
    impl AuthService for AllowAllAuth {
        async fn check(&self, _caller: &CallerIdentity, _action: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }
    struct NullLedger;
    impl MountLedger for NullLedger {
        fn has_device(&self, _device_file: &Path) -> Option<(u32, bool)> {
            None
        }
        fn add(&self, _device_file: &Path, _uid: u32, _remove_dir_on_unmount: bool) -> anyhow::Result<()> {
            Ok(())
        }
        fn remove(&self, _device_file: &Path, _mount_path: &PathBuf) -> anyhow::Result<()> {
            Ok(())
        }
    }
    struct NullNotifier;
    impl ChangeNotifier for NullNotifier {
        fn changed(&self, _object_path: &str) {}
        fn job_changed(&self, _object_path: &str, _fields: JobFields) {}
    }

    struct MapRegistry {
        devices: Mutex<HashMap<String, Arc<DeviceRecord>>>,
    }
    impl DeviceRegistry for MapRegistry {
        fn lookup(&self, object_path: &str) -> Option<Arc<DeviceRecord>> {
            self.devices.lock().unwrap().get(object_path).cloned()
        }
        fn subscribe_added(
            &self,
            _predicate: Box<dyn Fn(&DeviceAdded) -> bool + Send + Sync>,
        ) -> oneshot::Receiver<String> {
            oneshot::channel().1
        }
    }

    #[tokio::test]
    async fn create_partition_requires_partition_table() {
        let parent = Arc::new(DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz"));
        let config = DkConfig::default();
        let job_slot = super::super::new_job_slot();
        let child_job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let notifier = NullNotifier;
        let registry = MapRegistry { devices: Mutex::new(HashMap::new()) };
        let ctx = HandlerContext { config: &config, registry: &registry, auth: &auth, ledger: &ledger, notifier: &notifier };

        let request = CreatePartitionRequest {
            offset: 0,
            size: 0,
            r#type: String::new(),
            label: String::new(),
            flags: Vec::new(),
            options: Vec::new(),
            fstype: String::new(),
            fsoptions: Vec::new(),
        };

        let caller = CallerIdentity { uid: 1000 };
        let err = create_partition(&ctx, &job_slot, &child_job_slot, &parent, &caller, request).await.unwrap_err();
        assert!(matches!(err, DkError::NotPartitioned));
    }

    #[tokio::test]
    async fn delete_partition_requires_is_partition() {
        let partition = Arc::new(DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz"));
        let config = DkConfig::default();
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let notifier = NullNotifier;
        let registry = MapRegistry { devices: Mutex::new(HashMap::new()) };
        let ctx = HandlerContext { config: &config, registry: &registry, auth: &auth, ledger: &ledger, notifier: &notifier };

        let caller = CallerIdentity { uid: 1000 };
        let err = delete_partition(&ctx, &job_slot, &partition, &caller, &[]).await.unwrap_err();
        assert!(matches!(err, DkError::NotPartition));
    }

    #[tokio::test]
    async fn delete_partition_triggers_change_on_parent() {
        let parent_sysfs = tempfile::tempdir().unwrap();
        std::fs::write(parent_sysfs.path().join("uevent"), b"").unwrap();
        let mut parent = DeviceRecord::for_test("/sys/block/sdz", "/devices/sdz");
        parent.native_path = parent_sysfs.path().to_path_buf();
        let parent = Arc::new(parent);

        let mut partition = DeviceRecord::for_test("/sys/block/sdz1", "/devices/sdz1");
        partition.is_partition = true;
        partition.partition = PartitionInfo { slave: Some("/devices/sdz".to_string()), ..Default::default() };
        let partition = Arc::new(partition);

        let mut devices = HashMap::new();
        devices.insert("/devices/sdz".to_string(), parent.clone());
        let registry = MapRegistry { devices: Mutex::new(devices) };

        let mut config = DkConfig::default();
        config.helpers.part_delete = PathBuf::from("/bin/true");
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let notifier = NullNotifier;
        let ctx = HandlerContext { config: &config, registry: &registry, auth: &auth, ledger: &ledger, notifier: &notifier };

        let caller = CallerIdentity { uid: 1000 };
        delete_partition(&ctx, &job_slot, &partition, &caller, &[]).await.unwrap();
        assert_eq!(std::fs::read(parent_sysfs.path().join("uevent")).unwrap(), b"change");
    }

    #[tokio::test]
    async fn modify_partition_requires_enclosing_device() {
        let mut partition = DeviceRecord::for_test("/sys/block/sdz1", "/devices/sdz1");
        partition.is_partition = true;
        let partition = Arc::new(partition);

        let config = DkConfig::default();
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let notifier = NullNotifier;
        let registry = MapRegistry { devices: Mutex::new(HashMap::new()) };
        let ctx = HandlerContext { config: &config, registry: &registry, auth: &auth, ledger: &ledger, notifier: &notifier };

        let caller = CallerIdentity { uid: 1000 };
        let err = modify_partition(&ctx, &job_slot, &partition, &caller, "0x0c", "DATA", &[]).await.unwrap_err();
        assert!(matches!(err, DkError::General(_)));
    }
}
