//! `Erase` (spec.md §4.5, §6).

use std::sync::Arc;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_ERASE: &str = "org.freedesktop.devicekit.disks.erase";

pub async fn erase(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    device: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    options: &[String],
) -> Result<(), DkError> {
    if device.is_mounted() {
        return Err(DkError::Mounted);
    }

    if !ctx
        .auth
        .check(caller, ACTION_ERASE)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("erase not authorized".to_string()));
    }

    let mut argv = vec![ctx.config.helpers.erase.to_string_lossy().into_owned()];
    argv.extend(options.iter().cloned());
    argv.push(device.device_file.to_string_lossy().into_owned());

    let outcome = job_slot
        .start(device, "Erase".to_string(), true, &argv, ctx.notifier, caller.uid)
        .await?;
    outcome.into_result()?;

    super::trigger_kernel_change(&device.native_path).map_err(|err| DkError::General(err.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DkConfig;
    use crate::device::JobFields;
    use crate::ports::{AuthService, ChangeNotifier, DeviceAdded, DeviceRegistry, MountLedger};
    use std::path::{Path, PathBuf};

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
    struct EmptyRegistry;
    impl DeviceRegistry for EmptyRegistry {
        fn lookup(&self, _object_path: &str) -> Option<Arc<DeviceRecord>> {
            None
        }
        fn subscribe_added(
            &self,
            _predicate: Box<dyn Fn(&DeviceAdded) -> bool + Send + Sync>,
        ) -> tokio::sync::oneshot::Receiver<String> {
            tokio::sync::oneshot::channel().1
        }
    }

    #[tokio::test]
    async fn erase_rejects_when_mounted() {
        let device = DeviceRecord::for_test("/sys/block/sdz1", "/devices/sdz1");
        let notifier = NullNotifier;
        device.set_mounted(Some(PathBuf::from("/media/x")), &notifier);
        let device = Arc::new(device);

        let config = DkConfig::default();
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let registry = EmptyRegistry;

        let ctx = HandlerContext {
            config: &config,
            registry: &registry,
            auth: &auth,
            ledger: &ledger,
            notifier: &notifier,
        };

        let caller = CallerIdentity { uid: 1000 };
        let err = erase(&ctx, &job_slot, &device, &caller, &[]).await.unwrap_err();
        assert!(matches!(err, DkError::Mounted));
    }

    #[tokio::test]
    async fn erase_runs_helper_and_triggers_change() {
        let sysfs_dir = tempfile::tempdir().unwrap();
        std::fs::write(sysfs_dir.path().join("uevent"), b"").unwrap();

        let mut device = DeviceRecord::for_test("/sys/block/sdz1", "/devices/sdz1");
        device.native_path = sysfs_dir.path().to_path_buf();
        let device = Arc::new(device);

        let mut config = DkConfig::default();
        config.helpers.erase = PathBuf::from("/bin/true");
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = NullLedger;
        let notifier = NullNotifier;
        let registry = EmptyRegistry;

        let ctx = HandlerContext {
            config: &config,
            registry: &registry,
            auth: &auth,
            ledger: &ledger,
            notifier: &notifier,
        };

        let caller = CallerIdentity { uid: 1000 };
        erase(&ctx, &job_slot, &device, &caller, &[]).await.unwrap();
        assert_eq!(std::fs::read(sysfs_dir.path().join("uevent")).unwrap(), b"change");
    }
}
