//! `Mount` (spec.md §4.5, §6).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::device::DeviceRecord;
use crate::error::DkError;
use crate::job::JobSlot;
use crate::mount_options::{self, UserDb};
use crate::ports::CallerIdentity;

use super::HandlerContext;

const ACTION_MOUNT: &str = "org.freedesktop.devicekit.disks.mount";

pub struct MountRequest {
    pub fstype: String,
    pub options: Vec<String>,
}

pub struct MountResult {
    pub mount_path: PathBuf,
}

/// Run the `Mount` RPC. `fstab_path` is injected (rather than hardcoded
/// to `/etc/fstab`) purely so tests can exercise the precondition without
/// a real system fstab.
pub async fn mount(
    ctx: &HandlerContext<'_>,
    job_slot: &Arc<JobSlot>,
    device: &Arc<DeviceRecord>,
    caller: &CallerIdentity,
    user_db: &dyn UserDb,
    fstab_path: &Path,
    request: MountRequest,
) -> Result<MountResult, DkError> {
    let is_remount = request.options.iter().any(|o| o == "remount");

    if device.id_usage.as_deref() != Some("filesystem") {
        return Err(DkError::NotMountable);
    }

    if super::is_device_in_fstab(&device.device_file, fstab_path) {
        return Err(DkError::FstabEntry);
    }

    if device.is_mounted() && !is_remount {
        return Err(DkError::Mounted);
    }

    if is_remount {
        if !device.is_mounted() || device.mount_path().is_none() {
            return Err(DkError::CannotRemount("device is not mounted".to_string()));
        }
        if !request.fstype.is_empty() {
            return Err(DkError::CannotRemount(
                "cannot remount with a different file system type".to_string(),
            ));
        }
    }

    let fstype = if is_remount {
        String::new()
    } else {
        request.fstype.clone()
    };
    let validator_fstype = if is_remount {
        device.id_type.clone().unwrap_or_default()
    } else {
        request.fstype.clone()
    };

    let validated = mount_options::validate(&validator_fstype, caller.uid, &request.options, user_db)?;

    for action in &validated.required_actions {
        if !ctx
            .auth
            .check(caller, action)
            .await
            .map_err(|err| DkError::General(err.to_string()))?
        {
            return Err(DkError::MountOptionNotAllowed(format!(
                "authorization denied for action {}",
                action
            )));
        }
    }

    if !ctx
        .auth
        .check(caller, ACTION_MOUNT)
        .await
        .map_err(|err| DkError::General(err.to_string()))?
    {
        return Err(DkError::General("mount not authorized".to_string()));
    }

    let (mount_path, argv, created_dir) = if is_remount {
        let mount_path = device.mount_path().unwrap();
        let argv = vec![
            ctx.config.helpers.mount.to_string_lossy().into_owned(),
            "-o".to_string(),
            validated.mount_option_string.clone(),
            mount_path.to_string_lossy().into_owned(),
        ];
        (mount_path, argv, false)
    } else {
        let mount_path =
            super::choose_and_create_mount_dir(&ctx.config.media_root, device).map_err(|err| {
                DkError::General(format!("failed to create mount point: {}", err))
            })?;
        let argv = vec![
            ctx.config.helpers.mount.to_string_lossy().into_owned(),
            "-t".to_string(),
            fstype,
            "-o".to_string(),
            validated.mount_option_string.clone(),
            device.device_file.to_string_lossy().into_owned(),
            mount_path.to_string_lossy().into_owned(),
        ];
        (mount_path, argv, true)
    };

    let outcome = job_slot
        .start(device, "Mount".to_string(), false, &argv, ctx.notifier, caller.uid)
        .await?;

    match outcome.into_result() {
        Ok(_) => {
            device.set_mounted(Some(mount_path.clone()), ctx.notifier);
            ctx.ledger
                .add(&device.device_file, caller.uid, created_dir)
                .map_err(|err| DkError::General(err.to_string()))?;
            Ok(MountResult { mount_path })
        }
        Err(err) => {
            if created_dir {
                let _ = std::fs::remove_dir(&mount_path);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DkConfig;
    use crate::device::JobFields;
    use crate::ports::{AuthService, ChangeNotifier, DeviceAdded, DeviceRegistry, MountLedger};
    use std::sync::Mutex;

    struct FakeUserDb;
    impl UserDb for FakeUserDb {
        fn primary_gid(&self, _uid: u32) -> Option<u32> {
            Some(1000)
        }
        fn is_member(&self, _uid: u32, _gid: u32) -> bool {
            true
        }
    }

    struct AllowAllAuth;
    #[async_trait::async_trait]
    impl AuthService for AllowAllAuth {
        async fn check(&self, _caller: &CallerIdentity, _action: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        added: Mutex<Vec<(PathBuf, u32, bool)>>,
    }
    impl MountLedger for FakeLedger {
        fn has_device(&self, _device_file: &Path) -> Option<(u32, bool)> {
            None
        }
        fn add(&self, device_file: &Path, uid: u32, remove_dir_on_unmount: bool) -> anyhow::Result<()> {
            self.added.lock().unwrap().push((device_file.to_path_buf(), uid, remove_dir_on_unmount));
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

    fn vfat_device(dir: &std::path::Path) -> Arc<DeviceRecord> {
        let mut device = DeviceRecord::for_test("/sys/block/sdz1", "/devices/sdz1");
        device.id_usage = Some("filesystem".to_string());
        device.id_type = Some("vfat".to_string());
        device.id_label = Some("USB".to_string());
        device.device_file = dir.join("sdz1");
        std::fs::write(&device.device_file, b"").unwrap();
        Arc::new(device)
    }

    #[tokio::test]
    async fn mount_vfat_with_default_options_scenario_1() {
        let media_root = tempfile::tempdir().unwrap();
        let device_dir = tempfile::tempdir().unwrap();
        let fstab = tempfile::NamedTempFile::new().unwrap();

        let mut config = DkConfig::default();
        config.media_root = media_root.path().to_path_buf();
        config.helpers.mount = PathBuf::from("/bin/true");

        let device = vfat_device(device_dir.path());
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = FakeLedger::default();
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
        let request = MountRequest { fstype: "vfat".to_string(), options: Vec::new() };

        let result = mount(
            &ctx,
            &job_slot,
            &device,
            &caller,
            &FakeUserDb,
            fstab.path(),
            request,
        )
        .await
        .unwrap();

        assert_eq!(result.mount_path, media_root.path().join("USB"));
        assert!(device.is_mounted());
        assert_eq!(ledger.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mount_point_collision_gets_underscore_suffix_scenario_2() {
        let media_root = tempfile::tempdir().unwrap();
        std::fs::create_dir(media_root.path().join("USB")).unwrap();

        let device_dir = tempfile::tempdir().unwrap();
        let fstab = tempfile::NamedTempFile::new().unwrap();

        let mut config = DkConfig::default();
        config.media_root = media_root.path().to_path_buf();
        config.helpers.mount = PathBuf::from("/bin/true");

        let device = vfat_device(device_dir.path());
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = FakeLedger::default();
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
        let request = MountRequest { fstype: "vfat".to_string(), options: Vec::new() };

        let result = mount(&ctx, &job_slot, &device, &caller, &FakeUserDb, fstab.path(), request)
            .await
            .unwrap();

        assert_eq!(result.mount_path, media_root.path().join("USB_"));
    }

    #[tokio::test]
    async fn mount_with_comma_option_is_rejected() {
        let media_root = tempfile::tempdir().unwrap();
        let device_dir = tempfile::tempdir().unwrap();
        let fstab = tempfile::NamedTempFile::new().unwrap();

        let mut config = DkConfig::default();
        config.media_root = media_root.path().to_path_buf();

        let device = vfat_device(device_dir.path());
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = FakeLedger::default();
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
        let request = MountRequest { fstype: "vfat".to_string(), options: vec!["ro,exec".to_string()] };

        let err = mount(&ctx, &job_slot, &device, &caller, &FakeUserDb, fstab.path(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, DkError::MountOptionNotAllowed(_)));
    }

    #[tokio::test]
    async fn remount_without_prior_mount_fails() {
        let media_root = tempfile::tempdir().unwrap();
        let device_dir = tempfile::tempdir().unwrap();
        let fstab = tempfile::NamedTempFile::new().unwrap();

        let mut config = DkConfig::default();
        config.media_root = media_root.path().to_path_buf();

        let device = vfat_device(device_dir.path());
        let job_slot = super::super::new_job_slot();
        let auth = AllowAllAuth;
        let ledger = FakeLedger::default();
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
        let request = MountRequest { fstype: String::new(), options: vec!["remount".to_string()] };

        let err = mount(&ctx, &job_slot, &device, &caller, &FakeUserDb, fstab.path(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, DkError::CannotRemount(_)));
    }
}
