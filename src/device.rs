//! The canonical in-memory snapshot of one block device (spec.md §3, §4.2).

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Error};

use crate::probe::{DriveIdentity, FsIdentity, PartitionProbe};
use crate::ports::ChangeNotifier;
use crate::sysfs::{block_size, SysfsDir};

/// The seven job-related fields mirrored verbatim into "job-changed"
/// events (spec.md §3, Job state group; §6 Signals).
#[derive(Debug, Clone, PartialEq)]
pub struct JobFields {
    pub in_progress: bool,
    pub id: Option<String>,
    pub is_cancellable: bool,
    pub num_tasks: i32,
    pub cur_task: i32,
    pub cur_task_id: Option<String>,
    pub cur_task_percentage: f64,
}

impl Default for JobFields {
    fn default() -> Self {
        JobFields {
            in_progress: false,
            id: None,
            is_cancellable: false,
            num_tasks: 0,
            cur_task: 0,
            cur_task_id: None,
            cur_task_percentage: -1.0,
        }
    }
}

/// Partition-table-derived arrays (spec.md §3, Partition table group).
#[derive(Debug, Clone, Default)]
pub struct PartitionTableInfo {
    pub scheme: Option<String>,
    pub count: i64,
    pub max_number: i64,
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
}

/// Partition-derived fields (spec.md §3, Partition group).
#[derive(Debug, Clone, Default)]
pub struct PartitionInfo {
    pub slave: Option<String>,
    pub scheme: Option<String>,
    pub number: i64,
    pub offset: u64,
    pub size: u64,
    pub r#type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub flags: Vec<String>,
}

/// Mutable fields updated by mount/unmount handlers and the job engine.
/// Everything else is fixed at construction / refreshed wholesale on a
/// "changed" probe re-run.
#[derive(Debug, Clone, Default)]
struct MutableState {
    is_mounted: bool,
    mount_path: Option<PathBuf>,
    job: JobFields,
}

/// One block device, observable via RPC. Constructed with
/// `(native_path)`; populates itself from sysfs + udev probe and fails
/// construction on probe failure (spec.md §3 Lifecycle).
pub struct DeviceRecord {
    pub native_path: PathBuf,
    pub device_file: PathBuf,
    pub device_file_by_id: Vec<String>,
    pub device_file_by_path: Vec<String>,
    pub object_path: String,

    pub is_drive: bool,
    pub is_removable: bool,
    pub is_media_available: bool,
    pub size: u64,
    pub block_size: u64,

    pub id_usage: Option<String>,
    pub id_type: Option<String>,
    pub id_version: Option<String>,
    pub id_uuid: Option<String>,
    pub id_label: Option<String>,

    pub vendor: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub serial: Option<String>,

    pub is_partition: bool,
    pub partition: PartitionInfo,

    pub is_partition_table: bool,
    pub partition_table: PartitionTableInfo,

    state: RwLock<MutableState>,
}

/// Derive the stable object path for a native sysfs path: the basename
/// with `-` mapped to `_`, under `/devices/` (spec.md §3). Idempotent:
/// applying it to an already-derived basename is a fixed point, since no
/// `-` remains after the first pass.
pub fn compute_object_path(native_path: &Path) -> String {
    let basename = native_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("/devices/{}", basename.replace('-', "_"))
}

impl DeviceRecord {
    /// Populate a `DeviceRecord` from sysfs plus a udev probe. Aborts (by
    /// returning `Err`) if the probe query fails — spec.md §3: "aborts
    /// construction on probe failure".
    pub fn from_sysfs_and_probe(native_path: PathBuf) -> Result<Self, Error> {
        let sysfs = SysfsDir::new(&native_path);

        let device = udev::Device::from_syspath(&native_path)
            .map_err(|err| anyhow::anyhow!("udev probe failed for {:?}: {}", native_path, err))?;
        let probe = crate::probe::ProbeResult::from_udev(&device);

        let device_file = probe
            .device_node
            .clone()
            .map(PathBuf::from)
            .unwrap_or_default();

        let is_drive = sysfs.is_drive();
        let is_partition = sysfs.is_partition();

        if is_drive && is_partition {
            bail!(
                "device {:?} reports both a `device` subdirectory and a `start` \
                 attribute; cannot be both a drive and a partition",
                native_path
            );
        }

        let is_removable = sysfs.read_int("removable") != 0;
        let size = sysfs.read_uint64("size") * 512;

        let block_size = if is_drive || !is_partition {
            block_size(&device_file).unwrap_or(0)
        } else {
            0
        };

        let is_media_available = probe
            .properties
            .get("MEDIA_AVAILABLE")
            .map(|v| v == "1")
            .unwrap_or(!is_removable);

        let fs = FsIdentity::from_properties(&probe.properties);

        let drive = if is_drive {
            DriveIdentity::from_properties(&probe.properties)
        } else {
            DriveIdentity::default()
        };

        // `start`/`size` in 512-byte units regardless of actual block size
        // (spec.md §3 invariant).
        let partition_number = sysfs.read_int("partition");
        let partition_probe =
            PartitionProbe::from_properties(&probe.properties, is_partition, partition_number);

        let mut partition = PartitionInfo::default();
        let mut partition_table = PartitionTableInfo::default();
        let mut is_partition_table = false;

        if is_partition {
            partition.number = partition_number;
            partition.offset = sysfs.read_uint64("start") * 512;
            partition.size = sysfs.read_uint64("size") * 512;
            partition.scheme = partition_probe.partition_scheme;
            partition.r#type = partition_probe.partition_type;
            partition.uuid = partition_probe.partition_uuid;
            partition.label = partition_probe.partition_label;
            partition.flags = partition_probe.partition_flags;
            partition.slave = probe.properties.get("PART_SLAVE").cloned();
        } else if partition_probe.partition_table_scheme.is_some() {
            is_partition_table = true;
            partition_table.scheme = partition_probe.partition_table_scheme;
            partition_table.count = partition_probe.partition_table_count;
            partition_table.max_number = partition_probe.partition_table_max_number;
            partition_table.offsets =
                partition_probe.partition_table_entries.iter().map(|e| e.offset).collect();
            partition_table.sizes =
                partition_probe.partition_table_entries.iter().map(|e| e.size).collect();
        }

        let object_path = compute_object_path(&native_path);

        Ok(DeviceRecord {
            native_path,
            device_file,
            device_file_by_id: probe.device_file_by_id,
            device_file_by_path: probe.device_file_by_path,
            object_path,
            is_drive,
            is_removable,
            is_media_available,
            size,
            block_size,
            id_usage: fs.id_usage,
            id_type: fs.id_type,
            id_version: fs.id_version,
            id_uuid: fs.id_uuid,
            id_label: fs.id_label,
            vendor: drive.vendor,
            model: drive.model,
            revision: drive.revision,
            serial: drive.serial,
            is_partition,
            partition,
            is_partition_table,
            partition_table,
            state: RwLock::new(MutableState::default()),
        })
    }

    /// Build a record directly from already-probed fields, for tests and
    /// for fixtures that do not have a real sysfs/udev tree available.
    #[cfg(test)]
    pub fn for_test(native_path: &str, object_path: &str) -> Self {
        DeviceRecord {
            native_path: PathBuf::from(native_path),
            device_file: PathBuf::new(),
            device_file_by_id: Vec::new(),
            device_file_by_path: Vec::new(),
            object_path: object_path.to_string(),
            is_drive: false,
            is_removable: false,
            is_media_available: true,
            size: 0,
            block_size: 512,
            id_usage: None,
            id_type: None,
            id_version: None,
            id_uuid: None,
            id_label: None,
            vendor: None,
            model: None,
            revision: None,
            serial: None,
            is_partition: false,
            partition: PartitionInfo::default(),
            is_partition_table: false,
            partition_table: PartitionTableInfo::default(),
            state: RwLock::new(MutableState::default()),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.state.read().unwrap().is_mounted
    }

    pub fn mount_path(&self) -> Option<PathBuf> {
        self.state.read().unwrap().mount_path.clone()
    }

    pub fn job_fields(&self) -> JobFields {
        self.state.read().unwrap().job.clone()
    }

    pub fn job_in_progress(&self) -> bool {
        self.state.read().unwrap().job.in_progress
    }

    /// Set mount state and publish "changed" (spec.md §4.5 handler
    /// completions).
    pub fn set_mounted(&self, path: Option<PathBuf>, notifier: &dyn ChangeNotifier) {
        {
            let mut state = self.state.write().unwrap();
            state.is_mounted = path.is_some();
            state.mount_path = path;
        }
        notifier.changed(&self.object_path);
    }

    /// Start tracking a new job; fails the invariant check if one is
    /// already active — callers (the job engine) are expected to have
    /// already serialized this via the per-device job slot, so this is an
    /// assertion rather than a public API for starting jobs.
    pub(crate) fn set_job_running(
        &self,
        id: String,
        is_cancellable: bool,
        notifier: &dyn ChangeNotifier,
    ) {
        {
            let mut state = self.state.write().unwrap();
            state.job = JobFields {
                in_progress: true,
                id: Some(id),
                is_cancellable,
                num_tasks: 0,
                cur_task: 0,
                cur_task_id: None,
                cur_task_percentage: -1.0,
            };
        }
        notifier.job_changed(&self.object_path, self.job_fields());
    }

    pub(crate) fn update_job_progress(
        &self,
        cur_task: i32,
        num_tasks: i32,
        cur_task_percentage: f64,
        cur_task_id: String,
        notifier: &dyn ChangeNotifier,
    ) {
        {
            let mut state = self.state.write().unwrap();
            state.job.cur_task = cur_task;
            state.job.num_tasks = num_tasks;
            state.job.cur_task_percentage = cur_task_percentage;
            state.job.cur_task_id = Some(cur_task_id);
        }
        notifier.job_changed(&self.object_path, self.job_fields());
    }

    pub(crate) fn clear_job(&self, notifier: &dyn ChangeNotifier) {
        {
            let mut state = self.state.write().unwrap();
            state.job = JobFields::default();
        }
        notifier.job_changed(&self.object_path, self.job_fields());
    }
}
