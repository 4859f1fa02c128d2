//! Per-device RPC methods (spec.md §4.5, §6).
//!
//! Holds the one `DaemonState` this process wires up at startup: the
//! device registry and the authorization/ledger/notifier ports, plus a
//! job slot per device. `resolve_caller` stands in for the polkit-style
//! identity resolution `devkit-disks-device.c` does via D-Bus —
//! authenticated callers carry their uid as the numeric auth id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};

use proxmox::api::router::{Router, SubdirMap};
use proxmox::api::{api, Permission, RpcEnvironment};
use proxmox::{list_subdirs_api_method, sortable};

use crate::config::DkConfig;
use crate::device::DeviceRecord;
use crate::handlers::{self, HandlerContext};
use crate::job::JobSlot;
use crate::ports::{AuthService, CallerIdentity, ChangeNotifier, DeviceRegistry, MountLedger};

pub struct DaemonState {
    pub config: DkConfig,
    pub registry: Arc<dyn DeviceRegistry>,
    pub auth: Arc<dyn AuthService>,
    pub ledger: Arc<dyn MountLedger>,
    pub notifier: Arc<dyn ChangeNotifier>,
    job_slots: Mutex<HashMap<String, Arc<JobSlot>>>,
}

static STATE: OnceCell<DaemonState> = OnceCell::new();

impl DaemonState {
    fn job_slot(&self, object_path: &str) -> Arc<JobSlot> {
        let mut slots = self.job_slots.lock().unwrap();
        slots
            .entry(object_path.to_string())
            .or_insert_with(|| Arc::new(JobSlot::default()))
            .clone()
    }
}

/// Install the daemon's collaborators. Must be called exactly once before
/// serving requests; called from `src/bin/devkitd.rs`.
pub fn init(
    config: DkConfig,
    registry: Arc<dyn DeviceRegistry>,
    auth: Arc<dyn AuthService>,
    ledger: Arc<dyn MountLedger>,
    notifier: Arc<dyn ChangeNotifier>,
) -> Result<(), Error> {
    STATE
        .set(DaemonState {
            config,
            registry,
            auth,
            ledger,
            notifier,
            job_slots: Mutex::new(HashMap::new()),
        })
        .map_err(|_| format_err!("daemon state already initialized"))
}

fn state() -> Result<&'static DaemonState, Error> {
    STATE.get().ok_or_else(|| format_err!("daemon state not initialized"))
}

fn resolve_caller(rpcenv: &dyn RpcEnvironment) -> Result<CallerIdentity, Error> {
    let auth_id = rpcenv
        .get_auth_id()
        .ok_or_else(|| format_err!("no authenticated caller"))?;
    let uid: u32 = auth_id
        .parse()
        .map_err(|_| format_err!("caller auth id {:?} is not a numeric uid", auth_id))?;
    Ok(CallerIdentity { uid })
}

fn device(object_path: &str) -> Result<Arc<DeviceRecord>, Error> {
    let state = state()?;
    handlers::require_device(state.registry.as_ref(), object_path).map_err(Error::from)
}

fn handler_context(state: &DaemonState) -> HandlerContext<'_> {
    HandlerContext {
        config: &state.config,
        registry: state.registry.as_ref(),
        auth: state.auth.as_ref(),
        ledger: state.ledger.as_ref(),
        notifier: state.notifier.as_ref(),
    }
}

#[api(
    input: {
        properties: {
            "object-path": { type: String, description: "Device object path." },
            fstype: { type: String, description: "Filesystem type, or empty for remount." },
            options: { type: Array, items: { type: String }, description: "Mount options." },
            "fstab-path": { type: String, optional: true, description: "fstab path (overridable for tests)." },
        },
    },
    returns: { type: String, description: "The mount path." },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Mount a device.
pub async fn mount(
    object_path: String,
    fstype: String,
    options: Vec<String>,
    fstab_path: Option<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);
    let fstab_path = fstab_path.unwrap_or_else(|| "/etc/fstab".to_string());

    struct SystemUserDb;
    impl crate::mount_options::UserDb for SystemUserDb {
        fn primary_gid(&self, uid: u32) -> Option<u32> {
            crate::mount_options::system_primary_gid(uid)
        }
        fn is_member(&self, uid: u32, gid: u32) -> bool {
            crate::mount_options::system_is_member(uid, gid)
        }
    }

    let result = handlers::mount::mount(
        &ctx,
        &job_slot,
        &device,
        &caller,
        &SystemUserDb,
        PathBuf::from(fstab_path).as_path(),
        handlers::mount::MountRequest { fstype, options },
    )
    .await?;

    Ok(json!(result.mount_path.to_string_lossy()))
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            options: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Unmount a device.
pub async fn unmount(
    object_path: String,
    options: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::unmount::unmount(&ctx, &job_slot, &device, &caller, &options).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            options: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Securely erase a device.
pub async fn erase(
    object_path: String,
    options: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::erase::erase(&ctx, &job_slot, &device, &caller, &options).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            fstype: { type: String },
            options: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Create a filesystem on a device.
pub async fn create_filesystem(
    object_path: String,
    fstype: String,
    options: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::filesystem::create_filesystem(&ctx, &job_slot, &device, &caller, &fstype, &options).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            scheme: { type: String },
            options: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Write a fresh partition table to a device.
pub async fn create_partition_table(
    object_path: String,
    scheme: String,
    options: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::partition_table::create_partition_table(&ctx, &job_slot, &device, &caller, &scheme, &options).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            offset: { type: u64 },
            size: { type: u64 },
            "type": { type: String },
            label: { type: String },
            flags: { type: Array, items: { type: String } },
            options: { type: Array, items: { type: String } },
            fstype: { type: String },
            fsoptions: { type: Array, items: { type: String } },
        },
    },
    returns: { type: String, description: "Object path of the new partition." },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Create a new partition, waiting for it to appear (spec.md §4.6).
pub async fn create_partition(
    object_path: String,
    offset: u64,
    size: u64,
    r#type: String,
    label: String,
    flags: Vec<String>,
    options: Vec<String>,
    fstype: String,
    fsoptions: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let caller = resolve_caller(rpcenv)?;
    let parent = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    let request = handlers::partition::CreatePartitionRequest {
        offset,
        size,
        r#type,
        label,
        flags,
        options,
        fstype,
        fsoptions,
    };

    let new_object_path =
        handlers::partition::create_partition(&ctx, &job_slot, &job_slot, &parent, &caller, request).await?;
    Ok(json!(new_object_path))
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            options: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Delete a partition.
pub async fn delete_partition(
    object_path: String,
    options: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::partition::delete_partition(&ctx, &job_slot, &device, &caller, &options).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
            "type": { type: String },
            label: { type: String },
            flags: { type: Array, items: { type: String } },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Modify an existing partition's type, label, and flags in place.
pub async fn modify_partition(
    object_path: String,
    r#type: String,
    label: String,
    flags: Vec<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::partition::modify_partition(&ctx, &job_slot, &device, &caller, &r#type, &label, &flags).await?;
    Ok(())
}

#[api(
    input: {
        properties: {
            "object-path": { type: String },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Cancel the job currently running on a device.
pub async fn cancel_job(object_path: String, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let caller = resolve_caller(rpcenv)?;
    let device = device(&object_path)?;
    let state = state()?;
    let ctx = handler_context(state);
    let job_slot = state.job_slot(&object_path);

    handlers::cancel::cancel_job(&ctx, &job_slot, &device, &caller).await?;
    Ok(())
}

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    ("cancel-job", &Router::new().post(&API_METHOD_CANCEL_JOB)),
    ("create-filesystem", &Router::new().post(&API_METHOD_CREATE_FILESYSTEM)),
    ("create-partition", &Router::new().post(&API_METHOD_CREATE_PARTITION)),
    ("create-partition-table", &Router::new().post(&API_METHOD_CREATE_PARTITION_TABLE)),
    ("delete-partition", &Router::new().post(&API_METHOD_DELETE_PARTITION)),
    ("erase", &Router::new().post(&API_METHOD_ERASE)),
    ("modify-partition", &Router::new().post(&API_METHOD_MODIFY_PARTITION)),
    ("mount", &Router::new().post(&API_METHOD_MOUNT)),
    ("unmount", &Router::new().post(&API_METHOD_UNMOUNT)),
]);

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);
