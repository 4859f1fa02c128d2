//! API router surface (spec.md §6 External interfaces).
//!
//! Each device is addressed by its object path under `/devices/`; the
//! operations below mirror the RPC surface one-for-one. Unlike the
//! privilege-table authorization this daemon's siblings use, per-call
//! authorization here is delegated to `ports::AuthService` from inside
//! each handler (spec.md §4.5 "check authorization") — the router itself
//! only gates on "is this caller known at all".

pub mod device;

use proxmox::api::router::{Router, SubdirMap};
use proxmox::{list_subdirs_api_method, sortable};

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([("devices", &device::ROUTER)]);

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);
