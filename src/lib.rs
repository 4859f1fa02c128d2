//! Block device management daemon core.
//!
//! Owns the canonical in-memory model of every block device (`device`),
//! probes it from sysfs and udev (`sysfs`, `probe`), validates mount
//! option policy (`mount_options`), and supervises the privileged helper
//! processes that actually mutate devices (`job`). `handlers` wires those
//! pieces together into the operations exposed over RPC; `api2` exposes
//! them through this daemon's API router. Collaborators this crate needs
//! but does not own — the device registry, authorization, the mount
//! ledger, change notification — are modeled as traits in `ports`.

pub mod api2;
pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod mount_options;
pub mod ports;
pub mod probe;
pub mod sysfs;
pub mod waiter;

pub mod job;
