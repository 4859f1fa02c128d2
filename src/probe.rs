//! External probe invocation (spec.md §4.1).
//!
//! The probe yields three streams from udev: key/value properties
//! (`ID_FS_*`, vendor/model/revision/serial, `PART_*`), alias symlinks
//! (partitioned into by-id/by-uuid vs. by-path), and the canonical device
//! node path. This module owns only the parsing/merge rules; the actual
//! udev query is a thin wrapper so the merge logic can be unit tested
//! against synthetic property maps.

use std::collections::HashMap;

/// Raw output of one probe run, already split the way spec.md describes.
#[derive(Debug, Default, Clone)]
pub struct ProbeResult {
    pub properties: HashMap<String, String>,
    pub device_file_by_id: Vec<String>,
    pub device_file_by_path: Vec<String>,
    pub device_node: Option<String>,
}

impl ProbeResult {
    /// Query a live udev device. `is_drive`/`is_partition` gate which
    /// fields are accepted, per spec.md's assignment rules.
    pub fn from_udev(device: &udev::Device) -> Self {
        let mut properties = HashMap::new();
        for prop in device.properties() {
            if let Some(value) = prop.value().to_str() {
                properties.insert(prop.name().to_string_lossy().into_owned(), value.to_string());
            }
        }

        let mut device_file_by_id = Vec::new();
        let mut device_file_by_path = Vec::new();
        for link in device.devlinks() {
            classify_devlink(&link.to_string_lossy(), &mut device_file_by_id, &mut device_file_by_path);
        }

        let device_node = device.devnode().map(|p| p.to_string_lossy().into_owned());

        ProbeResult {
            properties,
            device_file_by_id,
            device_file_by_path,
            device_node,
        }
    }
}

fn classify_devlink(value: &str, by_id: &mut Vec<String>, by_path: &mut Vec<String>) {
    if value.starts_with("/dev/disk/by-id/") || value.starts_with("/dev/disk/by-uuid/") {
        by_id.push(value.to_string());
    } else if value.starts_with("/dev/disk/by-path/") {
        by_path.push(value.to_string());
    }
}

/// Filesystem identity fields parsed from `ID_FS_*` properties.
#[derive(Debug, Default, Clone)]
pub struct FsIdentity {
    pub id_usage: Option<String>,
    pub id_type: Option<String>,
    pub id_version: Option<String>,
    pub id_uuid: Option<String>,
    pub id_label: Option<String>,
}

impl FsIdentity {
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        FsIdentity {
            id_usage: props.get("ID_FS_USAGE").cloned(),
            id_type: props.get("ID_FS_TYPE").cloned(),
            id_version: props.get("ID_FS_VERSION").cloned(),
            id_uuid: props.get("ID_FS_UUID").cloned(),
            id_label: props.get("ID_FS_LABEL").cloned(),
        }
    }
}

/// Drive identity fields, only meaningful (and only ever populated by the
/// caller) when `is_drive` is true — spec.md §4.1: "vendor/model/revision/
/// serial are accepted only when `is_drive`".
#[derive(Debug, Default, Clone)]
pub struct DriveIdentity {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub serial: Option<String>,
}

impl DriveIdentity {
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        DriveIdentity {
            vendor: props.get("ID_VENDOR").cloned(),
            model: props.get("ID_MODEL").cloned(),
            revision: props.get("ID_REVISION").cloned(),
            serial: props.get("ID_SERIAL_SHORT").cloned(),
        }
    }
}

/// One partition-table entry of `PART_P<n>_{OFFSET,SIZE}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionTableEntry {
    pub offset: u64,
    pub size: u64,
}

/// Everything extracted from `PART_*` properties, pre-split into the two
/// cases spec.md §4.1 describes: viewed from a partition table (array
/// fill, zero-padded up to `n`), or viewed from partition `n` itself
/// (scalar fields).
#[derive(Debug, Default, Clone)]
pub struct PartitionProbe {
    /// Set when this device is itself a partition: `PART_SCHEME`.
    pub partition_scheme: Option<String>,
    /// Set when this device is a partition table: `PART_SCHEME`.
    pub partition_table_scheme: Option<String>,
    pub partition_table_count: i64,
    pub partition_table_max_number: i64,
    pub partition_table_entries: Vec<PartitionTableEntry>,

    pub partition_label: Option<String>,
    pub partition_uuid: Option<String>,
    pub partition_type: Option<String>,
    pub partition_offset: Option<u64>,
    pub partition_size: Option<u64>,
    pub partition_flags: Vec<String>,
}

impl PartitionProbe {
    /// `is_partition`: whether this device is partition number
    /// `partition_number` of its own enclosing table (vs. a partition
    /// table itself, in which case the array-fill branch runs).
    pub fn from_properties(
        props: &HashMap<String, String>,
        is_partition: bool,
        partition_number: i64,
    ) -> Self {
        let mut out = PartitionProbe::default();

        if let Some(scheme) = props.get("PART_SCHEME") {
            if is_partition {
                out.partition_scheme = Some(scheme.clone());
            } else {
                out.partition_table_scheme = Some(scheme.clone());
            }
        }

        if let Some(count) = props.get("PART_COUNT").and_then(|v| v.parse().ok()) {
            out.partition_table_count = count;
        }

        for (key, value) in props {
            let suffix = match key.strip_prefix("PART_P") {
                Some(s) => s,
                None => continue,
            };
            let digit_end = suffix.find(|c: char| !c.is_ascii_digit()).unwrap_or(suffix.len());
            if digit_end == 0 {
                continue;
            }
            let part_number: i64 = match suffix[..digit_end].parse() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let field = &suffix[digit_end..];
            let field = match field.strip_prefix('_') {
                Some(f) => f,
                None => continue,
            };

            if !is_partition {
                if part_number > out.partition_table_max_number {
                    out.partition_table_max_number = part_number;
                }
                let index = (part_number - 1).max(0) as usize;
                if field == "OFFSET" || field == "SIZE" {
                    if out.partition_table_entries.len() <= index {
                        out.partition_table_entries
                            .resize(index + 1, PartitionTableEntry::default());
                    }
                    let value: u64 = value.parse().unwrap_or(0);
                    if field == "OFFSET" {
                        out.partition_table_entries[index].offset = value;
                    } else {
                        out.partition_table_entries[index].size = value;
                    }
                }
            } else if part_number == partition_number {
                match field {
                    "LABEL" => out.partition_label = Some(value.clone()),
                    "UUID" => out.partition_uuid = Some(value.clone()),
                    "TYPE" => out.partition_type = Some(value.clone()),
                    "OFFSET" => out.partition_offset = value.parse().ok(),
                    "SIZE" => out.partition_size = value.parse().ok(),
                    "FLAGS" => {
                        out.partition_flags =
                            value.split(',').map(|s| s.to_string()).filter(|s| !s.is_empty()).collect();
                    }
                    _ => {}
                }
            }
        }

        out
    }
}
