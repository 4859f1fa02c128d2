//! Daemon configuration.
//!
//! A single flat struct loaded from a TOML file, in the spirit of the
//! section-config pattern used elsewhere in this code base but simplified
//! since this daemon has exactly one configuration object, not a registry
//! of named sections.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

fn default_media_root() -> PathBuf {
    PathBuf::from("/media")
}

fn default_partition_wait_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DkConfig {
    /// Directory under which auto-created mount points are placed.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,

    /// How long `CreatePartition` waits for the kernel to re-scan and the
    /// enclosing daemon to publish the new child device (spec.md §4.6).
    #[serde(default = "default_partition_wait_secs")]
    pub partition_wait_secs: u64,

    /// Absolute paths to the privileged helper binaries this daemon
    /// invokes for each mutating operation.
    pub helpers: HelperPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HelperPaths {
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub erase: PathBuf,
    pub mkfs: PathBuf,
    pub part_create: PathBuf,
    pub part_delete: PathBuf,
    pub part_modify: PathBuf,
    pub part_table_create: PathBuf,
}

impl Default for HelperPaths {
    fn default() -> Self {
        HelperPaths {
            mount: PathBuf::from("/bin/mount"),
            umount: PathBuf::from("/bin/umount"),
            erase: PathBuf::from("/usr/lib/devkitd/helpers/devkitd-helper-erase"),
            mkfs: PathBuf::from("/usr/lib/devkitd/helpers/devkitd-helper-mkfs"),
            part_create: PathBuf::from("/usr/lib/devkitd/helpers/devkitd-helper-part-create"),
            part_delete: PathBuf::from("/usr/lib/devkitd/helpers/devkitd-helper-part-delete"),
            part_modify: PathBuf::from("/usr/lib/devkitd/helpers/devkitd-helper-part-modify"),
            part_table_create: PathBuf::from(
                "/usr/lib/devkitd/helpers/devkitd-helper-part-table-create",
            ),
        }
    }
}

impl Default for DkConfig {
    fn default() -> Self {
        DkConfig {
            media_root: default_media_root(),
            partition_wait_secs: default_partition_wait_secs(),
            helpers: HelperPaths::default(),
        }
    }
}

impl DkConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {:?}", path))?;
        let config: DkConfig = toml::from_str(&data)
            .with_context(|| format!("unable to parse config file {:?}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_media_root() {
        let config = DkConfig::default();
        assert_eq!(config.media_root, PathBuf::from("/media"));
        assert_eq!(config.partition_wait_secs, 10);
    }

    #[test]
    fn load_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devkitd.toml");
        std::fs::write(
            &path,
            r#"
media-root = "/run/media"
partition-wait-secs = 5

[helpers]
mount = "/bin/mount"
umount = "/bin/umount"
erase = "/opt/helpers/erase"
mkfs = "/opt/helpers/mkfs"
part-create = "/opt/helpers/part-create"
part-delete = "/opt/helpers/part-delete"
part-modify = "/opt/helpers/part-modify"
part-table-create = "/opt/helpers/part-table-create"
"#,
        )
        .unwrap();

        let config = DkConfig::load(&path).unwrap();
        assert_eq!(config.media_root, PathBuf::from("/run/media"));
        assert_eq!(config.partition_wait_secs, 5);
        assert_eq!(config.helpers.erase, PathBuf::from("/opt/helpers/erase"));
    }
}
