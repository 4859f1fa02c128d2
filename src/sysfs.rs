//! Sysfs attribute reader (spec.md §4.1).
//!
//! Reads small ASCII attribute files from a device's sysfs directory.
//! Modeled on `Disk::read_sys*` from the teacher's disk tooling: a missing
//! file is `Ok(None)`, not an error — callers decide what "absent" means
//! for a given field (spec.md §9's open question about `0` vs "absent").

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

/// A handle onto one device's `/sys/.../<native_path>` directory.
pub struct SysfsDir {
    path: PathBuf,
}

impl SysfsDir {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        SysfsDir { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_raw(&self, attribute: &str) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path.join(attribute)) {
            Ok(mut data) => {
                if data.last() == Some(&b'\n') {
                    data.pop();
                }
                Ok(Some(data))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read a sysfs attribute as a UTF-8 string. `Ok(None)` iff the
    /// attribute file does not exist.
    pub fn read_str(&self, attribute: &str) -> Result<Option<String>, Error> {
        Ok(match self.read_raw(attribute)? {
            Some(data) => Some(String::from_utf8(data)?),
            None => None,
        })
    }

    /// Read a signed sysfs attribute, defaulting to 0 when the file is
    /// absent or unparseable (spec.md §4.1: "missing files default to 0").
    pub fn read_int(&self, attribute: &str) -> i64 {
        self.read_str(attribute)
            .ok()
            .flatten()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Read an unsigned 64-bit sysfs attribute, defaulting to 0 on any
    /// absence or parse failure.
    pub fn read_uint64(&self, attribute: &str) -> u64 {
        self.read_str(attribute)
            .ok()
            .flatten()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// True if the attribute file exists at all, regardless of content.
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.path.join(attribute).exists()
    }

    /// "drive" detection: presence of a `device` subdirectory.
    pub fn is_drive(&self) -> bool {
        self.path.join("device").is_dir()
    }

    /// "partition" detection: presence of a `start` attribute.
    pub fn is_partition(&self) -> bool {
        self.has_attribute("start")
    }
}

/// Issue the block-size ioctl (`BLKSSZGET`) on a device node, opened
/// read-only. Per spec.md §4.1: if opening fails because no medium is
/// present, the block size is 0 and probing continues; any other open or
/// ioctl failure is propagated so record construction aborts.
pub fn block_size(device_file: &Path) -> Result<u64, Error> {
    use std::fs::OpenOptions;

    let file = match OpenOptions::new().read(true).open(device_file) {
        Ok(file) => file,
        Err(err) if err.raw_os_error() == Some(libc::ENOMEDIUM) => return Ok(0),
        Err(err) => bail!("failed to open {:?}: {}", device_file, err),
    };

    let fd = file.as_raw_fd();
    let mut size: libc::c_int = 0;
    let ret = unsafe { ioctl_blksszget(fd, &mut size) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOMEDIUM) {
            return Ok(0);
        }
        bail!("BLKSSZGET ioctl failed on {:?}: {}", device_file, err);
    }

    Ok(size as u64)
}

const BLKSSZGET: libc::c_ulong = 0x1268;

unsafe fn ioctl_blksszget(fd: i32, size: *mut libc::c_int) -> i32 {
    libc::ioctl(fd, BLKSSZGET, size) as i32
}
