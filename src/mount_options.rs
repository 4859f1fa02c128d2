//! Mount-options validator (spec.md §4.3).
//!
//! Pure function from (filesystem type, caller uid, requested options) to
//! an approved option string plus a set of authorization actions, or a
//! rejection. The table and precedence below are carried over verbatim
//! from `devkit-disks-device.c`'s `fs_mount_options`/`any_allow`/
//! `any_restricted`/`is_mount_option_allowed`.

use std::collections::BTreeSet;

use crate::error::DkError;

/// One filesystem's mount-option policy.
pub struct FsMountOptions {
    pub fstype: &'static str,
    pub defaults: &'static [&'static str],
    pub allow: &'static [&'static str],
    pub allow_uid_self: &'static [&'static str],
    pub allow_gid_self: &'static [&'static str],
    pub restricted: &'static [(&'static str, &'static str)],
}

pub static VFAT: FsMountOptions = FsMountOptions {
    fstype: "vfat",
    defaults: &["uid=", "gid=", "shortname=lower"],
    allow: &["utf8", "shortname=", "umask=", "dmask=", "fmask=", "codepage="],
    allow_uid_self: &["uid="],
    allow_gid_self: &["gid="],
    restricted: &[
        ("uid=", "org.freedesktop.devicekit.disks.mount-option.vfat-uid"),
        ("gid=", "org.freedesktop.devicekit.disks.mount-option.vfat-gid"),
    ],
};

static FS_TABLE: &[&FsMountOptions] = &[&VFAT];

/// Options allowed for every filesystem, regardless of the per-fs table.
static UNIVERSAL_ALLOW: &[&str] = &[
    "exec", "noexec", "nodev", "nosuid", "atime", "noatime", "nodiratime", "remount", "ro", "rw",
    "sync", "dirsync",
];

/// Options allowed for every filesystem, but only with authorization.
static UNIVERSAL_RESTRICTED: &[(&str, &str)] = &[
    ("suid", "org.freedesktop.devicekit.disks.mount-option.suid"),
    ("dev", "org.freedesktop.devicekit.disks.mount-option.dev"),
];

pub const MANDATORY_PREFIX: &str = "uhelper=devkit,nodev,nosuid";

pub fn find_fs_mount_options(fstype: &str) -> Option<&'static FsMountOptions> {
    FS_TABLE.iter().find(|fsmo| fsmo.fstype == fstype).copied()
}

/// `entry` is either a bare option (`"ro"`) or a `key=`-style prefix that
/// matches any value after the `=` (spec.md §4.3 step 2).
fn option_matches(entry: &str, option: &str) -> bool {
    match entry.strip_suffix('=') {
        Some(prefix) => option.starts_with(entry) && option.len() > prefix.len() + 1,
        None => entry == option,
    }
}

/// Look up the primary gid for a uid. Left abstract so the validator stays
/// pure and testable without a real system user database; a real daemon
/// supplies a libc `getpwuid`-backed implementation.
pub trait UserDb {
    fn primary_gid(&self, uid: u32) -> Option<u32>;
    /// True if `uid` is a member (primary or supplementary) of `gid`.
    fn is_member(&self, uid: u32, gid: u32) -> bool;
}

/// `getpwuid_r`-backed primary gid lookup for the real system password
/// database, used by the RPC layer's `UserDb` implementation.
pub fn system_primary_gid(uid: u32) -> Option<u32> {
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16384];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(uid, &mut passwd, buf.as_mut_ptr(), buf.len(), &mut result)
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(passwd.pw_gid)
}

/// `getgrouplist`-backed supplementary-group membership check.
pub fn system_is_member(uid: u32, gid: u32) -> bool {
    let primary = match system_primary_gid(uid) {
        Some(gid) => gid,
        None => return false,
    };
    if primary == gid {
        return true;
    }

    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0_i8; 16384];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe { libc::getpwuid_r(uid, &mut passwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return false;
    }

    let username = unsafe { std::ffi::CStr::from_ptr(passwd.pw_name) };
    let mut ngroups: libc::c_int = 64;
    let mut groups = vec![0 as libc::gid_t; ngroups as usize];

    let rc = unsafe {
        libc::getgrouplist(
            username.as_ptr(),
            primary as libc::gid_t,
            groups.as_mut_ptr(),
            &mut ngroups,
        )
    };
    if rc < 0 {
        groups.resize(ngroups as usize, 0);
        let rc = unsafe {
            libc::getgrouplist(
                username.as_ptr(),
                primary as libc::gid_t,
                groups.as_mut_ptr(),
                &mut ngroups,
            )
        };
        if rc < 0 {
            return false;
        }
    }
    groups.truncate(ngroups.max(0) as usize);
    groups.iter().any(|&g| g as u32 == gid)
}

/// Result of successfully validating a mount-option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOptions {
    pub mount_option_string: String,
    pub required_actions: BTreeSet<String>,
}

/// Validate `options` for filesystem `fstype` requested by `uid`, per
/// spec.md §4.3. Defaults are prepended with `uid=`/`gid=` substitution
/// before per-option admission runs.
pub fn validate(
    fstype: &str,
    uid: u32,
    options: &[String],
    user_db: &dyn UserDb,
) -> Result<ValidatedOptions, DkError> {
    let fsmo = find_fs_mount_options(fstype);

    let mut candidates: Vec<String> = Vec::new();
    if let Some(fsmo) = fsmo {
        for default in fsmo.defaults {
            if let Some(value) = substitute_default(default, uid, user_db) {
                candidates.push(value);
            }
        }
    }
    candidates.extend(options.iter().cloned());

    let mut accepted = Vec::new();
    let mut required_actions = BTreeSet::new();

    for option in candidates {
        if option.contains(',') {
            return Err(DkError::MountOptionNotAllowed(option));
        }

        if is_allowed(fsmo, &option) {
            accepted.push(option);
            continue;
        }

        if let Some(action) = requires_self_uid(fsmo, &option, uid) {
            let _ = action;
            accepted.push(option);
            continue;
        }

        if requires_self_gid(fsmo, &option, uid, user_db) {
            accepted.push(option);
            continue;
        }

        if let Some(action) = requires_authorization(fsmo, &option) {
            required_actions.insert(action.to_string());
            accepted.push(option);
            continue;
        }

        return Err(DkError::MountOptionNotAllowed(option));
    }

    let mut mount_option_string = String::from(MANDATORY_PREFIX);
    for option in &accepted {
        mount_option_string.push(',');
        mount_option_string.push_str(option);
    }

    Ok(ValidatedOptions {
        mount_option_string,
        required_actions,
    })
}

fn substitute_default(entry: &str, uid: u32, user_db: &dyn UserDb) -> Option<String> {
    if entry == "uid=" {
        return Some(format!("uid={}", uid));
    }
    if entry == "gid=" {
        return user_db.primary_gid(uid).map(|gid| format!("gid={}", gid));
    }
    Some(entry.to_string())
}

fn is_allowed(fsmo: Option<&FsMountOptions>, option: &str) -> bool {
    if let Some(fsmo) = fsmo {
        if fsmo.allow.iter().any(|entry| option_matches(entry, option)) {
            return true;
        }
    }
    UNIVERSAL_ALLOW.iter().any(|entry| option_matches(entry, option))
}

fn requires_self_uid(fsmo: Option<&FsMountOptions>, option: &str, caller_uid: u32) -> Option<()> {
    let fsmo = fsmo?;
    for prefix in fsmo.allow_uid_self {
        if let Some(rest) = option.strip_prefix(prefix) {
            if let Ok(uid) = rest.parse::<u32>() {
                if uid == caller_uid {
                    return Some(());
                }
            }
        }
    }
    None
}

fn requires_self_gid(
    fsmo: Option<&FsMountOptions>,
    option: &str,
    caller_uid: u32,
    user_db: &dyn UserDb,
) -> bool {
    let fsmo = match fsmo {
        Some(fsmo) => fsmo,
        None => return false,
    };
    for prefix in fsmo.allow_gid_self {
        if let Some(rest) = option.strip_prefix(prefix) {
            if let Ok(gid) = rest.parse::<u32>() {
                if user_db.is_member(caller_uid, gid) {
                    return true;
                }
            }
        }
    }
    false
}

fn requires_authorization<'a>(fsmo: Option<&'a FsMountOptions>, option: &str) -> Option<&'a str> {
    if let Some(fsmo) = fsmo {
        for (entry, action) in fsmo.restricted {
            if option_matches(entry, option) {
                return Some(action);
            }
        }
    }
    for (entry, action) in UNIVERSAL_RESTRICTED {
        if option_matches(entry, option) {
            return Some(action);
        }
    }
    None
}
