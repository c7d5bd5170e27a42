//! Host system queries
//!
//! Thin wrappers over `/etc/os-release`, sysfs and `statvfs` used by the
//! host precondition checks.

use std::path::Path;

use crate::log_debug;

const MODULE: &str = "utils::system";

/// Returns true when the process runs with effective uid 0
#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

/// Parse `VERSION_ID` out of os-release content (e.g. `"22.04"`)
pub fn parse_os_release_version(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        line.trim()
            .strip_prefix("VERSION_ID=")
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Host OS version from `/etc/os-release`
pub fn host_os_version() -> Option<String> {
    let content = std::fs::read_to_string("/etc/os-release").ok()?;
    let version = parse_os_release_version(&content);
    log_debug!(MODULE, "Host OS version: {:?}", version);
    version
}

/// Free bytes available to unprivileged users on the filesystem holding `path`
///
/// Walks up to the nearest existing ancestor, so a not-yet-created cache
/// root still reports the space of its parent filesystem.
#[cfg(target_os = "linux")]
pub fn free_space_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn free_space_bytes(_path: &Path) -> Option<u64> {
    None
}

/// Parse a sysfs hex id file (`idVendor`, `idProduct`)
pub fn parse_usb_id(content: &str) -> Option<u16> {
    u16::from_str_radix(content.trim(), 16).ok()
}

/// List (vendor, product) ids of attached USB devices from sysfs
pub fn list_usb_ids(sysfs_root: &Path) -> Vec<(u16, u16)> {
    let Ok(entries) = std::fs::read_dir(sysfs_root) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let dir = entry.path();
            let vendor = std::fs::read_to_string(dir.join("idVendor")).ok()?;
            let product = std::fs::read_to_string(dir.join("idProduct")).ok()?;
            Some((parse_usb_id(&vendor)?, parse_usb_id(&product)?))
        })
        .collect()
}
