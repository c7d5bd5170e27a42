//! Host preconditions
//!
//! Checked once, before the first download, so a session that cannot
//! succeed leaves nothing behind.

use std::path::{Path, PathBuf};

use crate::error::FlashError;
use crate::plan::{HostRequirements, UsbId};
use crate::utils::{format_size, free_space_bytes, host_os_version, list_usb_ids};
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "sequencer::host";

/// Where attached USB devices show up on Linux
const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Facts about the machine doing the flashing
pub trait HostProbe: Send + Sync {
    /// Host OS release (`VERSION_ID`), if it can be determined
    fn os_version(&self) -> Option<String>;

    /// Free bytes on the filesystem holding `path`
    fn free_bytes(&self, path: &Path) -> Option<u64>;

    /// Whether a device with one of `ids` is attached
    fn recovery_device_present(&self, ids: &[UsbId]) -> bool;
}

/// Probe backed by `/etc/os-release`, sysfs and `statvfs`
pub struct SystemHostProbe {
    usb_devices: PathBuf,
}

impl SystemHostProbe {
    pub fn new() -> Self {
        Self {
            usb_devices: PathBuf::from(SYSFS_USB_DEVICES),
        }
    }
}

impl Default for SystemHostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SystemHostProbe {
    fn os_version(&self) -> Option<String> {
        host_os_version()
    }

    fn free_bytes(&self, path: &Path) -> Option<u64> {
        free_space_bytes(path)
    }

    fn recovery_device_present(&self, ids: &[UsbId]) -> bool {
        let attached = list_usb_ids(&self.usb_devices);
        log_debug!(MODULE, "{} USB devices attached", attached.len());
        attached
            .iter()
            .any(|&(vendor, product)| ids.iter().any(|id| id.vendor == vendor && id.product == product))
    }
}

/// Verify host OS, recovery-mode device and free space
pub fn check_preconditions(
    host: &HostRequirements,
    probe: &dyn HostProbe,
    cache_root: &Path,
) -> Result<(), FlashError> {
    if !host.supported_host_os.is_empty() {
        let version = probe.os_version().ok_or_else(|| {
            FlashError::PreconditionNotMet("could not determine the host OS version".to_string())
        })?;
        if !host.supported_host_os.contains(&version) {
            return Err(FlashError::PreconditionNotMet(format!(
                "host OS {} is not supported by this release (supported: {})",
                version,
                host.supported_host_os.join(", ")
            )));
        }
    }

    if !host.recovery_usb_ids.is_empty() && !probe.recovery_device_present(&host.recovery_usb_ids)
    {
        return Err(FlashError::PreconditionNotMet(
            "no device in forced recovery mode found; connect the board over USB and put it in recovery mode"
                .to_string(),
        ));
    }

    if host.min_free_bytes > 0 {
        match probe.free_bytes(cache_root) {
            Some(free) if free < host.min_free_bytes => {
                return Err(FlashError::PreconditionNotMet(format!(
                    "not enough free space under {}: {} available, {} required",
                    cache_root.display(),
                    format_size(free),
                    format_size(host.min_free_bytes)
                )));
            }
            Some(_) => {}
            None => log_warn!(
                MODULE,
                "Could not determine free space under {}",
                cache_root.display()
            ),
        }
    }

    log_info!(MODULE, "Host preconditions met");
    Ok(())
}
