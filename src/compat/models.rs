//! Compatibility table data models
//!
//! Types for the user's selection and the table rows it is resolved against.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::plan::ArtifactKind;

/// Default top-level directory of an extracted Jetson BSP
pub const DEFAULT_BSP_DIR: &str = "Linux_for_Tegra";

fn default_bsp_dir() -> String {
    DEFAULT_BSP_DIR.to_string()
}

/// The operator's device/version/storage selection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSelector {
    pub vendor: String,
    pub product: String,
    pub module: String,
    pub release_version: String,
    pub storage: String,
}

/// One row of the compatibility table
///
/// A row is one supported (vendor, product, module, release, storage)
/// combination plus everything needed to flash it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRow {
    pub vendor: String,
    pub product: String,
    pub module: String,
    pub release_version: String,
    pub storage: String,
    /// Internal device family tag shared by products with one flashing procedure
    pub family: String,
    /// Board configuration name handed to the flash tool
    pub board: String,
    /// Device or partition the flash tool targets (e.g. `nvme0n1p1`, `mmcblk0p1`)
    pub storage_device: String,
    /// Directory the BSP archive extracts into
    #[serde(default = "default_bsp_dir")]
    pub bsp_dir: String,
    /// Download URL per artifact kind
    pub urls: IndexMap<ArtifactKind, String>,
    /// Expected SHA-256 per artifact kind, when published
    #[serde(default)]
    pub checksums: IndexMap<ArtifactKind, String>,
}

impl CompatibilityRow {
    /// Whether the row belongs to the given device triple
    pub fn matches_device(&self, vendor: &str, product: &str, module: &str) -> bool {
        self.vendor == vendor && self.product == product && self.module == module
    }
}
