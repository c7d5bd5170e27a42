//! Compatibility table
//!
//! Read-only mapping from (vendor, product, module, release, storage) to the
//! metadata needed to flash that combination. The core only needs lookup by
//! device triple; [`JsonTable`] is the bundled loader.

pub mod filters;
mod models;

pub use models::{CompatibilityRow, DeviceSelector, DEFAULT_BSP_DIR};

use std::path::Path;

use crate::{log_error, log_info};

const MODULE: &str = "compat";

/// Lookup capability the resolver needs from the table
pub trait CompatibilityTable: Send + Sync {
    /// Every row, in table order
    fn rows(&self) -> &[CompatibilityRow];

    /// Rows for one (vendor, product, module) triple
    fn lookup(&self, vendor: &str, product: &str, module: &str) -> Vec<&CompatibilityRow> {
        self.rows()
            .iter()
            .filter(|row| row.matches_device(vendor, product, module))
            .collect()
    }
}

/// Table shipped with the binary, used when no table file is installed
pub const BUNDLED_TABLE: &str = include_str!("../../data/compatibility.json");

/// Table loaded from a JSON array of rows
#[derive(Debug, Clone, Default)]
pub struct JsonTable {
    rows: Vec<CompatibilityRow>,
}

impl JsonTable {
    pub fn new(rows: Vec<CompatibilityRow>) -> Self {
        Self { rows }
    }

    /// Parse a table from JSON text
    pub fn from_json(content: &str) -> Result<Self, String> {
        let rows: Vec<CompatibilityRow> = serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse compatibility table: {}", e))?;
        Ok(Self::new(rows))
    }

    /// Load a table from a JSON file
    pub fn load(path: &Path) -> Result<Self, String> {
        log_info!(MODULE, "Loading compatibility table from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            log_error!(MODULE, "Failed to read {}: {}", path.display(), e);
            format!("Could not load device configuration data: {}", e)
        })?;
        let table = Self::from_json(&content)?;
        log_info!(MODULE, "Loaded {} compatibility entries", table.rows.len());
        Ok(table)
    }

    pub fn bundled() -> Result<Self, String> {
        Self::from_json(BUNDLED_TABLE)
    }

    /// Load `path`, or the bundled table if no file exists there
    pub fn load_or_bundled(path: &Path) -> Result<Self, String> {
        if path.exists() {
            return Self::load(path);
        }
        log_info!(
            MODULE,
            "No compatibility table at {}, using the bundled table",
            path.display()
        );
        Self::bundled()
    }
}

impl CompatibilityTable for JsonTable {
    fn rows(&self) -> &[CompatibilityRow] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ArtifactKind;

    const SAMPLE: &str = r#"[
        {
            "vendor": "NVIDIA", "product": "Jetson Orin Nano Devkit", "module": "Orin Nano 8GB",
            "release_version": "6.2", "storage": "nvme", "family": "t234",
            "board": "jetson-orin-nano-devkit", "storage_device": "nvme0n1p1",
            "urls": { "BSP": "https://example.com/bsp.tbz2", "ROOTFS": "https://example.com/rootfs.tbz2" }
        },
        {
            "vendor": "NVIDIA", "product": "Jetson Orin Nano Devkit", "module": "Orin Nano 8GB",
            "release_version": "6.2", "storage": "sd", "family": "t234",
            "board": "jetson-orin-nano-devkit", "storage_device": "mmcblk0p1",
            "urls": { "BSP": "https://example.com/bsp.tbz2", "ROOTFS": "https://example.com/rootfs.tbz2" }
        },
        {
            "vendor": "NVIDIA", "product": "Jetson Orin Nano Devkit", "module": "Orin Nano 8GB",
            "release_version": "5.1.3", "storage": "sd", "family": "t234",
            "board": "jetson-orin-nano-devkit", "storage_device": "mmcblk0p1",
            "urls": { "BSP": "https://example.com/bsp5.tbz2" }
        },
        {
            "vendor": "Acme", "product": "P1", "module": "M2",
            "release_version": "6.2", "storage": "external-ssd", "family": "acme-m",
            "board": "acme-p1-m2", "storage_device": "nvme0n1p1", "bsp_dir": "Acme_BSP",
            "urls": { "BSP": "https://example.com/acme-bsp.tar.gz" }
        }
    ]"#;

    #[test]
    fn test_load_json_table() {
        let table = JsonTable::from_json(SAMPLE).unwrap();
        assert_eq!(table.rows().len(), 4);
        assert_eq!(table.rows()[0].bsp_dir, DEFAULT_BSP_DIR);
        assert_eq!(table.rows()[3].bsp_dir, "Acme_BSP");
        assert!(table.rows()[0].urls.contains_key(&ArtifactKind::RootFs));
    }

    #[test]
    fn test_lookup_by_device() {
        let table = JsonTable::from_json(SAMPLE).unwrap();
        assert_eq!(
            table
                .lookup("NVIDIA", "Jetson Orin Nano Devkit", "Orin Nano 8GB")
                .len(),
            3
        );
        assert!(table.lookup("NVIDIA", "Jetson Orin Nano Devkit", "AGX").is_empty());
    }

    #[test]
    fn test_cascading_filters() {
        let table = JsonTable::from_json(SAMPLE).unwrap();
        assert_eq!(filters::vendors(&table), vec!["NVIDIA", "Acme"]);
        assert_eq!(filters::products(&table, "Acme"), vec!["P1"]);
        assert_eq!(
            filters::modules(&table, "NVIDIA", "Jetson Orin Nano Devkit"),
            vec!["Orin Nano 8GB"]
        );
        assert_eq!(
            filters::release_versions(&table, "NVIDIA", "Jetson Orin Nano Devkit", "Orin Nano 8GB"),
            vec!["6.2", "5.1.3"]
        );
        assert_eq!(
            filters::storage_options(
                &table,
                "NVIDIA",
                "Jetson Orin Nano Devkit",
                "Orin Nano 8GB",
                "6.2"
            ),
            vec!["nvme", "sd"]
        );
    }

    #[test]
    fn test_missing_table_file_falls_back_to_bundled() {
        let dir = tempfile::tempdir().unwrap();
        let table = JsonTable::load_or_bundled(&dir.path().join("compatibility.json")).unwrap();
        assert!(!table.rows().is_empty());
        assert_eq!(filters::vendors(&table), vec!["NVIDIA"]);

        let path = dir.path().join("site.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let table = JsonTable::load_or_bundled(&path).unwrap();
        assert_eq!(table.rows().len(), 4);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(JsonTable::from_json("[{\"vendor\": 1}]").is_err());
    }
}
