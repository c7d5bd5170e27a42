//! Cascading option queries
//!
//! Each level narrows the previous one: vendor -> product -> module ->
//! release -> storage. Values keep table order and are de-duplicated.

use indexmap::IndexSet;

use super::models::CompatibilityRow;
use super::CompatibilityTable;

fn unique<'a>(
    rows: impl Iterator<Item = &'a CompatibilityRow>,
    field: impl Fn(&'a CompatibilityRow) -> &'a str,
) -> Vec<String> {
    rows.map(field)
        .collect::<IndexSet<&str>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// All vendors in the table
pub fn vendors(table: &dyn CompatibilityTable) -> Vec<String> {
    unique(table.rows().iter(), |r| r.vendor.as_str())
}

/// Products offered by a vendor
pub fn products(table: &dyn CompatibilityTable, vendor: &str) -> Vec<String> {
    unique(
        table.rows().iter().filter(|r| r.vendor == vendor),
        |r| r.product.as_str(),
    )
}

/// Modules available for a vendor's product
pub fn modules(table: &dyn CompatibilityTable, vendor: &str, product: &str) -> Vec<String> {
    unique(
        table
            .rows()
            .iter()
            .filter(|r| r.vendor == vendor && r.product == product),
        |r| r.module.as_str(),
    )
}

/// Release versions supported by a device
pub fn release_versions(
    table: &dyn CompatibilityTable,
    vendor: &str,
    product: &str,
    module: &str,
) -> Vec<String> {
    unique(table.lookup(vendor, product, module).into_iter(), |r| {
        r.release_version.as_str()
    })
}

/// Storage targets supported by a device at a release
pub fn storage_options(
    table: &dyn CompatibilityTable,
    vendor: &str,
    product: &str,
    module: &str,
    release_version: &str,
) -> Vec<String> {
    unique(
        table
            .lookup(vendor, product, module)
            .into_iter()
            .filter(|r| r.release_version == release_version),
        |r| r.storage.as_str(),
    )
}
