//! Read-only queries: cascading options and plan preview

use cordatus_flash::compat::{filters, DeviceSelector};
use cordatus_flash::plan::FlashOptions;
use cordatus_flash::log_info;

use super::AppContext;

const MODULE: &str = "commands::query";

/// Print the choices one level below the given selection
pub fn options(
    ctx: &AppContext,
    vendor: Option<&str>,
    product: Option<&str>,
    module: Option<&str>,
    release: Option<&str>,
) {
    let table = ctx.table.as_ref();
    let (level, values) = match (vendor, product, module, release) {
        (Some(v), Some(p), Some(m), Some(r)) => {
            ("storage", filters::storage_options(table, v, p, m, r))
        }
        (Some(v), Some(p), Some(m), None) => {
            ("release", filters::release_versions(table, v, p, m))
        }
        (Some(v), Some(p), None, _) => ("module", filters::modules(table, v, p)),
        (Some(v), None, _, _) => ("product", filters::products(table, v)),
        (None, _, _, _) => ("vendor", filters::vendors(table)),
    };

    log_info!(MODULE, "{} {} options", values.len(), level);
    for value in values {
        println!("{}", value);
    }
}

/// Resolve and print a plan without touching the cache
pub fn plan(
    ctx: &AppContext,
    selector: &DeviceSelector,
    options: &FlashOptions,
) -> Result<(), String> {
    let plan = ctx
        .resolver()
        .resolve(selector, options)
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&plan)
        .map_err(|e| format!("Failed to serialize plan: {}", e))?;
    println!("{}", json);
    Ok(())
}
