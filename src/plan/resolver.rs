//! Configuration resolver
//!
//! Turns a [`DeviceSelector`] into a [`FlashPlan`]. Pure: reads the table
//! snapshot and rule set, touches nothing else.

use std::sync::Arc;

use super::models::{
    substitute, Artifact, ArchiveFormat, ExtractStep, FlashOptions, FlashPlan, PrepareStep,
    StorageClass, TemplateVars,
};
use super::rules::{FamilyRule, RuleSet, StorageFilter};
use crate::compat::{CompatibilityRow, CompatibilityTable, DeviceSelector};
use crate::error::ResolutionError;
use crate::utils::extract_filename;
use crate::{log_debug, log_info, log_warn};

const MODULE: &str = "plan::resolver";

pub struct ConfigResolver {
    table: Arc<dyn CompatibilityTable>,
    rules: RuleSet,
}

impl ConfigResolver {
    pub fn new(table: Arc<dyn CompatibilityTable>, rules: RuleSet) -> Self {
        Self { table, rules }
    }

    /// Resolve a selection into a plan
    ///
    /// Identical inputs always produce identical plans: every list in the
    /// plan follows rule order, never hash order.
    pub fn resolve(
        &self,
        selector: &DeviceSelector,
        options: &FlashOptions,
    ) -> Result<FlashPlan, ResolutionError> {
        log_info!(
            MODULE,
            "Resolving {} / {} / {} release {} on {}",
            selector.vendor,
            selector.product,
            selector.module,
            selector.release_version,
            selector.storage
        );

        let row = self.select_row(selector)?;
        let storage_class = StorageClass::classify(&row.storage).ok_or_else(|| {
            ResolutionError::UnsupportedStorage {
                module: row.module.clone(),
                version: row.release_version.clone(),
                storage: row.storage.clone(),
                available: "emmc, sd, nvme, usb, external-ssd".to_string(),
            }
        })?;

        let rule = self
            .rules
            .find(&row.family, &row.release_version)
            .ok_or_else(|| ResolutionError::NoFamilyRule {
                family: row.family.clone(),
                version: row.release_version.clone(),
            })?;

        let vars = template_vars(row, options);
        let artifacts = resolve_artifacts(rule, row)?;
        let extract_steps = resolve_extract_steps(rule, &artifacts, &vars)?;
        let prepare_steps = resolve_prepare_steps(rule, row, storage_class, &artifacts, &vars);
        let flash_template = match storage_class {
            StorageClass::Internal => &rule.flash_internal,
            StorageClass::ExternalSsd => &rule.flash_external,
        };

        let plan = FlashPlan {
            selector: selector.clone(),
            family: row.family.clone(),
            version: row.release_version.clone(),
            board: row.board.clone(),
            storage_class,
            storage_device: row.storage_device.clone(),
            bsp_dir: row.bsp_dir.clone(),
            artifacts,
            extract_steps,
            prepare_steps,
            flash_command: flash_template.render(&vars),
            keep_artifacts: options.keep_files,
            owner: options.username.clone(),
            host: rule.host.clone(),
        };

        log_info!(
            MODULE,
            "Resolved plan for family {}: {} artifacts, {} extract steps, {} prepare steps",
            plan.family,
            plan.artifacts.len(),
            plan.extract_steps.len(),
            plan.prepare_steps.len()
        );
        log_debug!(MODULE, "Flash command: {}", plan.flash_command.display());
        Ok(plan)
    }

    fn select_row(&self, selector: &DeviceSelector) -> Result<&CompatibilityRow, ResolutionError> {
        let rows = self
            .table
            .lookup(&selector.vendor, &selector.product, &selector.module);
        if rows.is_empty() {
            return Err(ResolutionError::UnknownDevice {
                vendor: selector.vendor.clone(),
                product: selector.product.clone(),
                module: selector.module.clone(),
            });
        }

        let for_version: Vec<&CompatibilityRow> = rows
            .iter()
            .copied()
            .filter(|r| r.release_version == selector.release_version)
            .collect();
        if for_version.is_empty() {
            return Err(ResolutionError::UnsupportedVersion {
                module: selector.module.clone(),
                version: selector.release_version.clone(),
                available: join_unique(rows.iter().map(|r| r.release_version.as_str())),
            });
        }

        for_version
            .iter()
            .copied()
            .find(|r| r.storage == selector.storage)
            .ok_or_else(|| ResolutionError::UnsupportedStorage {
                module: selector.module.clone(),
                version: selector.release_version.clone(),
                storage: selector.storage.clone(),
                available: join_unique(for_version.iter().map(|r| r.storage.as_str())),
            })
    }
}

fn join_unique<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .collect::<indexmap::IndexSet<&str>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(", ")
}

fn template_vars(row: &CompatibilityRow, options: &FlashOptions) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("board".to_string(), row.board.clone());
    vars.insert("storage_device".to_string(), row.storage_device.clone());
    vars.insert("bsp_dir".to_string(), row.bsp_dir.clone());
    vars.insert("family".to_string(), row.family.clone());
    vars.insert("version".to_string(), row.release_version.clone());
    vars.insert("username".to_string(), options.username.clone());
    vars
}

fn resolve_artifacts(
    rule: &FamilyRule,
    row: &CompatibilityRow,
) -> Result<Vec<Artifact>, ResolutionError> {
    let mut artifacts = Vec::new();
    for artifact_rule in &rule.artifacts {
        if !artifact_rule.versions.contains(&row.release_version) {
            continue;
        }
        let Some(url) = row.urls.get(&artifact_rule.kind) else {
            if artifact_rule.optional {
                log_debug!(
                    MODULE,
                    "No {} URL for {} {}, skipping optional artifact",
                    artifact_rule.kind,
                    row.family,
                    row.release_version
                );
                continue;
            }
            return Err(ResolutionError::MissingArtifactUrl {
                family: row.family.clone(),
                version: row.release_version.clone(),
                kind: artifact_rule.kind.to_string(),
            });
        };

        let local_file_name = extract_filename(url)
            .map_err(ResolutionError::InvalidEntry)?
            .to_string();
        if artifacts
            .iter()
            .any(|a: &Artifact| a.local_file_name == local_file_name)
        {
            return Err(ResolutionError::InvalidEntry(format!(
                "two artifacts share the file name {}",
                local_file_name
            )));
        }

        artifacts.push(Artifact {
            kind: artifact_rule.kind,
            url: url.clone(),
            local_file_name,
            sha256: row
                .checksums
                .get(&artifact_rule.kind)
                .map(|s| s.to_lowercase()),
        });
    }

    if artifacts.is_empty() {
        log_warn!(MODULE, "Rule for {} yields no artifacts", rule.family);
    }
    Ok(artifacts)
}

fn resolve_extract_steps(
    rule: &FamilyRule,
    artifacts: &[Artifact],
    vars: &TemplateVars,
) -> Result<Vec<ExtractStep>, ResolutionError> {
    let mut steps = Vec::new();
    for artifact in artifacts {
        let Some(extract_rule) = rule.extract.iter().find(|e| e.kind == artifact.kind) else {
            continue;
        };
        let format = extract_rule
            .format
            .or_else(|| ArchiveFormat::from_file_name(&artifact.local_file_name))
            .ok_or_else(|| {
                ResolutionError::InvalidEntry(format!(
                    "cannot tell the archive format of {}",
                    artifact.local_file_name
                ))
            })?;
        steps.push(ExtractStep {
            kind: artifact.kind,
            archive: artifact.local_file_name.clone(),
            destination: substitute(&extract_rule.destination, vars),
            format,
        });
    }
    Ok(steps)
}

fn resolve_prepare_steps(
    rule: &FamilyRule,
    row: &CompatibilityRow,
    storage_class: StorageClass,
    artifacts: &[Artifact],
    vars: &TemplateVars,
) -> Vec<PrepareStep> {
    rule.prepare
        .iter()
        .filter(|p| match p.storage {
            StorageFilter::Any => true,
            StorageFilter::Internal => storage_class == StorageClass::Internal,
            StorageFilter::ExternalSsd => storage_class == StorageClass::ExternalSsd,
        })
        .filter(|p| p.versions.contains(&row.release_version))
        .filter(|p| match p.requires {
            Some(kind) => artifacts.iter().any(|a| a.kind == kind),
            None => true,
        })
        .map(|p| PrepareStep {
            name: p.name.clone(),
            command: p.command.render(vars),
        })
        .collect()
}
