//! Device-family rules
//!
//! Declarative `(family, version range) -> procedure` table. The resolver
//! evaluates it once per selection; adding a family or release means adding
//! a rule here (or in a rules file), never touching the sequencer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::models::{ArchiveFormat, ArtifactKind, CommandTemplate, HostRequirements, UsbId};
use super::version::VersionRange;
use crate::utils::GB;
use crate::{log_debug, log_info};

const MODULE: &str = "plan::rules";

/// NVIDIA's USB vendor id in forced recovery mode
const NVIDIA_USB_VENDOR: u16 = 0x0955;

/// Which storage classes a prepare step applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageFilter {
    #[default]
    Any,
    Internal,
    ExternalSsd,
}

/// An artifact a family needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRule {
    pub kind: ArtifactKind,
    /// Skip silently when the table row has no URL for it (e.g. a rootfs
    /// bundled into a vendor archive)
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub versions: VersionRange,
}

/// Where an artifact kind is unpacked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRule {
    pub kind: ArtifactKind,
    /// Destination relative to the workspace tree; may use `{bsp_dir}`
    pub destination: String,
    /// Overrides format inference from the file name
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
}

/// A preparation command and the conditions it applies under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRule {
    pub name: String,
    pub command: CommandTemplate,
    #[serde(default)]
    pub storage: StorageFilter,
    #[serde(default)]
    pub versions: VersionRange,
    /// Only when the plan carries this artifact kind
    #[serde(default)]
    pub requires: Option<ArtifactKind>,
}

/// Complete flashing procedure for a family over a version range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRule {
    pub family: String,
    #[serde(default)]
    pub versions: VersionRange,
    pub artifacts: Vec<ArtifactRule>,
    #[serde(default)]
    pub extract: Vec<ExtractRule>,
    #[serde(default)]
    pub prepare: Vec<PrepareRule>,
    pub flash_internal: CommandTemplate,
    pub flash_external: CommandTemplate,
    #[serde(default)]
    pub host: HostRequirements,
}

/// Ordered set of family rules; the first match wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<FamilyRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<FamilyRule>) -> Self {
        Self { rules }
    }

    /// Rule for a family at a release version
    pub fn find(&self, family: &str, version: &str) -> Option<&FamilyRule> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.family == family && r.versions.contains(version));
        log_debug!(
            MODULE,
            "Rule lookup {} {}: {}",
            family,
            version,
            if rule.is_some() { "found" } else { "none" }
        );
        rule
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| format!("Failed to parse family rules: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read family rules {}: {}", path.display(), e))?;
        let rules = Self::from_json(&content)?;
        log_info!(
            MODULE,
            "Loaded {} family rules from {}",
            rules.rules.len(),
            path.display()
        );
        Ok(rules)
    }

    /// Built-in Jetson rules
    ///
    /// t210 (Nano/TX1) on JetPack 4, t194 (Xavier) on JetPack 4-5 and
    /// t234 (Orin) on JetPack 5-6. Host OS support follows the JetPack
    /// major version.
    pub fn builtin() -> Self {
        let orin_ids = usb_ids(&[0x7023, 0x7223, 0x7323, 0x7423, 0x7523, 0x7623]);
        let xavier_ids = usb_ids(&[0x7019, 0x7e19]);
        let nano_ids = usb_ids(&[0x7f21]);

        Self::new(vec![
            tegra_rule(
                "t210",
                VersionRange::between("4.0", "5.0"),
                &["16.04", "18.04"],
                25,
                nano_ids,
                "bootloader/t210ref/cfg/flash_l4t_t210_max-spi_sd_p3448.xml",
            ),
            tegra_rule(
                "t194",
                VersionRange::between("4.4", "5.0"),
                &["16.04", "18.04"],
                30,
                xavier_ids.clone(),
                "bootloader/t186ref/cfg/flash_t194_sdmmc.xml",
            ),
            tegra_rule(
                "t194",
                VersionRange::between("5.0", "6.0"),
                &["18.04", "20.04"],
                30,
                xavier_ids,
                "bootloader/t186ref/cfg/flash_t194_sdmmc.xml",
            ),
            tegra_rule(
                "t234",
                VersionRange::between("5.0", "6.0"),
                &["18.04", "20.04"],
                35,
                orin_ids.clone(),
                "bootloader/t186ref/cfg/flash_t234_qspi.xml",
            ),
            tegra_rule(
                "t234",
                VersionRange::between("6.0", "7.0"),
                &["20.04", "22.04"],
                40,
                orin_ids,
                "bootloader/generic/cfg/flash_t234_qspi.xml",
            ),
        ])
    }
}

fn usb_ids(products: &[u16]) -> Vec<UsbId> {
    products
        .iter()
        .map(|&product| UsbId {
            vendor: NVIDIA_USB_VENDOR,
            product,
        })
        .collect()
}

/// Standard L4T procedure, parameterized by family specifics
fn tegra_rule(
    family: &str,
    versions: VersionRange,
    host_os: &[&str],
    min_free_gb: u64,
    recovery_usb_ids: Vec<UsbId>,
    qspi_config: &str,
) -> FamilyRule {
    FamilyRule {
        family: family.to_string(),
        versions,
        artifacts: vec![
            ArtifactRule {
                kind: ArtifactKind::Bsp,
                optional: false,
                versions: VersionRange::any(),
            },
            ArtifactRule {
                kind: ArtifactKind::RootFs,
                optional: true,
                versions: VersionRange::any(),
            },
            // Separate secure-boot bundle only shipped for JetPack 4
            ArtifactRule {
                kind: ArtifactKind::SecureBoot,
                optional: false,
                versions: VersionRange::below("5.0"),
            },
            ArtifactRule {
                kind: ArtifactKind::VendorArchive,
                optional: true,
                versions: VersionRange::any(),
            },
        ],
        extract: vec![
            ExtractRule {
                kind: ArtifactKind::Bsp,
                destination: ".".to_string(),
                format: None,
            },
            ExtractRule {
                kind: ArtifactKind::RootFs,
                destination: "{bsp_dir}/rootfs".to_string(),
                format: None,
            },
            ExtractRule {
                kind: ArtifactKind::SecureBoot,
                destination: ".".to_string(),
                format: None,
            },
            ExtractRule {
                kind: ArtifactKind::VendorArchive,
                destination: ".".to_string(),
                format: None,
            },
        ],
        prepare: vec![
            PrepareRule {
                name: "apply-binaries".to_string(),
                command: CommandTemplate::new("./apply_binaries.sh", &[])
                    .in_dir("{bsp_dir}")
                    .privileged(),
                storage: StorageFilter::Any,
                versions: VersionRange::any(),
                requires: None,
            },
            PrepareRule {
                name: "flash-prerequisites".to_string(),
                command: CommandTemplate::new("./tools/l4t_flash_prerequisites.sh", &[])
                    .in_dir("{bsp_dir}")
                    .privileged(),
                storage: StorageFilter::Any,
                versions: VersionRange::at_least("5.0"),
                requires: None,
            },
            PrepareRule {
                name: "board-pinmux".to_string(),
                command: CommandTemplate::new("./vendor_setup.sh", &["{board}"])
                    .in_dir("{bsp_dir}")
                    .privileged(),
                storage: StorageFilter::Any,
                versions: VersionRange::any(),
                requires: Some(ArtifactKind::VendorArchive),
            },
            PrepareRule {
                name: "create-default-user".to_string(),
                command: CommandTemplate::new(
                    "./tools/l4t_create_default_user.sh",
                    &["-u", "{username}", "-p", "{username}", "-a", "--accept-license"],
                )
                .in_dir("{bsp_dir}")
                .privileged(),
                storage: StorageFilter::ExternalSsd,
                versions: VersionRange::any(),
                requires: None,
            },
        ],
        flash_internal: CommandTemplate::new("./flash.sh", &["{board}", "{storage_device}"])
            .in_dir("{bsp_dir}")
            .privileged(),
        flash_external: CommandTemplate::new(
            "./tools/kernel_flash/l4t_initrd_flash.sh",
            &[
                "--external-device",
                "{storage_device}",
                "-c",
                "tools/kernel_flash/flash_l4t_external.xml",
                "-p",
                &format!("-c {}", qspi_config),
                "--showlogs",
                "--network",
                "usb0",
                "{board}",
                "internal",
            ],
        )
        .in_dir("{bsp_dir}")
        .privileged(),
        host: HostRequirements {
            supported_host_os: host_os.iter().map(|s| s.to_string()).collect(),
            min_free_bytes: min_free_gb * GB,
            recovery_usb_ids,
        },
    }
}
