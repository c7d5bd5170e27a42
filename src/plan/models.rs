//! Flash plan data models

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::compat::DeviceSelector;
use crate::runner::ToolCommand;

/// Placeholder bound at execution time to the version's extracted tree
pub const WORKDIR_VAR: &str = "workdir";

/// Kind of downloadable archive a plan needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "BSP")]
    Bsp,
    #[serde(rename = "ROOTFS")]
    RootFs,
    #[serde(rename = "SECUREBOOT")]
    SecureBoot,
    #[serde(rename = "VENDOR_ARCHIVE")]
    VendorArchive,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Bsp => "bsp",
            ArtifactKind::RootFs => "rootfs",
            ArtifactKind::SecureBoot => "secureboot",
            ArtifactKind::VendorArchive => "vendor-archive",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive container formats the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    TarGzip,
    TarBzip2,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Infer the format from an archive file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGzip)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") || lower.ends_with(".tbz")
        {
            Some(ArchiveFormat::TarBzip2)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    /// Program and arguments extracting `archive` into `destination`
    ///
    /// Tar invocations preserve permissions (`-p`); BSP trees contain device
    /// nodes and setuid binaries.
    pub fn extract_command(&self, archive: &Path, destination: &Path) -> (String, Vec<String>) {
        let archive = archive.to_string_lossy().to_string();
        let destination = destination.to_string_lossy().to_string();
        match self {
            ArchiveFormat::TarGzip => tar_command("-xpzf", archive, destination),
            ArchiveFormat::TarBzip2 => tar_command("-xpjf", archive, destination),
            ArchiveFormat::Tar => tar_command("-xpf", archive, destination),
            ArchiveFormat::Zip => (
                "unzip".to_string(),
                vec![
                    "-o".to_string(),
                    "-q".to_string(),
                    archive,
                    "-d".to_string(),
                    destination,
                ],
            ),
        }
    }
}

fn tar_command(flags: &str, archive: String, destination: String) -> (String, Vec<String>) {
    (
        "tar".to_string(),
        vec![flags.to_string(), archive, "-C".to_string(), destination],
    )
}

/// Coarse storage class deciding flash template and prepare subset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageClass {
    /// On-module or removable boot media (eMMC, SD card)
    Internal,
    /// External SSD (NVMe, USB), flashed over the initrd network path
    ExternalSsd,
}

impl StorageClass {
    /// Classify a table storage value
    pub fn classify(storage: &str) -> Option<Self> {
        match storage.trim().to_lowercase().as_str() {
            "emmc" | "sd" | "sdcard" | "sd-card" | "internal" => Some(StorageClass::Internal),
            "nvme" | "ssd" | "usb" | "external" | "external-ssd" => Some(StorageClass::ExternalSsd),
            _ => None,
        }
    }
}

/// USB vendor/product pair of a device in forced recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

/// Host-side conditions checked before any download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequirements {
    /// Host OS versions the vendor tools support; empty accepts any
    #[serde(default)]
    pub supported_host_os: Vec<String>,
    /// Free bytes needed under the cache root
    #[serde(default)]
    pub min_free_bytes: u64,
    /// Ids a recovery-mode device may enumerate with; empty skips the check
    #[serde(default)]
    pub recovery_usb_ids: Vec<UsbId>,
}

/// Variables substituted into `{name}` placeholders
pub type TemplateVars = BTreeMap<String, String>;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Replace every `{name}` for which `vars` has a value
///
/// One pass over `text`: substituted values are never expanded again.
pub fn substitute(text: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// External invocation with `{placeholders}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the workspace tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub privileged: bool,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: Vec::new(),
            privileged: false,
        }
    }

    pub fn in_dir(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Substitute plan-time variables, leaving unknown placeholders intact
    pub fn render(&self, vars: &TemplateVars) -> Self {
        Self {
            program: substitute(&self.program, vars),
            args: self.args.iter().map(|a| substitute(a, vars)).collect(),
            cwd: self.cwd.as_ref().map(|c| substitute(c, vars)),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
            privileged: self.privileged,
        }
    }

    /// Bind to a workspace tree, producing a concrete command
    pub fn bind(&self, workdir: &Path) -> ToolCommand {
        let mut vars = TemplateVars::new();
        vars.insert(WORKDIR_VAR.to_string(), workdir.to_string_lossy().to_string());
        let rendered = self.render(&vars);

        let cwd = match rendered.cwd.as_deref() {
            Some(dir) => workdir.join(dir),
            None => workdir.to_path_buf(),
        };

        ToolCommand {
            program: rendered.program,
            args: rendered.args,
            cwd: Some(cwd),
            env: rendered.env,
            privileged: rendered.privileged,
        }
    }

    /// Single-line rendering for logs and plan listings
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One downloadable archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub url: String,
    pub local_file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Unpack one downloaded archive into the workspace tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractStep {
    pub kind: ArtifactKind,
    /// Local file name of the archive (matches an [`Artifact`])
    pub archive: String,
    /// Destination relative to the workspace tree
    pub destination: String,
    pub format: ArchiveFormat,
}

/// Named preparation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareStep {
    pub name: String,
    pub command: CommandTemplate,
}

/// Operator options that shape a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashOptions {
    /// Keep downloads and extracted trees after a successful flash
    pub keep_files: bool,
    /// Account that owns kept files and becomes the device's default user
    pub username: String,
}

/// Fully resolved description of one flash
///
/// Built once by the resolver; nothing in it refers back to the
/// compatibility table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashPlan {
    pub selector: DeviceSelector,
    pub family: String,
    pub version: String,
    pub board: String,
    pub storage_class: StorageClass,
    pub storage_device: String,
    pub bsp_dir: String,
    pub artifacts: Vec<Artifact>,
    pub extract_steps: Vec<ExtractStep>,
    pub prepare_steps: Vec<PrepareStep>,
    pub flash_command: CommandTemplate,
    pub keep_artifacts: bool,
    pub owner: String,
    pub host: HostRequirements,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_format_inference() {
        assert_eq!(
            ArchiveFormat::from_file_name("Jetson_Linux_R36.4.3_aarch64.tbz2"),
            Some(ArchiveFormat::TarBzip2)
        );
        assert_eq!(
            ArchiveFormat::from_file_name("bsp.TAR.GZ"),
            Some(ArchiveFormat::TarGzip)
        );
        assert_eq!(ArchiveFormat::from_file_name("overlay.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_file_name("rootfs.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_file_name("image.img.xz"), None);
    }

    #[test]
    fn test_extract_command() {
        let (program, args) =
            ArchiveFormat::TarBzip2.extract_command(Path::new("/c/bsp.tbz2"), Path::new("/c/tree"));
        assert_eq!(program, "tar");
        assert_eq!(args, vec!["-xpjf", "/c/bsp.tbz2", "-C", "/c/tree"]);

        let (program, args) =
            ArchiveFormat::Zip.extract_command(Path::new("/c/v.zip"), Path::new("/c/tree"));
        assert_eq!(program, "unzip");
        assert_eq!(args, vec!["-o", "-q", "/c/v.zip", "-d", "/c/tree"]);
    }

    #[test]
    fn test_storage_classification() {
        assert_eq!(StorageClass::classify("eMMC"), Some(StorageClass::Internal));
        assert_eq!(StorageClass::classify("sd"), Some(StorageClass::Internal));
        assert_eq!(StorageClass::classify("nvme"), Some(StorageClass::ExternalSsd));
        assert_eq!(
            StorageClass::classify("external-ssd"),
            Some(StorageClass::ExternalSsd)
        );
        assert_eq!(StorageClass::classify("floppy"), None);
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let mut vars = TemplateVars::new();
        vars.insert("board".to_string(), "jetson-orin-nano-devkit".to_string());
        vars.insert("username".to_string(), "ops{board}".to_string());
        assert_eq!(
            substitute("-u {username} {board} {unknown}", &vars),
            "-u ops{board} jetson-orin-nano-devkit {unknown}"
        );
    }

    #[test]
    fn test_render_then_bind() {
        let template = CommandTemplate::new("./flash.sh", &["{board}", "{storage_device}", "{other}"])
            .in_dir("{bsp_dir}")
            .privileged();

        let mut vars = TemplateVars::new();
        vars.insert("board".into(), "jetson-agx-orin-devkit".into());
        vars.insert("storage_device".into(), "mmcblk0p1".into());
        vars.insert("bsp_dir".into(), "Linux_for_Tegra".into());
        let rendered = template.render(&vars);
        assert_eq!(
            rendered.display(),
            "./flash.sh jetson-agx-orin-devkit mmcblk0p1 {other}"
        );

        let command = rendered.bind(Path::new("/cache/t234/6.2/tree"));
        assert_eq!(
            command.cwd.as_deref(),
            Some(Path::new("/cache/t234/6.2/tree/Linux_for_Tegra"))
        );
        assert!(command.privileged);
    }

    #[test]
    fn test_bind_substitutes_workdir_in_args() {
        let template = CommandTemplate::new("cp", &["{workdir}/a", "{workdir}/b"]);
        let command = template.bind(Path::new("/w"));
        assert_eq!(command.args, vec!["/w/a", "/w/b"]);
        assert_eq!(command.cwd.as_deref(), Some(Path::new("/w")));
    }
}
