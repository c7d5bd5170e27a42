//! Shared test fixtures: sample tables and rules, and scripted stand-ins for
//! the network, the process runner and the host.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::cache::{DownloadProgress, FetchOutcome, Fetcher, ProgressCallback};
use crate::compat::{DeviceSelector, JsonTable};
use crate::error::{CacheError, RunnerError};
use crate::plan::rules::{ArtifactRule, ExtractRule, FamilyRule, PrepareRule, StorageFilter};
use crate::plan::{
    ArtifactKind, CommandTemplate, FlashOptions, HostRequirements, RuleSet, UsbId, VersionRange,
};
use crate::runner::{RunningProcess, ToolCommand, ToolRunner};
use crate::sequencer::HostProbe;

const ACME_ROWS: &str = r#"
    {
        "vendor": "Acme", "product": "P1", "module": "M2",
        "release_version": "6.2", "storage": "external-ssd", "family": "acme-m",
        "board": "acme-p1-m2", "storage_device": "nvme0n1p1",
        "urls": {
            "BSP": "https://downloads.acme.example/m2/6.2/Acme_Linux_R36.4.3_aarch64.tbz2",
            "VENDOR_ARCHIVE": "https://downloads.acme.example/m2/6.2/acme-p1-m2-overlay.zip"
        }
    },
    {
        "vendor": "Acme", "product": "P1", "module": "M2",
        "release_version": "5.1", "storage": "external-ssd", "family": "acme-m",
        "board": "acme-p1-m2", "storage_device": "nvme0n1p1",
        "urls": {
            "BSP": "https://downloads.acme.example/m2/5.1/Acme_Linux_R35.2.1_aarch64.tbz2",
            "VENDOR_ARCHIVE": "https://downloads.acme.example/m2/5.1/acme-p1-m2-overlay.zip"
        }
    }"#;

const NVIDIA_ROWS: &str = r#"
    {
        "vendor": "NVIDIA", "product": "Jetson Orin Nano Devkit", "module": "Orin Nano 8GB",
        "release_version": "6.2", "storage": "sd", "family": "t234",
        "board": "jetson-orin-nano-devkit", "storage_device": "mmcblk0p1",
        "urls": {
            "BSP": "https://developer.nvidia.com/downloads/r36.4.3/Jetson_Linux_R36.4.3_aarch64.tbz2",
            "ROOTFS": "https://developer.nvidia.com/downloads/r36.4.3/Tegra_Linux_Sample-Root-Filesystem_R36.4.3_aarch64.tbz2"
        }
    },
    {
        "vendor": "NVIDIA", "product": "Jetson Orin Nano Devkit", "module": "Orin Nano 8GB",
        "release_version": "6.2", "storage": "nvme", "family": "t234",
        "board": "jetson-orin-nano-devkit", "storage_device": "nvme0n1p1",
        "urls": {
            "BSP": "https://developer.nvidia.com/downloads/r36.4.3/Jetson_Linux_R36.4.3_aarch64.tbz2",
            "ROOTFS": "https://developer.nvidia.com/downloads/r36.4.3/Tegra_Linux_Sample-Root-Filesystem_R36.4.3_aarch64.tbz2"
        }
    },
    {
        "vendor": "NVIDIA", "product": "Jetson AGX Xavier Devkit", "module": "AGX Xavier 32GB",
        "release_version": "4.6.4", "storage": "emmc", "family": "t194",
        "board": "jetson-agx-xavier-devkit", "storage_device": "mmcblk0p1",
        "urls": {
            "BSP": "https://developer.nvidia.com/downloads/r32.7.4/Jetson_Linux_R32.7.4_aarch64.tbz2",
            "ROOTFS": "https://developer.nvidia.com/downloads/r32.7.4/Tegra_Linux_Sample-Root-Filesystem_R32.7.4_aarch64.tbz2",
            "SECUREBOOT": "https://developer.nvidia.com/downloads/r32.7.4/secureboot_R32.7.4_aarch64.tbz2"
        }
    },
    {
        "vendor": "NVIDIA", "product": "Jetson AGX Xavier Devkit", "module": "AGX Xavier 32GB",
        "release_version": "5.1.3", "storage": "emmc", "family": "t194",
        "board": "jetson-agx-xavier-devkit", "storage_device": "mmcblk0p1",
        "urls": {
            "BSP": "https://developer.nvidia.com/downloads/r35.5.0/Jetson_Linux_R35.5.0_aarch64.tbz2",
            "ROOTFS": "https://developer.nvidia.com/downloads/r35.5.0/Tegra_Linux_Sample-Root-Filesystem_R35.5.0_aarch64.tbz2"
        }
    }"#;

/// NVIDIA and Acme rows
pub(crate) fn sample_table() -> JsonTable {
    JsonTable::from_json(&format!("[{},{}]", NVIDIA_ROWS, ACME_ROWS)).unwrap()
}

pub(crate) fn acme_table() -> JsonTable {
    JsonTable::from_json(&format!("[{}]", ACME_ROWS)).unwrap()
}

/// Acme M-series: rootfs ships inside the vendor overlay archive
pub(crate) fn acme_rules() -> RuleSet {
    let in_bsp = |t: CommandTemplate| t.in_dir("{bsp_dir}").privileged();
    RuleSet::new(vec![FamilyRule {
        family: "acme-m".into(),
        versions: VersionRange::any(),
        artifacts: vec![
            ArtifactRule {
                kind: ArtifactKind::Bsp,
                optional: false,
                versions: VersionRange::any(),
            },
            ArtifactRule {
                kind: ArtifactKind::VendorArchive,
                optional: false,
                versions: VersionRange::any(),
            },
        ],
        extract: vec![
            ExtractRule {
                kind: ArtifactKind::Bsp,
                destination: ".".into(),
                format: None,
            },
            ExtractRule {
                kind: ArtifactKind::VendorArchive,
                destination: "{bsp_dir}".into(),
                format: None,
            },
        ],
        prepare: vec![
            PrepareRule {
                name: "apply-binaries".into(),
                command: in_bsp(CommandTemplate::new("./apply_binaries.sh", &[])),
                storage: StorageFilter::Any,
                versions: VersionRange::any(),
                requires: None,
            },
            PrepareRule {
                name: "flash-prerequisites".into(),
                command: in_bsp(CommandTemplate::new("./tools/l4t_flash_prerequisites.sh", &[])),
                storage: StorageFilter::Any,
                versions: VersionRange::at_least("5.0"),
                requires: None,
            },
            PrepareRule {
                name: "board-pinmux".into(),
                command: in_bsp(CommandTemplate::new("./acme_pinmux.sh", &["{board}"])),
                storage: StorageFilter::Any,
                versions: VersionRange::any(),
                requires: Some(ArtifactKind::VendorArchive),
            },
            PrepareRule {
                name: "create-default-user".into(),
                command: in_bsp(CommandTemplate::new(
                    "./tools/l4t_create_default_user.sh",
                    &["-u", "{username}", "-p", "{username}", "-a", "--accept-license"],
                )),
                storage: StorageFilter::ExternalSsd,
                versions: VersionRange::any(),
                requires: None,
            },
        ],
        flash_internal: in_bsp(CommandTemplate::new("./flash.sh", &["{board}", "{storage_device}"])),
        flash_external: in_bsp(CommandTemplate::new(
            "./tools/kernel_flash/l4t_initrd_flash.sh",
            &[
                "--external-device",
                "{storage_device}",
                "-c",
                "tools/kernel_flash/flash_l4t_external.xml",
                "--network",
                "usb0",
                "{board}",
                "internal",
            ],
        )),
        host: HostRequirements {
            supported_host_os: vec!["20.04".into(), "22.04".into()],
            min_free_bytes: 1024,
            recovery_usb_ids: vec![UsbId {
                vendor: 0x0955,
                product: 0x7323,
            }],
        },
    }])
}

pub(crate) fn acme_selector(version: &str) -> DeviceSelector {
    DeviceSelector {
        vendor: "Acme".into(),
        product: "P1".into(),
        module: "M2".into(),
        release_version: version.into(),
        storage: "external-ssd".into(),
    }
}

pub(crate) fn options(keep_files: bool) -> FlashOptions {
    FlashOptions {
        keep_files,
        username: "operator".into(),
    }
}

/// Writes a fixed body and counts calls
pub(crate) struct CountingFetcher {
    body: Vec<u8>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    truncate: bool,
    gate: Option<FetchGate>,
}

struct FetchGate {
    url_part: String,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl CountingFetcher {
    pub(crate) fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: None,
            truncate: false,
            gate: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls with a transient error
    pub(crate) fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Write half the body while announcing the full length
    pub(crate) fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Hold fetches of URLs containing `url_part`: `started` fires when one
    /// begins, it completes once `release` is notified
    pub(crate) fn gate(mut self, url_part: &str, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some(FetchGate {
            url_part: url_part.to_string(),
            started,
            release,
        });
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressCallback,
    ) -> Result<FetchOutcome, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.gate.as_ref().filter(|g| url.contains(&g.url_part)) {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(CacheError::Transient {
                url: url.to_string(),
                reason: "connection reset by peer".into(),
            });
        }

        let data = if self.truncate {
            &self.body[..self.body.len() / 2]
        } else {
            &self.body[..]
        };
        tokio::fs::write(dest, data).await.unwrap();
        progress(DownloadProgress {
            downloaded: data.len() as u64,
            total: Some(self.body.len() as u64),
        });
        Ok(FetchOutcome {
            written: data.len() as u64,
            expected: Some(self.body.len() as u64),
        })
    }
}

struct Script {
    program: String,
    output: Vec<String>,
    exit_code: i32,
}

struct Gate {
    program: String,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

/// Records commands and answers with canned output and exit codes
///
/// Programs match by exact name or trailing path component. Unscripted
/// programs succeed silently.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    scripts: Vec<Script>,
    gates: Vec<Gate>,
    calls: Mutex<Vec<ToolCommand>>,
}

fn program_matches(program: &str, pattern: &str) -> bool {
    program == pattern || program.ends_with(&format!("/{}", pattern))
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(mut self, program: &str, output: &[&str], exit_code: i32) -> Self {
        self.scripts.push(Script {
            program: program.to_string(),
            output: output.iter().map(|s| s.to_string()).collect(),
            exit_code,
        });
        self
    }

    /// Hold `program` open: `started` fires on spawn, the process exits
    /// once `release` is notified
    pub(crate) fn gate(mut self, program: &str, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gates.push(Gate {
            program: program.to_string(),
            started,
            release,
        });
        self
    }

    pub(crate) fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

#[async_trait]
impl ToolRunner for ScriptedRunner {
    async fn spawn(&self, command: &ToolCommand) -> Result<RunningProcess, RunnerError> {
        self.calls.lock().unwrap().push(command.clone());

        let (output, exit_code) = self
            .scripts
            .iter()
            .find(|s| program_matches(&command.program, &s.program))
            .map(|s| (s.output.clone(), s.exit_code))
            .unwrap_or_default();

        let Some(gate) = self
            .gates
            .iter()
            .find(|g| program_matches(&command.program, &g.program))
        else {
            return Ok(RunningProcess::finished(&command.program, output, exit_code));
        };

        let (line_tx, line_rx) = mpsc::channel(output.len().max(1));
        let (exit_tx, exit_rx) = oneshot::channel();
        let release = Arc::clone(&gate.release);
        gate.started.notify_one();
        tokio::spawn(async move {
            for line in output {
                let _ = line_tx.send(line).await;
            }
            release.notified().await;
            drop(line_tx);
            let _ = exit_tx.send(Ok(exit_code));
        });
        Ok(RunningProcess::new(command.program.clone(), line_rx, exit_rx))
    }
}

/// Host with fixed answers
pub(crate) struct ScriptedHostProbe {
    pub(crate) os_version: Option<String>,
    pub(crate) free_bytes: Option<u64>,
    pub(crate) recovery_present: bool,
}

impl Default for ScriptedHostProbe {
    fn default() -> Self {
        Self {
            os_version: Some("22.04".into()),
            free_bytes: Some(u64::MAX / 2),
            recovery_present: true,
        }
    }
}

impl HostProbe for ScriptedHostProbe {
    fn os_version(&self) -> Option<String> {
        self.os_version.clone()
    }

    fn free_bytes(&self, _path: &Path) -> Option<u64> {
        self.free_bytes
    }

    fn recovery_device_present(&self, _ids: &[UsbId]) -> bool {
        self.recovery_present
    }
}
