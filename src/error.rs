//! Error types
//!
//! [`FlashError`] is the operator-facing taxonomy every session failure maps
//! to; the component errors convert into it at the sequencer boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Why a selector could not be turned into a plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no compatibility entry for {vendor} / {product} / {module}")]
    UnknownDevice {
        vendor: String,
        product: String,
        module: String,
    },
    #[error("release {version} is not supported for {module} (available: {available})")]
    UnsupportedVersion {
        module: String,
        version: String,
        available: String,
    },
    #[error("storage '{storage}' is not supported for {module} release {version} (available: {available})")]
    UnsupportedStorage {
        module: String,
        version: String,
        storage: String,
        available: String,
    },
    #[error("no flashing rule covers family '{family}' at release {version}")]
    NoFamilyRule { family: String, version: String },
    #[error("compatibility entry for {family} {version} has no {kind} download URL")]
    MissingArtifactUrl {
        family: String,
        version: String,
        kind: String,
    },
    #[error("invalid compatibility entry: {0}")]
    InvalidEntry(String),
}

/// Archive cache failures
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Network or HTTP failure; worth retrying
    #[error("download of {url} failed: {reason}")]
    Transient { url: String, reason: String },
    /// Downloaded data failed validation; the file has been removed
    #[error("downloaded file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    /// The server refused the request (4xx); retrying will not help
    #[error("{url} is unavailable: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("extraction of {archive} failed with exit code {exit_code:?}")]
    Extraction {
        archive: String,
        exit_code: Option<i32>,
        output_tail: Vec<String>,
    },
    #[error("cache I/O error: {0}")]
    Io(String),
}

impl CacheError {
    /// Whether a fresh attempt may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Transient { .. } | CacheError::Corrupt { .. })
    }
}

/// Tool runner failures (spawn errors, not non-zero exits)
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for '{program}': {reason}")]
    Wait { program: String, reason: String },
}

/// Operator-facing failure taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("prepare step {index} ({name}) failed")]
    PrepareStepFailed { index: usize, name: String },
    #[error("flash tool exited with code {exit_code}")]
    FlashToolError { exit_code: i32 },
    #[error("a flash session is already active for device {0}")]
    SessionAlreadyActive(String),
    #[error("cancelled by operator")]
    Cancelled,
}

impl From<ResolutionError> for FlashError {
    fn from(e: ResolutionError) -> Self {
        FlashError::UnsupportedCombination(e.to_string())
    }
}
