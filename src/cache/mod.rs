//! Archive cache
//!
//! Downloads and extracted trees addressed by (family, version, artifact
//! kind). Layout under the cache root:
//!
//! ```text
//! <root>/<family>/<version>/
//!     downloads/<archive>        complete, validated archives
//!     downloads/<archive>.part   in-progress download, never trusted
//!     tree/                      extraction target, bound as {workdir}
//!     .markers/<archive>.extracted
//!     .cache-state               "downloaded" or "extracted"
//! ```
//!
//! A file only appears under its final name after a successful fetch and
//! validation, so readers never see a partial archive.

mod fetch;
mod store;

pub use fetch::{
    sha256_file, DownloadProgress, FetchOutcome, Fetcher, HttpFetcher, ProgressCallback,
};
pub use store::{ArchiveCache, CachePin};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::cache::{DOWNLOADS_DIR, MARKERS_DIR, STATE_MARKER, TREE_DIR};
use crate::config::download::PARTIAL_SUFFIX;
use crate::plan::{Artifact, ArtifactKind, FlashPlan};

/// Cache address of one artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub family: String,
    pub version: String,
    pub kind: ArtifactKind,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.family, self.version, self.kind)
    }
}

/// Everything needed to make one artifact present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: CacheKey,
    pub url: String,
    pub file_name: String,
    pub sha256: Option<String>,
}

impl FetchRequest {
    pub fn for_artifact(plan: &FlashPlan, artifact: &Artifact) -> Self {
        Self {
            key: CacheKey {
                family: plan.family.clone(),
                version: plan.version.clone(),
                kind: artifact.kind,
            },
            url: artifact.url.clone(),
            file_name: artifact.local_file_name.clone(),
            sha256: artifact.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Absent,
    Downloading,
    Present,
    Extracted,
    /// Zero-length or failed validation; deleted before any reuse
    Corrupt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub state: CacheState,
}

/// Progress of a whole version subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtreeState {
    Downloaded,
    Extracted,
}

impl SubtreeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtreeState::Downloaded => "downloaded",
            SubtreeState::Extracted => "extracted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "downloaded" => Some(SubtreeState::Downloaded),
            "extracted" => Some(SubtreeState::Extracted),
            _ => None,
        }
    }
}

/// Paths inside one (family, version) subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPaths {
    root: PathBuf,
}

impl VersionPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    pub fn download(&self, file_name: &str) -> PathBuf {
        self.downloads().join(file_name)
    }

    pub fn partial(&self, file_name: &str) -> PathBuf {
        self.downloads()
            .join(format!("{}{}", file_name, PARTIAL_SUFFIX))
    }

    /// Workspace tree, bound to `{workdir}` in command templates
    pub fn tree(&self) -> PathBuf {
        self.root.join(TREE_DIR)
    }

    pub fn markers(&self) -> PathBuf {
        self.root.join(MARKERS_DIR)
    }

    pub fn marker(&self, archive: &str) -> PathBuf {
        self.markers().join(format!("{}.extracted", archive))
    }

    pub fn state_marker(&self) -> PathBuf {
        self.root.join(STATE_MARKER)
    }
}
