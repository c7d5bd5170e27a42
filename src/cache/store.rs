//! Archive cache store
//!
//! Same-key downloads collapse into one shared in-flight job; distinct keys
//! proceed in parallel. Extraction and eviction of root-owned trees go
//! through the tool runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock};
use uuid::Uuid;

use super::fetch::{sha256_file, DownloadProgress, Fetcher};
use super::{CacheEntry, CacheKey, CacheState, FetchRequest, SubtreeState, VersionPaths};
use crate::config::cache::TRASH_PREFIX;
use crate::error::CacheError;
use crate::plan::ExtractStep;
use crate::progress::{ProgressBridge, ProgressEvent};
use crate::runner::{ToolCommand, ToolRunner};
use crate::utils::{format_size, sanitize_component};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "cache";

type DownloadResult = Result<PathBuf, CacheError>;

#[derive(Clone)]
struct InFlight {
    result: Shared<BoxFuture<'static, DownloadResult>>,
    progress: watch::Receiver<DownloadProgress>,
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, InFlight>>>;
/// Per-version lock: pins and running downloads read, eviction writes
type VersionLocks = Mutex<HashMap<(String, String), Arc<RwLock<()>>>>;
type ExtractLocks = Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ArchiveCache {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    in_flight: InFlightMap,
    version_locks: VersionLocks,
    extract_locks: ExtractLocks,
}

impl ArchiveCache {
    pub fn new(root: PathBuf, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            root,
            fetcher,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            version_locks: Mutex::new(HashMap::new()),
            extract_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_lock(&self, family: &str, version: &str) -> Arc<RwLock<()>> {
        let key = (sanitize_component(family), sanitize_component(version));
        Arc::clone(lock(&self.version_locks).entry(key).or_default())
    }

    fn family_dir(&self, family: &str) -> PathBuf {
        self.root.join(sanitize_component(family))
    }

    pub fn version_paths(&self, family: &str, version: &str) -> VersionPaths {
        VersionPaths::new(self.family_dir(family).join(sanitize_component(version)))
    }

    /// Current state of one artifact
    ///
    /// A status query only: `Present` is not re-hashed here, `ensure` does
    /// that before handing the file out.
    pub fn entry(&self, request: &FetchRequest) -> CacheEntry {
        let paths = self.version_paths(&request.key.family, &request.key.version);
        let path = paths.download(&request.file_name);

        let state = if lock(&self.in_flight).contains_key(&request.key) {
            CacheState::Downloading
        } else {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() == 0 => CacheState::Corrupt,
                Ok(_) if paths.marker(&request.file_name).exists() => CacheState::Extracted,
                Ok(_) => CacheState::Present,
                Err(_) => CacheState::Absent,
            }
        };

        CacheEntry {
            key: request.key.clone(),
            path,
            state,
        }
    }

    /// Path of a valid local copy, downloading it if needed
    pub async fn ensure(&self, request: &FetchRequest) -> DownloadResult {
        self.ensure_with_progress(request, |_| {}).await
    }

    /// [`ensure`](Self::ensure), reporting download progress
    ///
    /// A caller joining a download already in flight sees progress from the
    /// point it joined.
    pub async fn ensure_with_progress<F>(&self, request: &FetchRequest, mut on_progress: F) -> DownloadResult
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let InFlight {
            mut result,
            mut progress,
        } = self.join_or_start(request);

        let mut reported = DownloadProgress::default();
        let mut watching = true;
        loop {
            tokio::select! {
                biased;
                outcome = &mut result => {
                    // The last update may land together with the result
                    let last = *progress.borrow();
                    if last != reported {
                        on_progress(last);
                    }
                    return outcome;
                }
                changed = progress.changed(), if watching => match changed {
                    Ok(()) => {
                        reported = *progress.borrow_and_update();
                        on_progress(reported);
                    }
                    Err(_) => watching = false,
                },
            }
        }
    }

    fn join_or_start(&self, request: &FetchRequest) -> InFlight {
        let mut in_flight = lock(&self.in_flight);
        if let Some(existing) = in_flight.get(&request.key) {
            log_info!(MODULE, "Joining in-flight download of {}", request.key);
            return existing.clone();
        }

        let (progress_tx, progress_rx) = watch::channel(DownloadProgress::default());
        let job = DownloadJob {
            paths: self.version_paths(&request.key.family, &request.key.version),
            version_lock: self.version_lock(&request.key.family, &request.key.version),
            fetcher: Arc::clone(&self.fetcher),
            request: request.clone(),
            progress: progress_tx,
        };

        // The registry lock is held until the entry is inserted, so the job
        // cannot deregister before it was registered
        let registry = Arc::clone(&self.in_flight);
        let key = request.key.clone();
        let handle = tokio::spawn(async move {
            let result = job.run().await;
            lock(&registry).remove(&key);
            result
        });

        let result = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(CacheError::Io(format!("download task failed: {}", e))))
        }
        .boxed()
        .shared();

        let entry = InFlight {
            result,
            progress: progress_rx,
        };
        in_flight.insert(request.key.clone(), entry.clone());
        entry
    }

    /// Unpack one archive into the version's tree
    ///
    /// Returns `false` when the completion marker shows the archive was
    /// already extracted. Both directory creation and unpacking run
    /// privileged: BSP trees are root-owned.
    pub async fn extract(
        &self,
        family: &str,
        version: &str,
        step: &ExtractStep,
        runner: &dyn ToolRunner,
        tail_lines: usize,
        on_event: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> Result<bool, CacheError> {
        // One extraction at a time per version tree
        let tree_lock = {
            let key = (sanitize_component(family), sanitize_component(version));
            Arc::clone(lock(&self.extract_locks).entry(key).or_default())
        };
        let _guard = tree_lock.lock().await;

        let paths = self.version_paths(family, version);
        let marker = paths.marker(&step.archive);
        if marker.exists() {
            log_info!(MODULE, "{} already extracted, skipping", step.archive);
            return Ok(false);
        }

        let archive = paths.download(&step.archive);
        if !archive.exists() {
            return Err(CacheError::Io(format!(
                "archive {} is not in the cache",
                archive.display()
            )));
        }

        let destination = paths.tree().join(&step.destination);
        tokio::fs::create_dir_all(paths.markers())
            .await
            .map_err(|e| CacheError::Io(format!("Failed to create markers directory: {}", e)))?;

        let extraction_error = |exit_code: Option<i32>, output_tail: Vec<String>| {
            CacheError::Extraction {
                archive: step.archive.clone(),
                exit_code,
                output_tail,
            }
        };

        let mkdir = ToolCommand::new(
            "mkdir",
            vec!["-p".to_string(), destination.to_string_lossy().to_string()],
        )
        .privileged();
        let (code, output) = runner
            .run(&mkdir)
            .await
            .map_err(|e| extraction_error(None, vec![e.to_string()]))?;
        if code != 0 {
            return Err(extraction_error(Some(code), output));
        }

        let (program, args) = step.format.extract_command(&archive, &destination);
        let command = ToolCommand::new(&program, args).privileged();
        log_info!(
            MODULE,
            "Extracting {} into {}",
            step.archive,
            destination.display()
        );

        let process = runner
            .spawn(&command)
            .await
            .map_err(|e| extraction_error(None, vec![e.to_string()]))?;
        let stream = ProgressBridge::attach(process, tail_lines);
        let mut events = stream.subscribe();
        while let Some(event) = events.next().await {
            on_event(event);
        }
        let outcome = stream
            .wait()
            .await
            .map_err(|e| extraction_error(None, vec![e.to_string()]))?;

        if !outcome.success() {
            log_error!(
                MODULE,
                "Extraction of {} failed with exit code {}",
                step.archive,
                outcome.exit_code
            );
            return Err(extraction_error(Some(outcome.exit_code), outcome.output_tail));
        }

        tokio::fs::write(&marker, format!("{}\n", chrono::Utc::now().to_rfc3339()))
            .await
            .map_err(|e| CacheError::Io(format!("Failed to write {}: {}", marker.display(), e)))?;
        log_info!(MODULE, "Extracted {}", step.archive);
        Ok(true)
    }

    /// Record how far a version subtree has progressed
    pub async fn mark_state(
        &self,
        family: &str,
        version: &str,
        state: SubtreeState,
    ) -> Result<(), CacheError> {
        let paths = self.version_paths(family, version);
        tokio::fs::create_dir_all(paths.root())
            .await
            .map_err(|e| CacheError::Io(e.to_string()))?;
        tokio::fs::write(paths.state_marker(), format!("{}\n", state.as_str()))
            .await
            .map_err(|e| CacheError::Io(e.to_string()))
    }

    pub fn subtree_state(&self, family: &str, version: &str) -> Option<SubtreeState> {
        let marker = self.version_paths(family, version).state_marker();
        std::fs::read_to_string(marker)
            .ok()
            .and_then(|content| SubtreeState::parse(&content))
    }

    /// Protect a version subtree from eviction while the pin lives
    ///
    /// Waits for an eviction of the same version that is already under way.
    pub async fn pin(&self, family: &str, version: &str) -> CachePin {
        let guard = self.version_lock(family, version).read_owned().await;
        log_debug!(MODULE, "Pinned {}/{}", family, version);
        CachePin { _guard: guard }
    }

    /// Remove every artifact and tree of a version
    ///
    /// Returns `false` if there was nothing to remove or the version is in
    /// use by a running session.
    pub async fn evict(
        &self,
        family: &str,
        version: &str,
        runner: &dyn ToolRunner,
    ) -> Result<bool, CacheError> {
        // Held until the subtree is gone; pins and downloads wait on it
        let _exclusive = match self.version_lock(family, version).try_write_owned() {
            Ok(guard) => guard,
            Err(_) => {
                log_warn!(MODULE, "Not evicting {}/{}: in use", family, version);
                return Ok(false);
            }
        };

        let paths = self.version_paths(family, version);
        if !paths.root().exists() {
            log_debug!(MODULE, "Nothing cached for {}/{}", family, version);
            return Ok(false);
        }

        // Readers see either the whole subtree or none of it
        let trash = self
            .family_dir(family)
            .join(format!("{}{}", TRASH_PREFIX, Uuid::new_v4()));
        tokio::fs::rename(paths.root(), &trash).await.map_err(|e| {
            CacheError::Io(format!(
                "Failed to move {} aside: {}",
                paths.root().display(),
                e
            ))
        })?;
        log_info!(MODULE, "Evicting {}/{}", family, version);
        remove_trash(&trash, runner).await?;
        Ok(true)
    }

    /// Evict every cached version of a family except `keep_version`
    pub async fn evict_other_versions(
        &self,
        family: &str,
        keep_version: &str,
        runner: &dyn ToolRunner,
    ) -> Result<Vec<String>, CacheError> {
        let family_dir = self.family_dir(family);
        let keep = sanitize_component(keep_version);
        let mut evicted = Vec::new();

        let mut entries = match tokio::fs::read_dir(&family_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(evicted),
            Err(e) => return Err(CacheError::Io(e.to_string())),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::Io(e.to_string()))?
        {
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        for name in names {
            if name.starts_with(TRASH_PREFIX) {
                // Left behind by an interrupted eviction
                if let Err(e) = remove_trash(&family_dir.join(&name), runner).await {
                    log_warn!(MODULE, "Could not remove {}: {}", name, e);
                }
                continue;
            }
            if name == keep {
                continue;
            }
            if self.evict(family, &name, runner).await? {
                evicted.push(name);
            }
        }

        if !evicted.is_empty() {
            log_info!(
                MODULE,
                "Evicted stale {} versions: {}",
                family,
                evicted.join(", ")
            );
        }
        Ok(evicted)
    }

    /// Give a kept version subtree to the operator's account
    pub async fn hand_over(
        &self,
        family: &str,
        version: &str,
        owner: &str,
        runner: &dyn ToolRunner,
    ) -> Result<(), CacheError> {
        let paths = self.version_paths(family, version);
        if !paths.root().exists() {
            return Ok(());
        }
        let command = ToolCommand::new(
            "chown",
            vec![
                "-R".to_string(),
                format!("{}:{}", owner, owner),
                paths.root().to_string_lossy().to_string(),
            ],
        )
        .privileged();
        let (code, output) = runner
            .run(&command)
            .await
            .map_err(|e| CacheError::Io(e.to_string()))?;
        if code != 0 {
            return Err(CacheError::Io(format!(
                "chown exited with code {}: {}",
                code,
                output.last().map(String::as_str).unwrap_or("")
            )));
        }
        log_info!(
            MODULE,
            "Handed {} over to {}",
            paths.root().display(),
            owner
        );
        Ok(())
    }
}

/// Keeps a version subtree from being evicted
pub struct CachePin {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Delete a moved-aside subtree, escalating for root-owned files
async fn remove_trash(trash: &Path, runner: &dyn ToolRunner) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(trash).await {
        Ok(()) => Ok(()),
        Err(e) => {
            log_debug!(
                MODULE,
                "Unprivileged removal of {} failed ({}), retrying privileged",
                trash.display(),
                e
            );
            let command = ToolCommand::new(
                "rm",
                vec!["-rf".to_string(), trash.to_string_lossy().to_string()],
            )
            .privileged();
            let (code, _) = runner
                .run(&command)
                .await
                .map_err(|e| CacheError::Io(e.to_string()))?;
            if code == 0 {
                Ok(())
            } else {
                Err(CacheError::Io(format!(
                    "rm -rf {} exited with code {}",
                    trash.display(),
                    code
                )))
            }
        }
    }
}

/// One download, from validation of an existing copy to rename into place
struct DownloadJob {
    paths: VersionPaths,
    version_lock: Arc<RwLock<()>>,
    fetcher: Arc<dyn Fetcher>,
    request: FetchRequest,
    progress: watch::Sender<DownloadProgress>,
}

impl DownloadJob {
    async fn run(self) -> DownloadResult {
        // Not evicted underneath a running download
        let _reading = Arc::clone(&self.version_lock).read_owned().await;
        let target = self.paths.download(&self.request.file_name);
        let partial = self.paths.partial(&self.request.file_name);

        tokio::fs::create_dir_all(self.paths.downloads())
            .await
            .map_err(|e| CacheError::Io(format!("Failed to create download directory: {}", e)))?;

        if self.validate_existing(&target).await? {
            log_info!(MODULE, "Using cached {}", target.display());
            return Ok(target);
        }

        // Left over from an interrupted run
        if tokio::fs::remove_file(&partial).await.is_ok() {
            log_debug!(MODULE, "Removed stale {}", partial.display());
        }

        log_info!(MODULE, "Downloading {} -> {}", self.request.url, target.display());
        let progress = self.progress;
        let report = move |p: DownloadProgress| {
            progress.send_replace(p);
        };
        let outcome = match self
            .fetcher
            .fetch(&self.request.url, &partial, &report)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        let corrupt = |reason: String| CacheError::Corrupt {
            path: target.clone(),
            reason,
        };

        if outcome.written == 0 {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(corrupt("empty download".to_string()));
        }
        if let Some(expected) = outcome.expected {
            if outcome.written != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                log_error!(
                    MODULE,
                    "Truncated download of {}: {} of {} bytes",
                    self.request.file_name,
                    outcome.written,
                    expected
                );
                return Err(corrupt(format!(
                    "truncated: received {} of {} bytes",
                    outcome.written, expected
                )));
            }
        }

        if let Some(expected) = &self.request.sha256 {
            log_info!(MODULE, "Verifying SHA256 of {}", self.request.file_name);
            let actual = sha256_file(&partial).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&partial).await;
                log_error!(
                    MODULE,
                    "SHA256 verification FAILED! Expected: {}, Got: {}",
                    expected,
                    actual
                );
                return Err(corrupt(format!(
                    "SHA256 mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
            log_info!(MODULE, "SHA256 verification PASSED");
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| CacheError::Io(format!("Failed to move file into place: {}", e)))?;
        log_info!(
            MODULE,
            "{} ready ({})",
            target.display(),
            format_size(outcome.written)
        );
        Ok(target)
    }

    /// Whether `target` is a usable copy; invalid copies are deleted
    async fn validate_existing(&self, target: &Path) -> Result<bool, CacheError> {
        let meta = match tokio::fs::metadata(target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CacheError::Io(e.to_string())),
        };

        let valid = if meta.len() == 0 {
            log_warn!(MODULE, "Cached {} is empty", target.display());
            false
        } else if let Some(expected) = &self.request.sha256 {
            let actual = sha256_file(target).await?;
            let matches = actual.eq_ignore_ascii_case(expected);
            if !matches {
                log_warn!(
                    MODULE,
                    "Cached {} fails SHA256 check, downloading again",
                    target.display()
                );
            }
            matches
        } else {
            true
        };

        if !valid {
            tokio::fs::remove_file(target)
                .await
                .map_err(|e| CacheError::Io(format!("Failed to remove corrupt file: {}", e)))?;
            // The replacement has to be unpacked again
            let marker = self.paths.marker(&self.request.file_name);
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => log_debug!(MODULE, "Removed stale {}", marker.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::Io(format!(
                        "Failed to remove {}: {}",
                        marker.display(),
                        e
                    )))
                }
            }
        }
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ArchiveFormat, ArtifactKind};
    use crate::test_support::{CountingFetcher, ScriptedRunner};
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tokio::sync::Notify;

    const BODY: &[u8] = b"Linux_for_Tegra payload";

    fn request(family: &str, version: &str, kind: ArtifactKind, file: &str) -> FetchRequest {
        FetchRequest {
            key: CacheKey {
                family: family.into(),
                version: version.into(),
                kind,
            },
            url: format!("https://example.com/{}", file),
            file_name: file.into(),
            sha256: None,
        }
    }

    fn cache_with(fetcher: Arc<CountingFetcher>) -> (tempfile::TempDir, ArchiveCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArchiveCache::new(dir.path().join("cache"), fetcher);
        (dir, cache)
    }

    #[tokio::test]
    async fn test_second_ensure_uses_cache() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher.clone());
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        let first = cache.ensure(&req).await.unwrap();
        let second = cache.ensure(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), BODY);
        assert_eq!(cache.entry(&req).state, CacheState::Present);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_collapses() {
        let fetcher = Arc::new(CountingFetcher::new(BODY).with_delay(Duration::from_millis(50)));
        let (_dir, cache) = cache_with(fetcher.clone());
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        let (a, b, c) = tokio::join!(cache.ensure(&req), cache.ensure(&req), cache.ensure(&req));
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_download_separately() {
        let fetcher = Arc::new(CountingFetcher::new(BODY).with_delay(Duration::from_millis(20)));
        let (_dir, cache) = cache_with(fetcher.clone());
        let bsp = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        let rootfs = request("t234", "6.2", ArtifactKind::RootFs, "rootfs.tbz2");

        let (a, b) = tokio::join!(cache.ensure(&bsp), cache.ensure(&rootfs));
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_truncated_download_is_never_present() {
        let fetcher = Arc::new(CountingFetcher::new(BODY).truncating());
        let (_dir, cache) = cache_with(fetcher);
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        let err = cache.ensure(&req).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
        assert!(err.is_transient());

        let paths = cache.version_paths("t234", "6.2");
        assert!(!paths.download("bsp.tbz2").exists());
        assert!(!paths.partial("bsp.tbz2").exists());
        assert_eq!(cache.entry(&req).state, CacheState::Absent);
    }

    #[tokio::test]
    async fn test_stale_partial_from_crash_is_discarded() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher.clone());
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        let paths = cache.version_paths("t234", "6.2");
        std::fs::create_dir_all(paths.downloads()).unwrap();
        std::fs::write(paths.partial("bsp.tbz2"), b"half").unwrap();

        let path = cache.ensure(&req).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), BODY);
        assert!(!paths.partial("bsp.tbz2").exists());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_on_cached_file_refetches() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher.clone());
        let mut req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        req.sha256 = Some(hex::encode(Sha256::digest(BODY)));

        let paths = cache.version_paths("t234", "6.2");
        std::fs::create_dir_all(paths.downloads()).unwrap();
        std::fs::write(paths.download("bsp.tbz2"), b"bit rot").unwrap();

        let path = cache.ensure(&req).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), BODY);
        assert_eq!(fetcher.calls(), 1);

        // Valid now; no further fetch
        cache.ensure(&req).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_after_download() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        let mut req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        req.sha256 = Some("00".repeat(32));

        let err = cache.ensure(&req).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
        assert!(!cache.version_paths("t234", "6.2").download("bsp.tbz2").exists());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_nothing_behind() {
        let fetcher = Arc::new(CountingFetcher::new(BODY).failing_first(1));
        let (_dir, cache) = cache_with(fetcher.clone());
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        assert!(cache.ensure(&req).await.unwrap_err().is_transient());
        assert_eq!(cache.entry(&req).state, CacheState::Absent);
        cache.ensure(&req).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_progress_reaches_caller() {
        let fetcher = Arc::new(CountingFetcher::new(BODY).with_delay(Duration::from_millis(10)));
        let (_dir, cache) = cache_with(fetcher);
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        let mut seen = Vec::new();
        cache
            .ensure_with_progress(&req, |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(
            seen.last().and_then(|p| p.percent()),
            Some(100.0)
        );
    }

    fn extract_step(archive: &str) -> ExtractStep {
        ExtractStep {
            kind: ArtifactKind::Bsp,
            archive: archive.into(),
            destination: ".".into(),
            format: ArchiveFormat::TarBzip2,
        }
    }

    #[tokio::test]
    async fn test_extract_is_idempotent() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        cache.ensure(&req).await.unwrap();

        let runner = ScriptedRunner::new();
        let step = extract_step("bsp.tbz2");
        assert!(cache
            .extract("t234", "6.2", &step, &runner, 20, &|_: ProgressEvent| {})
            .await
            .unwrap());
        let programs = runner.programs();
        assert_eq!(programs, vec!["mkdir", "tar"]);
        assert!(runner.calls().iter().all(|c| c.privileged));

        assert!(!cache
            .extract("t234", "6.2", &step, &runner, 20, &|_: ProgressEvent| {})
            .await
            .unwrap());
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(cache.entry(&req).state, CacheState::Extracted);
    }

    #[tokio::test]
    async fn test_extract_failure_carries_exit_code() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        cache.ensure(&req).await.unwrap();

        let runner = ScriptedRunner::new().script("tar", &["tar: Unexpected EOF in archive"], 2);
        let err = cache
            .extract("t234", "6.2", &extract_step("bsp.tbz2"), &runner, 20, &|_: ProgressEvent| {})
            .await
            .unwrap_err();
        match err {
            CacheError::Extraction {
                exit_code,
                output_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(output_tail, vec!["tar: Unexpected EOF in archive"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!cache
            .version_paths("t234", "6.2")
            .marker("bsp.tbz2")
            .exists());
    }

    #[tokio::test]
    async fn test_evict_other_versions_keeps_current_and_other_families() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        for (family, version) in [("t234", "5.1.3"), ("t234", "6.2"), ("t194", "5.1.3")] {
            cache
                .ensure(&request(family, version, ArtifactKind::Bsp, "bsp.tbz2"))
                .await
                .unwrap();
        }

        let runner = ScriptedRunner::new();
        let evicted = cache
            .evict_other_versions("t234", "6.2", &runner)
            .await
            .unwrap();
        assert_eq!(evicted, vec!["5.1.3"]);
        assert!(!cache.version_paths("t234", "5.1.3").root().exists());
        assert!(cache.version_paths("t234", "6.2").download("bsp.tbz2").exists());
        assert!(cache.version_paths("t194", "5.1.3").download("bsp.tbz2").exists());

        let leftovers: Vec<_> = std::fs::read_dir(cache.root().join("t234"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["6.2"]);
    }

    #[tokio::test]
    async fn test_pinned_version_survives_eviction() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        cache
            .ensure(&request("t234", "5.1.3", ArtifactKind::Bsp, "bsp.tbz2"))
            .await
            .unwrap();

        let runner = ScriptedRunner::new();
        let pin = cache.pin("t234", "5.1.3").await;
        assert!(!cache.evict("t234", "5.1.3", &runner).await.unwrap());
        assert!(cache.version_paths("t234", "5.1.3").root().exists());

        drop(pin);
        assert!(cache.evict("t234", "5.1.3", &runner).await.unwrap());
        assert!(!cache.version_paths("t234", "5.1.3").root().exists());
    }

    #[tokio::test]
    async fn test_version_with_running_download_is_not_evicted() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher::new(BODY).gate(
            "bsp.tbz2",
            Arc::clone(&started),
            Arc::clone(&release),
        ));
        let (_dir, cache) = cache_with(fetcher);
        let cache = Arc::new(cache);
        let req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");

        let download = {
            let cache = Arc::clone(&cache);
            let req = req.clone();
            tokio::spawn(async move { cache.ensure(&req).await })
        };
        started.notified().await;

        let runner = ScriptedRunner::new();
        assert!(!cache.evict("t234", "6.2", &runner).await.unwrap());

        release.notify_one();
        let path = download.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert!(cache.evict("t234", "6.2", &runner).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_refetched_archive_is_extracted_again() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher.clone());
        let mut req = request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2");
        req.sha256 = Some(hex::encode(Sha256::digest(BODY)));
        cache.ensure(&req).await.unwrap();

        let runner = ScriptedRunner::new();
        let step = extract_step("bsp.tbz2");
        assert!(cache
            .extract("t234", "6.2", &step, &runner, 20, &|_: ProgressEvent| {})
            .await
            .unwrap());

        let paths = cache.version_paths("t234", "6.2");
        std::fs::write(paths.download("bsp.tbz2"), b"bit rot").unwrap();
        cache.ensure(&req).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(!paths.marker("bsp.tbz2").exists());

        assert!(cache
            .extract("t234", "6.2", &step, &runner, 20, &|_: ProgressEvent| {})
            .await
            .unwrap());
        assert_eq!(runner.programs().iter().filter(|p| *p == "tar").count(), 2);
    }

    #[tokio::test]
    async fn test_hand_over_chowns_subtree() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        cache
            .ensure(&request("t234", "6.2", ArtifactKind::Bsp, "bsp.tbz2"))
            .await
            .unwrap();

        let runner = ScriptedRunner::new();
        cache.hand_over("t234", "6.2", "operator", &runner).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "chown");
        assert_eq!(calls[0].args[1], "operator:operator");
        assert!(calls[0].privileged);
    }

    #[tokio::test]
    async fn test_subtree_state_marker() {
        let fetcher = Arc::new(CountingFetcher::new(BODY));
        let (_dir, cache) = cache_with(fetcher);
        assert_eq!(cache.subtree_state("t234", "6.2"), None);
        cache
            .mark_state("t234", "6.2", SubtreeState::Downloaded)
            .await
            .unwrap();
        assert_eq!(
            cache.subtree_state("t234", "6.2"),
            Some(SubtreeState::Downloaded)
        );
    }
}
