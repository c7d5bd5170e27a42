//! Command sequencer
//!
//! Drives one session per device through the flash states. Only downloads
//! retry automatically; any other failure ends the session with the state it
//! happened in, the tool's exit code and the tail of its output.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::host::{check_preconditions, HostProbe};
use super::session::{
    tool_event_percent, DeviceLease, DeviceRegistry, SessionEvents, SessionHandle, SessionReport,
};
use super::{FlashRequest, SessionState};
use crate::cache::{ArchiveCache, CachePin, DownloadProgress, FetchRequest, SubtreeState};
use crate::config::Settings;
use crate::error::{CacheError, FlashError, RunnerError};
use crate::plan::{ConfigResolver, FlashPlan};
use crate::progress::{
    EventKind, ProcessOutcome, ProgressBridge, ProgressEvent, Stage, DOWNLOAD_FINISHED_MARKER,
};
use crate::runner::{ToolCommand, ToolRunner};
use crate::{log_debug, log_error, log_info, log_warn};

const MODULE: &str = "sequencer";

/// Why a session stopped before Complete
struct Abort {
    state: SessionState,
    error: FlashError,
    exit_code: Option<i32>,
    output_tail: Vec<String>,
}

impl Abort {
    fn new(state: SessionState, error: FlashError) -> Self {
        Self {
            state,
            error,
            exit_code: None,
            output_tail: Vec::new(),
        }
    }

    fn with_output(mut self, exit_code: Option<i32>, output_tail: Vec<String>) -> Self {
        self.exit_code = exit_code;
        self.output_tail = output_tail;
        self
    }
}

/// Live state of one session
struct FlashSession {
    id: Uuid,
    device_id: String,
    plan: Option<FlashPlan>,
    state: SessionState,
    started_at: DateTime<Utc>,
    cancel_requested: Arc<AtomicBool>,
    events: SessionEvents,
    /// Keeps the session's version out of eviction until Complete
    pin: Option<CachePin>,
}

impl FlashSession {
    /// Move to `state`, honoring a pending cancellation first
    fn enter(&mut self, state: SessionState) -> Result<(), Abort> {
        if self.cancel_requested.load(Ordering::SeqCst) {
            log_info!(
                MODULE,
                "Session {} cancelled on entering {}",
                self.id,
                state
            );
            return Err(Abort::new(state, FlashError::Cancelled));
        }
        log_info!(MODULE, "Session {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.events.state(state, Some(0.0));
        Ok(())
    }
}

/// Output of a tool run through the progress bridge
struct ToolRun {
    outcome: ProcessOutcome,
    /// The tool printed its success message
    reported_success: bool,
}

#[derive(Clone)]
pub struct CommandSequencer {
    resolver: Arc<ConfigResolver>,
    cache: Arc<ArchiveCache>,
    runner: Arc<dyn ToolRunner>,
    probe: Arc<dyn HostProbe>,
    settings: Arc<Settings>,
    devices: DeviceRegistry,
}

impl CommandSequencer {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        cache: Arc<ArchiveCache>,
        runner: Arc<dyn ToolRunner>,
        probe: Arc<dyn HostProbe>,
        settings: Settings,
    ) -> Self {
        Self {
            resolver,
            cache,
            runner,
            probe,
            settings: Arc::new(settings),
            devices: DeviceRegistry::default(),
        }
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Start a session in the background
    ///
    /// Fails immediately with `SessionAlreadyActive` if the device already
    /// has a running session.
    pub fn start(&self, request: FlashRequest) -> Result<SessionHandle, FlashError> {
        let lease = self.devices.acquire(&request.device_id)?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let events = SessionEvents::new(id);
        let hub = events.hub();
        log_info!(
            MODULE,
            "Starting session {} for device {}",
            id,
            request.device_id
        );

        let session = FlashSession {
            id,
            device_id: request.device_id.clone(),
            plan: None,
            state: SessionState::Idle,
            started_at,
            cancel_requested: Arc::clone(&cancel),
            events,
            pin: None,
        };

        let this = self.clone();
        let task_request = request.clone();
        let task = tokio::spawn(async move { this.drive(session, task_request, lease).await });

        Ok(SessionHandle {
            id,
            request,
            started_at,
            cancel,
            hub,
            task,
        })
    }

    /// Run a session to its end
    pub async fn run(&self, request: FlashRequest) -> Result<SessionReport, FlashError> {
        Ok(self.start(request)?.wait().await)
    }

    /// Start a fresh session for the same request
    ///
    /// Re-enters at Resolving; archives and extracted trees that are still
    /// valid are reused.
    pub fn retry(&self, report: &SessionReport) -> Result<SessionHandle, FlashError> {
        log_info!(
            MODULE,
            "Retrying session {} ({})",
            report.session_id,
            report.state
        );
        self.start(report.request.clone())
    }

    async fn drive(
        &self,
        mut session: FlashSession,
        request: FlashRequest,
        lease: DeviceLease,
    ) -> SessionReport {
        let result = self.execute(&mut session, &request).await;
        session.pin = None;

        let (state, failed_state, error, exit_code, output_tail) = match result {
            Ok(()) => (SessionState::Complete, None, None, None, Vec::new()),
            Err(abort) => {
                let state = if abort.error == FlashError::Cancelled {
                    SessionState::Cancelled
                } else {
                    SessionState::Failed
                };
                log_error!(
                    MODULE,
                    "Session {} {} in {}: {}",
                    session.id,
                    state,
                    abort.state,
                    abort.error
                );
                for line in &abort.output_tail {
                    log_debug!(MODULE, "  | {}", line);
                }
                (
                    state,
                    Some(abort.state),
                    Some(abort.error),
                    abort.exit_code,
                    abort.output_tail,
                )
            }
        };
        session.state = state;

        // Free the device before subscribers see the end of the session
        drop(lease);
        session.events.finish(state);
        log_info!(MODULE, "Session {} finished: {}", session.id, state);

        SessionReport {
            session_id: session.id,
            device_id: session.device_id,
            request,
            plan: session.plan,
            started_at: session.started_at,
            finished_at: Utc::now(),
            state,
            failed_state,
            error,
            exit_code,
            output_tail,
        }
    }

    async fn execute(
        &self,
        session: &mut FlashSession,
        request: &FlashRequest,
    ) -> Result<(), Abort> {
        session.enter(SessionState::Resolving)?;
        let plan = self
            .resolver
            .resolve(&request.selector, &request.options)
            .map_err(|e| Abort::new(SessionState::Resolving, e.into()))?;
        session.plan = Some(plan.clone());

        session.enter(SessionState::Downloading)?;
        self.download(session, &plan).await?;

        session.enter(SessionState::Extracting)?;
        self.extract(session, &plan).await?;

        session.enter(SessionState::Preparing)?;
        self.prepare(session, &plan).await?;

        // Cancellation from here on waits for the flash tool to finish
        session.enter(SessionState::Flashing)?;
        let reported_success = self.flash(session, &plan).await?;

        session.enter(SessionState::Verifying)?;
        if reported_success {
            log_info!(MODULE, "Flash tool reported success");
        } else {
            log_warn!(
                MODULE,
                "Flash tool exited cleanly without printing a success message"
            );
        }
        session.events.state(SessionState::Verifying, Some(100.0));

        self.complete(session, &plan).await;
        Ok(())
    }

    async fn download(&self, session: &mut FlashSession, plan: &FlashPlan) -> Result<(), Abort> {
        let state = SessionState::Downloading;
        check_preconditions(&plan.host, self.probe.as_ref(), self.cache.root())
            .map_err(|e| Abort::new(state, e))?;

        session.pin = Some(self.cache.pin(&plan.family, &plan.version).await);
        self.evict_stale(plan).await;

        let total = plan.artifacts.len().max(1) as f64;
        for (index, artifact) in plan.artifacts.iter().enumerate() {
            let request = FetchRequest::for_artifact(plan, artifact);
            let events = session.events.clone();
            let file_name = artifact.local_file_name.clone();
            let on_progress = move |progress: DownloadProgress| {
                if let Some(percent) = progress.percent() {
                    let stage_percent = (index as f64 + percent / 100.0) / total * 100.0;
                    events.event(
                        state,
                        ProgressEvent::with_percent(
                            EventKind::DownloadProgress,
                            format!("{} {:.0}%", file_name, percent),
                            percent,
                        ),
                        Some(Stage::Downloading.overall_percent(stage_percent)),
                    );
                }
            };

            self.ensure_with_retry(&request, on_progress)
                .await
                .map_err(|e| Abort::new(state, FlashError::DownloadFailed(e.to_string())))?;
            session
                .events
                .state(state, Some((index + 1) as f64 / total * 100.0));
        }

        if let Err(e) = self
            .cache
            .mark_state(&plan.family, &plan.version, SubtreeState::Downloaded)
            .await
        {
            log_warn!(MODULE, "Could not record download state: {}", e);
        }
        session.events.event(
            state,
            ProgressEvent::new(EventKind::DownloadFinished, DOWNLOAD_FINISHED_MARKER),
            Some(Stage::Downloading.overall_percent(100.0)),
        );
        Ok(())
    }

    /// Make one artifact present, retrying transient failures with
    /// exponential backoff
    async fn ensure_with_retry<F>(
        &self,
        request: &FetchRequest,
        mut on_progress: F,
    ) -> Result<PathBuf, CacheError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let retries = self.settings.download_retries;
        let mut backoff = self.settings.retry_backoff();
        let mut attempt = 0;

        loop {
            match self
                .cache
                .ensure_with_progress(request, &mut on_progress)
                .await
            {
                Ok(path) => return Ok(path),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    log_warn!(
                        MODULE,
                        "Download of {} failed: {}. Retry {}/{} in {:?}",
                        request.key,
                        e,
                        attempt,
                        retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    log_error!(MODULE, "Download of {} failed: {}", request.key, e);
                    return Err(e);
                }
            }
        }
    }

    async fn extract(&self, session: &mut FlashSession, plan: &FlashPlan) -> Result<(), Abort> {
        let state = SessionState::Extracting;
        self.evict_stale(plan).await;

        let total = plan.extract_steps.len().max(1) as f64;
        for (index, step) in plan.extract_steps.iter().enumerate() {
            session.events.event(
                state,
                ProgressEvent::new(
                    EventKind::ExtractStarted,
                    format!("Extracting {}", step.archive),
                ),
                None,
            );

            let events = session.events.clone();
            let on_event = move |event: ProgressEvent| {
                if !event.is_terminal() {
                    events.event(state, event, None);
                }
            };
            self.cache
                .extract(
                    &plan.family,
                    &plan.version,
                    step,
                    self.runner.as_ref(),
                    self.settings.output_tail_lines,
                    &on_event,
                )
                .await
                .map_err(|e| extraction_abort(state, e))?;

            session.events.event(
                state,
                ProgressEvent::new(
                    EventKind::ExtractFinished,
                    format!("Extracted {}", step.archive),
                ),
                Some(Stage::Extracting.overall_percent((index + 1) as f64 / total * 100.0)),
            );
        }

        if let Err(e) = self
            .cache
            .mark_state(&plan.family, &plan.version, SubtreeState::Extracted)
            .await
        {
            log_warn!(MODULE, "Could not record extraction state: {}", e);
        }
        Ok(())
    }

    async fn prepare(&self, session: &mut FlashSession, plan: &FlashPlan) -> Result<(), Abort> {
        let state = SessionState::Preparing;
        let tree = self.cache.version_paths(&plan.family, &plan.version).tree();
        let total = plan.prepare_steps.len();

        for (index, step) in plan.prepare_steps.iter().enumerate() {
            log_info!(
                MODULE,
                "Prepare step {}/{}: {}",
                index + 1,
                total,
                step.name
            );
            let failed = || {
                Abort::new(
                    state,
                    FlashError::PrepareStepFailed {
                        index,
                        name: step.name.clone(),
                    },
                )
            };

            let command = step.command.bind(&tree);
            match self.run_tool(&session.events, state, &command).await {
                Ok(run) if run.outcome.success() => {}
                Ok(run) => {
                    return Err(failed()
                        .with_output(Some(run.outcome.exit_code), run.outcome.output_tail))
                }
                Err(e) => return Err(failed().with_output(None, vec![e.to_string()])),
            }

            session.events.state(
                state,
                Some((index + 1) as f64 / total.max(1) as f64 * 100.0),
            );
        }
        Ok(())
    }

    /// Run the flash tool; returns whether it printed a success message
    async fn flash(&self, session: &mut FlashSession, plan: &FlashPlan) -> Result<bool, Abort> {
        let state = SessionState::Flashing;
        if self.settings.stop_automount {
            self.stop_automount().await;
        }

        let tree = self.cache.version_paths(&plan.family, &plan.version).tree();
        let command = plan.flash_command.bind(&tree);
        log_info!(
            MODULE,
            "Flashing {} onto {}: {}",
            plan.board,
            plan.storage_device,
            command.display()
        );

        match self.run_tool(&session.events, state, &command).await {
            Ok(run) if run.outcome.success() => Ok(run.reported_success),
            Ok(run) => Err(Abort::new(
                state,
                FlashError::FlashToolError {
                    exit_code: run.outcome.exit_code,
                },
            )
            .with_output(Some(run.outcome.exit_code), run.outcome.output_tail)),
            // Never started, so there is no exit code to report
            Err(e) => Err(Abort::new(state, FlashError::FlashToolError { exit_code: -1 })
                .with_output(None, vec![e.to_string()])),
        }
    }

    async fn complete(&self, session: &mut FlashSession, plan: &FlashPlan) {
        // Unpin first or the session's own version is never evictable
        session.pin = None;

        if plan.keep_artifacts {
            if let Err(e) = self
                .cache
                .hand_over(&plan.family, &plan.version, &plan.owner, self.runner.as_ref())
                .await
            {
                log_warn!(MODULE, "Could not hand cached files to {}: {}", plan.owner, e);
            }
            return;
        }

        match self
            .cache
            .evict(&plan.family, &plan.version, self.runner.as_ref())
            .await
        {
            Ok(true) => log_info!(
                MODULE,
                "Removed cached {} {} after successful flash",
                plan.family,
                plan.version
            ),
            Ok(false) => log_debug!(MODULE, "Cached {} {} left in place", plan.family, plan.version),
            Err(e) => log_warn!(MODULE, "Could not remove cached files: {}", e),
        }
    }

    async fn run_tool(
        &self,
        events: &SessionEvents,
        state: SessionState,
        command: &ToolCommand,
    ) -> Result<ToolRun, RunnerError> {
        log_debug!(MODULE, "Running {}", command.display());
        let process = self.runner.spawn(command).await?;
        let stream = ProgressBridge::attach(process, self.settings.output_tail_lines);

        let mut reported_success = false;
        let mut updates = stream.subscribe();
        while let Some(event) = updates.next().await {
            if event.is_terminal() {
                continue;
            }
            if event.kind == EventKind::FlashSucceeded {
                reported_success = true;
            }
            let overall = tool_event_percent(state, &event);
            events.event(state, event, overall);
        }

        let outcome = stream.wait().await?;
        Ok(ToolRun {
            outcome,
            reported_success,
        })
    }

    async fn evict_stale(&self, plan: &FlashPlan) {
        match self
            .cache
            .evict_other_versions(&plan.family, &plan.version, self.runner.as_ref())
            .await
        {
            Ok(evicted) if !evicted.is_empty() => log_info!(
                MODULE,
                "Evicted {} versions {} before using {}",
                plan.family,
                evicted.join(", "),
                plan.version
            ),
            Ok(_) => {}
            Err(e) => log_warn!(MODULE, "Could not evict stale versions: {}", e),
        }
    }

    /// Keep the desktop automounter away from the board's partitions
    async fn stop_automount(&self) {
        let command = ToolCommand::new(
            "systemctl",
            vec!["stop".to_string(), "udisks2.service".to_string()],
        )
        .privileged();
        match self.runner.run(&command).await {
            Ok((0, _)) => log_info!(MODULE, "Stopped udisks2.service"),
            Ok((code, _)) => log_warn!(
                MODULE,
                "Stopping udisks2.service exited with code {}",
                code
            ),
            Err(e) => log_warn!(MODULE, "Could not stop udisks2.service: {}", e),
        }
    }
}

fn extraction_abort(state: SessionState, error: CacheError) -> Abort {
    match error {
        CacheError::Extraction {
            archive,
            exit_code,
            output_tail,
        } => Abort::new(
            state,
            FlashError::ExtractionFailed(format!(
                "{} (exit code {})",
                archive,
                exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
            )),
        )
        .with_output(exit_code, output_tail),
        other => Abort::new(state, FlashError::ExtractionFailed(other.to_string())),
    }
}
