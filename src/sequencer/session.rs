//! Session bookkeeping
//!
//! The handle an operator holds, the updates a session publishes, the
//! final report, and the per-device lease that keeps sessions exclusive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{FlashRequest, SessionState};
use crate::error::FlashError;
use crate::plan::FlashPlan;
use crate::progress::{ProgressEvent, ProgressHub, Stage, Subscription};
use crate::utils::format_elapsed;
use crate::log_info;

const MODULE: &str = "sequencer::session";

/// One step of session progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUpdate {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Overall progress, 0-100, never decreasing within a session
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<ProgressEvent>,
}

/// How a session ended
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub device_id: String,
    pub request: FlashRequest,
    pub plan: Option<FlashPlan>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Complete, Failed or Cancelled
    pub state: SessionState,
    /// State the session was in when it failed or was cancelled
    pub failed_state: Option<SessionState>,
    pub error: Option<FlashError>,
    pub exit_code: Option<i32>,
    /// Last lines of output from the tool that failed
    pub output_tail: Vec<String>,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        self.state == SessionState::Complete
    }

    /// One-line outcome for logs and the CLI
    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_seconds().max(0) as u64;
        let head = format!(
            "session {} {} after {}",
            self.session_id,
            self.state,
            format_elapsed(elapsed)
        );
        match (&self.error, self.failed_state) {
            (Some(error), Some(state)) => format!("{} in {}: {}", head, state, error),
            (Some(error), None) => format!("{}: {}", head, error),
            _ => head,
        }
    }
}

/// Publishes session updates, keeping the overall percentage monotonic
#[derive(Clone)]
pub(super) struct SessionEvents {
    session_id: Uuid,
    hub: ProgressHub<SessionUpdate>,
    percent: Arc<Mutex<f64>>,
}

impl SessionEvents {
    pub(super) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            hub: ProgressHub::new(),
            percent: Arc::new(Mutex::new(0.0)),
        }
    }

    fn advance(&self, percent: Option<f64>) -> f64 {
        let mut current = self.percent.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(percent) = percent {
            if percent > *current {
                *current = percent;
            }
        }
        *current
    }

    /// Publish a state-level update; `stage_percent` is within the state's band
    pub(super) fn state(&self, state: SessionState, stage_percent: Option<f64>) {
        let overall = state
            .stage()
            .zip(stage_percent)
            .map(|(stage, p)| stage.overall_percent(p));
        self.send(state, overall, None);
    }

    /// Publish an event from a tool or the cache
    pub(super) fn event(&self, state: SessionState, event: ProgressEvent, overall: Option<f64>) {
        self.send(state, overall, Some(event));
    }

    fn send(&self, state: SessionState, overall: Option<f64>, event: Option<ProgressEvent>) {
        let percent = self.advance(overall);
        self.hub.publish(SessionUpdate {
            session_id: self.session_id,
            state,
            percent,
            event,
        });
    }

    pub(super) fn finish(&self, state: SessionState) {
        let percent = if state == SessionState::Complete {
            self.advance(Some(100.0))
        } else {
            self.advance(None)
        };
        self.hub.close(SessionUpdate {
            session_id: self.session_id,
            state,
            percent,
            event: None,
        });
    }

    pub(super) fn hub(&self) -> ProgressHub<SessionUpdate> {
        self.hub.clone()
    }
}

/// Map a tool event reported in `state` onto the overall scale
///
/// Only the flash tool's percentages move the overall figure; prepare
/// scripts print unrelated bars.
pub(super) fn tool_event_percent(state: SessionState, event: &ProgressEvent) -> Option<f64> {
    use crate::progress::EventKind;

    if state != SessionState::Flashing {
        return None;
    }
    let percent = event.percent?;
    match event.kind {
        EventKind::FlashProgress => Some(Stage::Flashing.overall_percent(percent)),
        EventKind::VerifyProgress => Some(Stage::Verifying.overall_percent(percent)),
        _ => None,
    }
}

type DeviceSet = Arc<Mutex<HashSet<String>>>;

fn lock(devices: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    devices.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of devices with an active session
#[derive(Clone, Default)]
pub(super) struct DeviceRegistry {
    active: DeviceSet,
}

impl DeviceRegistry {
    /// Claim a device, or fail immediately if it is busy
    pub(super) fn acquire(&self, device_id: &str) -> Result<DeviceLease, FlashError> {
        let mut active = lock(&self.active);
        if !active.insert(device_id.to_string()) {
            return Err(FlashError::SessionAlreadyActive(device_id.to_string()));
        }
        Ok(DeviceLease {
            active: Arc::clone(&self.active),
            device_id: device_id.to_string(),
        })
    }
}

/// Held for the lifetime of a session; releases the device on drop
pub(super) struct DeviceLease {
    active: DeviceSet,
    device_id: String,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.device_id);
        log_info!(MODULE, "Released device {}", self.device_id);
    }
}

/// Operator's view of a running session
pub struct SessionHandle {
    pub(super) id: Uuid,
    pub(super) request: FlashRequest,
    pub(super) started_at: DateTime<Utc>,
    pub(super) cancel: Arc<AtomicBool>,
    pub(super) hub: ProgressHub<SessionUpdate>,
    pub(super) task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.request.device_id
    }

    /// Request cancellation
    ///
    /// Takes effect the next time the session enters a state; a running
    /// flash tool is never interrupted.
    pub fn cancel(&self) {
        log_info!(MODULE, "Cancellation requested for session {}", self.id);
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> Subscription<SessionUpdate> {
        self.hub.subscribe()
    }

    pub async fn wait(self) -> SessionReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => SessionReport {
                session_id: self.id,
                device_id: self.request.device_id.clone(),
                request: self.request,
                plan: None,
                started_at: self.started_at,
                finished_at: Utc::now(),
                state: SessionState::Failed,
                failed_state: None,
                // Only reachable if the session task panicked
                error: None,
                exit_code: None,
                output_tail: vec![format!("session task ended abnormally: {}", e)],
            },
        }
    }
}
