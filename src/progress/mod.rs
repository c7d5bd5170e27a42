//! Progress reporting
//!
//! Typed events scraped from tool output, the fan-out hub delivering them,
//! and the bridge attaching both to a running process.

mod bridge;
mod hub;
mod patterns;

pub use bridge::{OutputTail, ProcessOutcome, ProgressBridge, ProgressStream};
pub use hub::{ProgressHub, Subscription};
pub use patterns::{LineMatcher, DOWNLOAD_FINISHED_MARKER};

use serde::Serialize;

/// What a progress event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DownloadProgress,
    DownloadFinished,
    ExtractStarted,
    ExtractFinished,
    FlashProgress,
    VerifyProgress,
    /// Flash tool announcing a phase (`*** ... ***`)
    Banner,
    FlashSucceeded,
    /// Unmatched output line
    Log,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    /// Source line, or a short description for synthesized events
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            percent: None,
            exit_code: None,
        }
    }

    pub fn with_percent(kind: EventKind, message: impl Into<String>, percent: f64) -> Self {
        Self {
            percent: Some(percent),
            ..Self::new(kind, message)
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(EventKind::Log, message)
    }

    pub fn complete() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::new(EventKind::Complete, "process exited successfully")
        }
    }

    pub fn error(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::new(
                EventKind::Error,
                format!("process exited with code {}", exit_code),
            )
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete | EventKind::Error)
    }
}

/// Working stage of a session, for overall percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Extracting,
    Preparing,
    Flashing,
    Verifying,
}

impl Stage {
    /// Overall-percentage band `[start, end)` this stage covers
    pub fn band(&self) -> (f64, f64) {
        match self {
            Stage::Downloading => (0.0, 30.0),
            Stage::Extracting => (30.0, 40.0),
            Stage::Preparing => (40.0, 50.0),
            Stage::Flashing => (50.0, 95.0),
            Stage::Verifying => (95.0, 100.0),
        }
    }

    /// Map a stage-local percentage onto the overall scale
    pub fn overall_percent(&self, stage_percent: f64) -> f64 {
        let (start, end) = self.band();
        start + (end - start) * stage_percent.clamp(0.0, 100.0) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_percent_bands() {
        assert_eq!(Stage::Downloading.overall_percent(0.0), 0.0);
        assert_eq!(Stage::Downloading.overall_percent(50.0), 15.0);
        assert_eq!(Stage::Flashing.overall_percent(100.0), 95.0);
        assert_eq!(Stage::Verifying.overall_percent(100.0), 100.0);
        // out-of-range inputs are clamped
        assert_eq!(Stage::Extracting.overall_percent(250.0), 40.0);
    }

    #[test]
    fn test_terminal_events() {
        assert!(ProgressEvent::complete().is_terminal());
        assert_eq!(ProgressEvent::error(2).exit_code, Some(2));
        assert!(!ProgressEvent::log("x").is_terminal());
    }
}
