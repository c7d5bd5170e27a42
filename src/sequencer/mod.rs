//! Flash session sequencing
//!
//! A session walks a resolved plan through
//! `Resolving -> Downloading -> Extracting -> Preparing -> Flashing ->
//! Verifying -> Complete`, ending early in `Failed` or `Cancelled`.
//! Cancellation is cooperative and only observed when a state is entered.

mod engine;
mod host;
mod session;

pub use engine::CommandSequencer;
pub use host::{check_preconditions, HostProbe, SystemHostProbe};
pub use session::{SessionHandle, SessionReport, SessionUpdate};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compat::DeviceSelector;
use crate::plan::FlashOptions;
use crate::progress::Stage;

/// States of a flash session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Resolving,
    Downloading,
    Extracting,
    Preparing,
    Flashing,
    Verifying,
    Complete,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Progress band of a working state
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SessionState::Downloading => Some(Stage::Downloading),
            SessionState::Extracting => Some(Stage::Extracting),
            SessionState::Preparing => Some(Stage::Preparing),
            SessionState::Flashing => Some(Stage::Flashing),
            SessionState::Verifying => Some(Stage::Verifying),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Downloading => "downloading",
            SessionState::Extracting => "extracting",
            SessionState::Preparing => "preparing",
            SessionState::Flashing => "flashing",
            SessionState::Verifying => "verifying",
            SessionState::Complete => "complete",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an operator supplies to start a flash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub selector: DeviceSelector,
    pub options: FlashOptions,
    /// Identifies the physical board; one active session per id
    pub device_id: String,
}
