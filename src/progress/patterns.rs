//! Output line classification
//!
//! Matches lines from wget, tar and the L4T flashing scripts against a small
//! pattern set. The matcher is stateful: percentages before the download
//! finished marker are download progress, afterwards flash progress.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{EventKind, ProgressEvent};

/// Printed once every artifact is in place
pub const DOWNLOAD_FINISHED_MARKER: &str = "Downloading has been finished!";

/// Whitespace-delimited token directly before a `%`, as wget prints it
static DOWNLOAD_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(\d{1,3})%").expect("valid regex"));

static EXTRACT_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:extracting|untarring|unpacking)\b").expect("valid regex"));

static EXTRACT_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:extraction|extracting)\s+(?:is\s+)?(?:complete|completed|finished|done)\b")
        .expect("valid regex")
});

static FLASH_SUCCESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)flashed successfully|flash is successful|flashing (?:completed|finished) successfully")
        .expect("valid regex")
});

static BANNER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\*{3}\s*(.+?)\s*\*{3}\s*$").expect("valid regex"));

static VERIFY_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)verif\w*\b.*?(\d{1,3}(?:\.\d+)?)\s*%").expect("valid regex")
});

/// `Flashing ... 63%`, `[ 45% ]` from tegraflash, or a trailing percentage
/// after a bar
static FLASH_PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bflashing\b.*?(\d{1,3}(?:\.\d+)?)\s*%|\[\s*(\d{1,3}(?:\.\d+)?)\s*%\s*\]|\]\s*(\d{1,3}(?:\.\d+)?)\s*%\s*$",
    )
    .expect("valid regex")
});

#[derive(Debug, Default)]
pub struct LineMatcher {
    download_finished: bool,
}

impl LineMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matcher for a process that never downloads (extract, prepare, flash)
    pub fn after_download() -> Self {
        Self {
            download_finished: true,
        }
    }

    pub fn classify(&mut self, line: &str) -> ProgressEvent {
        let trimmed = line.trim_end();

        if trimmed.trim() == DOWNLOAD_FINISHED_MARKER {
            self.download_finished = true;
            return ProgressEvent::new(EventKind::DownloadFinished, trimmed);
        }

        if !self.download_finished {
            if let Some(percent) = capture_percent(&DOWNLOAD_PERCENT, trimmed) {
                return ProgressEvent::with_percent(EventKind::DownloadProgress, trimmed, percent);
            }
            return ProgressEvent::log(trimmed);
        }

        if FLASH_SUCCESS.is_match(trimmed) {
            return ProgressEvent::new(EventKind::FlashSucceeded, trimmed);
        }
        if let Some(percent) = capture_percent(&VERIFY_PERCENT, trimmed) {
            return ProgressEvent::with_percent(EventKind::VerifyProgress, trimmed, percent);
        }
        if let Some(percent) = capture_percent(&FLASH_PERCENT, trimmed) {
            return ProgressEvent::with_percent(EventKind::FlashProgress, trimmed, percent);
        }
        if EXTRACT_END.is_match(trimmed) {
            return ProgressEvent::new(EventKind::ExtractFinished, trimmed);
        }
        if EXTRACT_START.is_match(trimmed) {
            return ProgressEvent::new(EventKind::ExtractStarted, trimmed);
        }
        if BANNER.is_match(trimmed) {
            return ProgressEvent::new(EventKind::Banner, trimmed);
        }
        ProgressEvent::log(trimmed)
    }
}

/// First capture group that matched, as a percentage in `0..=100`
fn capture_percent(pattern: &Regex, line: &str) -> Option<f64> {
    let caps = pattern.captures(line)?;
    let value = caps
        .iter()
        .skip(1)
        .flatten()
        .next()?
        .as_str()
        .parse::<f64>()
        .ok()?;
    (0.0..=100.0).contains(&value).then_some(value)
}
