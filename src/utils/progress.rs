//! Byte progress tracking
//!
//! Speed and percentage bookkeeping for downloads and hashing, logged at a
//! fixed MB interval.

use std::time::Instant;

use super::bytes_to_mb;
use crate::{log_debug, log_info};

/// Progress tracker for byte-oriented operations
pub struct ProgressTracker {
    /// Operation name for logging (e.g., "Download", "SHA256")
    operation: &'static str,
    /// Module name for logging
    module: &'static str,
    /// Total bytes to process (0 if unknown)
    total_bytes: u64,
    processed_bytes: u64,
    start_time: Instant,
    last_log_time: Instant,
    last_log_bytes: u64,
    log_interval_bytes: u64,
}

/// Progress snapshot produced when a log interval is crossed
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub current_mb: f64,
    pub total_mb: f64,
    /// Percentage complete, `None` when the total is unknown
    pub percent: Option<f64>,
    pub speed_mbps: f64,
}

/// Final summary data
#[derive(Debug, Clone, Copy)]
pub struct ProgressSummary {
    pub total_mb: f64,
    pub elapsed_secs: f64,
    pub avg_speed_mbps: f64,
}

impl ProgressTracker {
    pub fn new(
        operation: &'static str,
        module: &'static str,
        total_bytes: u64,
        log_interval_mb: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            operation,
            module,
            total_bytes,
            processed_bytes: 0,
            start_time: now,
            last_log_time: now,
            last_log_bytes: 0,
            log_interval_bytes: log_interval_mb * 1024 * 1024,
        }
    }

    /// Percentage of the known total processed so far
    pub fn percent(&self) -> Option<f64> {
        (self.total_bytes > 0)
            .then(|| (self.processed_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0))
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    /// Record processed bytes; returns an update when a log interval is crossed
    pub fn update(&mut self, bytes_added: u64) -> Option<ProgressUpdate> {
        self.processed_bytes += bytes_added;

        if self.log_interval_bytes == 0 {
            return None;
        }

        let current_interval = self.processed_bytes / self.log_interval_bytes;
        let last_interval = self.last_log_bytes / self.log_interval_bytes;
        if current_interval <= last_interval {
            return None;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_log_time).as_secs_f64();
        let bytes_since_last = self.processed_bytes - self.last_log_bytes;
        let speed_mbps = if elapsed > 0.0 {
            bytes_to_mb(bytes_since_last) / elapsed
        } else {
            0.0
        };

        self.last_log_time = now;
        self.last_log_bytes = self.processed_bytes;

        let update = ProgressUpdate {
            current_mb: bytes_to_mb(self.processed_bytes),
            total_mb: bytes_to_mb(self.total_bytes),
            percent: self.percent(),
            speed_mbps,
        };

        match update.percent {
            Some(percent) => log_debug!(
                self.module,
                "{} progress: {:.1} MB / {:.1} MB ({:.1}%) @ {:.1} MB/s",
                self.operation,
                update.current_mb,
                update.total_mb,
                percent,
                update.speed_mbps
            ),
            None => log_debug!(
                self.module,
                "{} progress: {:.1} MB @ {:.1} MB/s",
                self.operation,
                update.current_mb,
                update.speed_mbps
            ),
        }

        Some(update)
    }

    /// Log completion and return the summary
    pub fn finish(&self) -> ProgressSummary {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let total_mb = bytes_to_mb(self.processed_bytes);
        let summary = ProgressSummary {
            total_mb,
            elapsed_secs,
            avg_speed_mbps: if elapsed_secs > 0.0 {
                total_mb / elapsed_secs
            } else {
                0.0
            },
        };

        log_info!(
            self.module,
            "{} complete: {:.1} MB in {:.1}s (avg {:.1} MB/s)",
            self.operation,
            summary.total_mb,
            summary.elapsed_secs,
            summary.avg_speed_mbps
        );

        summary
    }
}
